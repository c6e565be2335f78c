use ndarray::Array2;
use num_complex::Complex;
use std::f32::consts::PI;
use crate::error::StreamError;

/// re-apply the field-of-view shift correction onto a reassembled readout.
/// segments of a logical readout measure gradient shape but not absolute
/// position, so the phase ramp implied by the deviation between this
/// readout's predicted trajectory and the stored base trajectory, scaled by
/// the spatial shift in voxels, has to be multiplied back onto the samples.
/// `shift` is in voxels per axis, `matrix` the encoded matrix size (a zero
/// entry skips that axis)
pub fn reapply_shift(data:&mut Array2<Complex<f32>>,
                     pred:&Array2<f32>,
                     base:&Array2<f32>,
                     shift:[f32;3],
                     matrix:[usize;3]) -> Result<(),StreamError> {

    if pred.dim() != base.dim() {
        return Err(StreamError::Sequencing(format!(
            "predicted trajectory {:?} and base trajectory {:?} disagree",pred.dim(),base.dim())));
    }
    let (nc,ns) = data.dim();
    if pred.dim().0 != ns || pred.dim().1 != 3 {
        return Err(StreamError::Sequencing(format!(
            "trajectory is {:?} but the readout holds {} samples",pred.dim(),ns)));
    }

    for s in 0..ns {
        let mut phase = 0.0f32;
        for d in 0..3 {
            if matrix[d] == 0 {
                continue;
            }
            phase += shift[d] * (pred[[s,d]] - base[[s,d]]) / matrix[d] as f32;
        }
        phase *= 2.0 * PI;
        if phase == 0.0 {
            continue;
        }
        let factor = Complex::from_polar(1.0,-phase);
        for c in 0..nc {
            data[[c,s]] *= factor;
        }
    }
    Ok(())
}
