use mr_data::record::{EncodingIdx, Pose};
use mr_protocol::ProtocolSnapshot;
use ndarray::{Array1, Array2, Array3};
use num_complex::Complex;
use thiserror::Error;
use crate::fft;
use crate::frame::Rotation;
use crate::girf::GirfResponse;

/// gradient raster time [s]
pub const DT_GRAD:f32 = 10e-6;
/// raster of the field camera the impulse response was measured on [s]
pub const DT_CAMERA:f32 = 1e-6;
pub const GAMMA_BAR:f32 = 42.577e6;

// zeros added around the gradient so the frequency-domain filtering does not
// wrap edge energy into the readout
const GRAD_PAD:usize = 10;

#[derive(Debug,Error)]
pub enum TrajError {
    #[error("cannot read impulse response file {path}: {source}")]
    Io { path:String, #[source] source:std::io::Error },
    #[error("impulse response is corrupt: {0}")]
    Format(String),
    #[error("gradient waveform must have 2 or 3 axes, got {0}")]
    GradientAxes(usize),
    #[error("gradient waveform is empty")]
    EmptyGradient,
}

/// prediction output on the ADC raster. `pred` is the corrected trajectory,
/// `base` the trajectory of the unfiltered nominal gradient (kept for
/// re-applying shift corrections to later segments), `k0` the accumulated
/// zeroth-order phase [rad]
#[derive(Clone,Debug)]
pub struct PredictedTrajectory {
    pub pred:Array2<f32>,
    pub base:Array2<f32>,
    pub k0:Array1<f32>,
}

/// predict the k-space trajectory a nominal gradient actually produces, by
/// filtering the gradient with the measured system response and integrating.
/// `gradient` is [grad_samples, dims] in T/m on the gradient raster; the
/// result is interpolated onto `n_adc` ADC samples and scaled to unitless
/// cycles/FOV
pub fn predict(gradient:&Array2<f32>,
               pose:&Pose,
               idx:&EncodingIdx,
               girf:&GirfResponse,
               snapshot:&ProtocolSnapshot,
               n_adc:usize) -> Result<PredictedTrajectory,TrajError> {

    let ng = gradient.dim().0;
    let dims = gradient.dim().1;
    if ng == 0 {
        return Err(TrajError::EmptyGradient);
    }
    if dims != 2 && dims != 3 {
        return Err(TrajError::GradientAxes(dims));
    }

    // pad with zeros on both ends and shift the time origin accordingly.
    // a 2-d gradient gets an implicit zero slice axis
    let padded = ng + 2 * GRAD_PAD;
    let mut grad = Array2::<f32>::zeros((3,padded));
    for d in 0..dims {
        for i in 0..ng {
            grad[[d,GRAD_PAD + i]] = gradient[[i,d]];
        }
    }
    let gradshift = snapshot.user.gradient_delay_s - GRAD_PAD as f32 * DT_GRAD;

    let rot = Rotation::from_pose(pose);
    let grad_dev = rot.logical_to_device(&grad);

    // frequency-domain filtering against the measured response. the gradient
    // is zero-filled up to the response length; a response shorter than the
    // gradient has to be stretched, which degrades the measurement
    let girf_sampl = girf.samples();
    let work_len = girf_sampl.max(padded);
    let resampled;
    let stretch = if girf_sampl < padded {
        log::warn!("impulse response is interpolated from {} to {} samples, check the trajectory carefully",girf_sampl,padded);
        resampled = girf.resampled(padded);
        true
    } else {
        resampled = Array3::zeros((0,0,0));
        false
    };

    let mut spectra:Vec<Vec<Complex<f32>>> = Vec::with_capacity(3);
    for d in 0..3 {
        let mut line:Vec<Complex<f32>> = (0..work_len)
            .map(|i| if i < padded { Complex::new(grad_dev[[d,i]],0.0) } else { Complex::new(0.0,0.0) })
            .collect();
        fft::fft_centered(&mut line);
        spectra.push(line);
    }

    // each output axis is the sum over input axes of gradient spectrum times
    // response, transformed back and truncated to the padded length
    let mut pred_time = Array2::<Complex<f32>>::zeros((4,padded));
    for out in 0..4 {
        let mut acc = vec![Complex::new(0.0f32,0.0);work_len];
        for input in 0..3 {
            if stretch {
                for s in 0..work_len {
                    acc[s] += spectra[input][s] * resampled[[input,out,s]];
                }
            } else {
                let h = girf.term(input,out);
                for s in 0..work_len {
                    acc[s] += spectra[input][s] * h[s];
                }
            }
        }
        fft::ifft_centered(&mut acc);
        for i in 0..padded {
            pred_time[[out,i]] = acc[i];
        }
    }

    // rotate the spatial axes back to logical axes and integrate
    let mut pred_dev = Array2::<f32>::zeros((3,padded));
    for d in 0..3 {
        for i in 0..padded {
            pred_dev[[d,i]] = pred_time[[d + 1,i]].re;
        }
    }
    let pred_log = rot.device_to_logical(&pred_dev);

    let fov = snapshot.fov_mm.x;
    let k_scale = DT_GRAD * GAMMA_BAR * 1e-3 * fov;
    let mut pred_trj = cumsum_rows(&pred_log,k_scale);
    let base_trj = cumsum_rows(&grad,k_scale);

    let mut k0_cum = vec![0.0f32;padded];
    let mut acc = 0.0f32;
    for i in 0..padded {
        acc += pred_time[[0,i]].re;
        k0_cum[i] = acc * DT_GRAD * GAMMA_BAR * 2.0 * std::f32::consts::PI;
    }

    // a 2-d trajectory sits at a constant partition offset on the slice axis
    if dims == 2 {
        let nz = snapshot.encoded_matrix.z;
        let kz = idx.step2 as f32 - (nz / 2) as f32;
        for i in 0..padded {
            pred_trj[[2,i]] = kz;
        }
    }

    // the cumulative sum integrates rectangles where the hardware plays out
    // triangles, which lands the samples half a raster step late
    let gradtime:Vec<f32> = (0..padded)
        .map(|i| DT_GRAD * i as f32 + gradshift + DT_GRAD / 2.0 - DT_CAMERA / 2.0)
        .collect();
    let dwell = snapshot.dwell_time_s();
    let adctime:Vec<f32> = (0..n_adc).map(|i| dwell * (i as f32 + 0.5)).collect();

    let mut pred = Array2::<f32>::zeros((n_adc,3));
    let mut base = Array2::<f32>::zeros((n_adc,3));
    for d in 0..3 {
        let p = interp1(&adctime,&gradtime,&pred_trj.row(d).to_vec());
        let b = interp1(&adctime,&gradtime,&base_trj.row(d).to_vec());
        for i in 0..n_adc {
            pred[[i,d]] = p[i];
            base[[i,d]] = b[i];
        }
    }
    let k0 = Array1::from_vec(interp1(&adctime,&gradtime,&k0_cum));

    Ok(PredictedTrajectory { pred, base, k0 })
}

fn cumsum_rows(grad:&Array2<f32>,scale:f32) -> Array2<f32> {
    let (rows,n) = grad.dim();
    let mut out = Array2::<f32>::zeros((rows,n));
    for r in 0..rows {
        let mut acc = 0.0f32;
        for i in 0..n {
            acc += grad[[r,i]];
            out[[r,i]] = acc * scale;
        }
    }
    out
}

/// linear interpolation of (x, y) onto the query points, clamped to the end
/// values outside the support. x must be ascending
fn interp1(xq:&[f32],x:&[f32],y:&[f32]) -> Vec<f32> {
    let n = x.len();
    xq.iter().map(|&q| {
        if q <= x[0] {
            y[0]
        } else if q >= x[n - 1] {
            y[n - 1]
        } else {
            let hi = x.partition_point(|&v| v < q).min(n - 1);
            let lo = hi - 1;
            let frac = (q - x[lo]) / (x[hi] - x[lo]);
            y[lo] + (y[hi] - y[lo]) * frac
        }
    }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use mr_protocol::{EncodingLimits, FieldOfView, Limit, MatrixSize, TrajectoryKind, UserParams};

    fn snapshot(nz:usize) -> ProtocolSnapshot {
        ProtocolSnapshot {
            trajectory: TrajectoryKind::Spiral,
            encoded_matrix: MatrixSize { x: 64, y: 64, z: nz },
            recon_matrix: MatrixSize { x: 64, y: 64, z: nz },
            fov_mm: FieldOfView { x: 192.0, y: 192.0, z: 5.0 },
            limits: EncodingLimits {
                slice: Limit { maximum: 0, center: 0 },
                ..EncodingLimits::default()
            },
            channels: 2,
            user: UserParams {
                dwell_time_us: 2.0,
                gradient_delay_s: 0.0,
                n_prediction_segments: 1,
                reference_voltage: 223.0,
            },
            arrays: HashMap::new(),
        }
    }

    fn spiral_gradient(n:usize) -> Array2<f32> {
        let mut g = Array2::<f32>::zeros((n,2));
        for i in 0..n {
            let t = i as f32 / n as f32;
            g[[i,0]] = 0.01 * (12.0 * t).sin() * t;
            g[[i,1]] = 0.01 * (12.0 * t).cos() * t;
        }
        g
    }

    #[test]
    fn unit_response_reproduces_the_nominal_trajectory() {
        let snap = snapshot(1);
        let girf = GirfResponse::identity(256,DT_GRAD);
        let idx = EncodingIdx::default();
        let out = predict(&spiral_gradient(100),&Pose::default(),&idx,&girf,&snap,400).unwrap();
        let mut max_dev = 0.0f32;
        let mut max_mag = 0.0f32;
        for i in 0..400 {
            for d in 0..2 {
                max_dev = max_dev.max((out.pred[[i,d]] - out.base[[i,d]]).abs());
                max_mag = max_mag.max(out.base[[i,d]].abs());
            }
        }
        assert!(max_mag > 1.0,"test gradient should reach well into k-space, got {}",max_mag);
        assert!(max_dev < 1e-2 * max_mag,"deviation {} vs magnitude {}",max_dev,max_mag);
    }

    #[test]
    fn unit_response_has_no_zeroth_order_phase() {
        let snap = snapshot(1);
        let girf = GirfResponse::identity(256,DT_GRAD);
        let out = predict(&spiral_gradient(100),&Pose::default(),&EncodingIdx::default(),&girf,&snap,400).unwrap();
        for v in out.k0.iter() {
            assert!(v.abs() < 1e-3);
        }
    }

    #[test]
    fn two_dimensional_gradient_gets_constant_partition_offset() {
        let snap = snapshot(8);
        let girf = GirfResponse::identity(256,DT_GRAD);
        let idx = EncodingIdx { step2: 5, ..EncodingIdx::default() };
        let out = predict(&spiral_gradient(50),&Pose::default(),&idx,&girf,&snap,100).unwrap();
        for i in 0..100 {
            assert_eq!(out.pred[[i,2]],1.0);
        }
    }

    #[test]
    fn rejects_bad_gradient_shapes() {
        let snap = snapshot(1);
        let girf = GirfResponse::identity(64,DT_GRAD);
        let empty = Array2::<f32>::zeros((0,2));
        assert!(matches!(predict(&empty,&Pose::default(),&EncodingIdx::default(),&girf,&snap,10),
                         Err(TrajError::EmptyGradient)));
        let wide = Array2::<f32>::zeros((10,4));
        assert!(matches!(predict(&wide,&Pose::default(),&EncodingIdx::default(),&girf,&snap,10),
                         Err(TrajError::GradientAxes(4))));
    }

    #[test]
    fn interpolation_clamps_and_blends() {
        let x = vec![0.0,1.0,2.0];
        let y = vec![0.0,10.0,20.0];
        let out = interp1(&[-1.0,0.5,1.5,3.0],&x,&y);
        assert_eq!(out,vec![0.0,5.0,15.0,20.0]);
    }
}
