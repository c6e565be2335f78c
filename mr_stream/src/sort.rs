use mr_data::record::AcquisitionRecord;
use mr_protocol::MatrixSize;
use ndarray::{Array2, Array3, Array4};
use num_complex::Complex;
use std::f32::consts::PI;
use traj_predict::fft;
use crate::error::StreamError;
use crate::whiten::NoiseModel;

/// non-uniform sorting output in collaborator axis order:
/// samples [1, cols, acquisitions, channels], trajectory [3, cols, acquisitions]
#[derive(Clone,Debug)]
pub struct SortedNonUniform {
    pub samples:Array4<Complex<f32>>,
    pub traj:Array3<f32>,
}

/// concatenate a completed group's readouts and matching trajectories in
/// acquisition order, whitening if a noise model exists. the first two
/// trajectory axes are swapped for the collaborator's orientation convention
pub fn sort_nonuniform(group:&[AcquisitionRecord],
                       model:Option<&NoiseModel>,
                       ringing_factor:Option<f32>) -> Result<SortedNonUniform,StreamError> {

    let first = group.first()
        .ok_or_else(|| StreamError::Sequencing("cannot sort an empty group".to_string()))?;
    let cols = first.samples();
    let nc = first.channels();
    let nacq = group.len();

    let mut samples = Array4::<Complex<f32>>::zeros((1,cols,nacq,nc));
    let mut traj = Array3::<f32>::zeros((3,cols,nacq));

    for (a,rec) in group.iter().enumerate() {
        if rec.samples() != cols || rec.channels() != nc {
            return Err(StreamError::Sequencing(format!(
                "readout {} is {:?}, group was opened with ({},{})",a,rec.data.dim(),nc,cols)));
        }
        let t = rec.traj.as_ref().ok_or_else(|| StreamError::Sequencing(format!(
            "readout {} reached the non-uniform sorter without a trajectory",a)))?;
        if t.dim() != (cols,3) {
            return Err(StreamError::Sequencing(format!(
                "trajectory of readout {} is {:?}, expected ({},3)",a,t.dim(),cols)));
        }
        let data = match model {
            Some(m) => m.apply(&rec.data),
            None => rec.data.clone(),
        };
        for s in 0..cols {
            // x and y switched for correct collaborator orientation
            traj[[0,s,a]] = t[[s,1]];
            traj[[1,s,a]] = t[[s,0]];
            traj[[2,s,a]] = t[[s,2]];
            for c in 0..nc {
                samples[[0,s,a,c]] = data[[c,s]];
            }
        }
    }

    if let Some(factor) = ringing_factor {
        ringing_filter(&mut samples,&traj,factor);
    }

    Ok(SortedNonUniform { samples, traj })
}

/// attenuate samples near the outer edge of the trajectory with a raised
/// cosine to suppress ringing from the hard k-space cutoff
fn ringing_filter(samples:&mut Array4<Complex<f32>>,traj:&Array3<f32>,factor:f32) {
    let (_,cols,nacq,nc) = samples.dim();
    let mut kmax = 0.0f32;
    for a in 0..nacq {
        for s in 0..cols {
            let r = (traj[[0,s,a]].powi(2) + traj[[1,s,a]].powi(2) + traj[[2,s,a]].powi(2)).sqrt();
            kmax = kmax.max(r);
        }
    }
    let edge = factor * kmax;
    let width = kmax - edge;
    if kmax <= 0.0 || width <= 0.0 {
        return;
    }
    for a in 0..nacq {
        for s in 0..cols {
            let r = (traj[[0,s,a]].powi(2) + traj[[1,s,a]].powi(2) + traj[[2,s,a]].powi(2)).sqrt();
            if r <= edge {
                continue;
            }
            let x = ((r - edge) / width).min(1.0);
            let w = 0.5 * (1.0 + (PI * x).cos());
            for c in 0..nc {
                samples[[0,s,a,c]] *= w;
            }
        }
    }
}

/// accumulate a completed group into a dense zero-filled k-space array
/// [channels, freq, phase, partition], averaging repeated cells by their hit
/// count. cells never visited stay zero: undersampled k-space is expected,
/// not an error
pub fn sort_cartesian(group:&[AcquisitionRecord],
                      model:Option<&NoiseModel>,
                      matrix:&MatrixSize,
                      channels:usize,
                      zf_around_center:bool) -> Result<Array4<Complex<f32>>,StreamError> {

    if group.is_empty() {
        return Err(StreamError::Sequencing("cannot sort an empty group".to_string()));
    }
    let (nx,ny,nz) = (matrix.x,matrix.y,matrix.z);
    let mut kspace = Array4::<Complex<f32>>::zeros((channels,nx,ny,nz));
    let mut counter = Array2::<u32>::zeros((ny,nz));

    let enc1_max = group.iter().map(|r| r.idx.step1).max().unwrap_or(0) as isize;
    let enc2_max = group.iter().map(|r| r.idx.step2).max().unwrap_or(0) as isize;

    log::debug!("cartesian sort: {} readouts into {}x{}x{}, enc1 max {}, enc2 max {}",
        group.len(),nx,ny,nz,enc1_max,enc2_max);

    for rec in group {
        if rec.channels() != channels {
            return Err(StreamError::Protocol(format!(
                "readout has {} channels, protocol says {}",rec.channels(),channels)));
        }
        let ncol = rec.samples();
        if ncol > nx {
            return Err(StreamError::Protocol(format!(
                "readout has {} samples, frequency axis holds {}",ncol,nx)));
        }
        // narrower readouts land centered on the frequency axis
        let col0 = nx / 2 - ncol / 2;

        let mut enc1 = rec.idx.step1 as isize;
        let mut enc2 = rec.idx.step2 as isize;
        if zf_around_center {
            // place a narrower acquisition into the center of the target
            // grid, assuming a symmetric acquisition
            enc1 += ny as isize / 2 - (enc1_max + 1) / 2;
            enc2 += nz as isize / 2 - (enc2_max + 1) / 2;
        }
        if enc1 < 0 || enc1 >= ny as isize || enc2 < 0 || enc2 >= nz as isize {
            return Err(StreamError::Protocol(format!(
                "encoding step ({},{}) is outside the {}x{} grid",enc1,enc2,ny,nz)));
        }
        let (e1,e2) = (enc1 as usize,enc2 as usize);

        let data = match model {
            Some(m) => m.apply(&rec.data),
            None => rec.data.clone(),
        };
        for c in 0..channels {
            for s in 0..ncol {
                kspace[[c,col0 + s,e1,e2]] += data[[c,s]];
            }
        }
        counter[[e1,e2]] += 1;
    }

    // average repeated acquisitions of the same cell
    for e1 in 0..ny {
        for e2 in 0..nz {
            let hits = counter[[e1,e2]];
            if hits > 1 {
                let inv = 1.0 / hits as f32;
                for c in 0..channels {
                    for x in 0..nx {
                        kspace[[c,x,e1,e2]] *= inv;
                    }
                }
            }
        }
    }
    Ok(kspace)
}

/// crop the readout oversampling: transform the frequency axis to image
/// space, keep the center half, transform back
pub fn remove_readout_oversampling(kspace:Array4<Complex<f32>>) -> Array4<Complex<f32>> {
    let (nc,nx,ny,nz) = kspace.dim();
    let keep = nx / 2;
    let lo = nx / 4;
    let mut out = Array4::<Complex<f32>>::zeros((nc,keep,ny,nz));
    for c in 0..nc {
        for y in 0..ny {
            for z in 0..nz {
                let mut line:Vec<Complex<f32>> = (0..nx).map(|x| kspace[[c,x,y,z]]).collect();
                fft::ifft_centered(&mut line);
                let mut crop = line[lo..lo + keep].to_vec();
                fft::fft_centered(&mut crop);
                for x in 0..keep {
                    out[[c,x,y,z]] = crop[x];
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mr_data::record::{AcqRole, EncodingIdx};

    fn imaging_record(step1:u16,value:f32,ncol:usize) -> AcquisitionRecord {
        let idx = EncodingIdx { step1, ..EncodingIdx::default() };
        let data = Array2::from_elem((1,ncol),Complex::new(value,0.0));
        AcquisitionRecord::new(idx,AcqRole::Imaging,data)
    }

    fn matrix(nx:usize,ny:usize) -> MatrixSize {
        MatrixSize { x: nx, y: ny, z: 1 }
    }

    #[test]
    fn exact_tiling_is_direct_placement() {
        let group:Vec<AcquisitionRecord> = (0..4).map(|i| imaging_record(i,i as f32 + 1.0,8)).collect();
        let k = sort_cartesian(&group,None,&matrix(8,4),1,false).unwrap();
        for y in 0..4 {
            for x in 0..8 {
                assert_eq!(k[[0,x,y,0]],Complex::new(y as f32 + 1.0,0.0));
            }
        }
    }

    #[test]
    fn repeated_lines_are_averaged() {
        let group = vec![
            imaging_record(1,2.0,8),
            imaging_record(1,4.0,8),
            imaging_record(1,6.0,8),
        ];
        let k = sort_cartesian(&group,None,&matrix(8,4),1,false).unwrap();
        for x in 0..8 {
            assert_eq!(k[[0,x,1,0]],Complex::new(4.0,0.0));
        }
        // untouched cells stay zero
        for x in 0..8 {
            assert_eq!(k[[0,x,0,0]],Complex::new(0.0,0.0));
        }
    }

    #[test]
    fn narrow_calibration_lands_in_the_center() {
        let group:Vec<AcquisitionRecord> = (0..2).map(|i| imaging_record(i,1.0,4)).collect();
        let k = sort_cartesian(&group,None,&matrix(8,8),1,true).unwrap();
        // 4 samples centered on an 8-wide frequency axis
        for y in 0..8 {
            assert_eq!(k[[0,0,y,0]],Complex::new(0.0,0.0));
            assert_eq!(k[[0,7,y,0]],Complex::new(0.0,0.0));
        }
        // two lines recentered around the phase center
        assert_eq!(k[[0,4,3,0]],Complex::new(1.0,0.0));
        assert_eq!(k[[0,4,4,0]],Complex::new(1.0,0.0));
        assert_eq!(k[[0,4,0,0]],Complex::new(0.0,0.0));
    }

    fn spiral_record(value:f32,ns:usize) -> AcquisitionRecord {
        let mut rec = imaging_record(0,value,ns);
        let mut t = Array2::<f32>::zeros((ns,3));
        for s in 0..ns {
            t[[s,0]] = s as f32;
            t[[s,1]] = -(s as f32);
        }
        rec.traj = Some(t);
        rec
    }

    #[test]
    fn nonuniform_output_shapes_and_axis_swap() {
        let group = vec![spiral_record(1.0,6),spiral_record(2.0,6)];
        let out = sort_nonuniform(&group,None,None).unwrap();
        assert_eq!(out.samples.dim(),(1,6,2,1));
        assert_eq!(out.traj.dim(),(3,6,2));
        // axis 0 of the output carries the record's second trajectory axis
        assert_eq!(out.traj[[0,3,0]],-3.0);
        assert_eq!(out.traj[[1,3,0]],3.0);
        assert_eq!(out.samples[[0,2,1,0]],Complex::new(2.0,0.0));
    }

    #[test]
    fn missing_trajectory_is_a_sequencing_error() {
        let group = vec![imaging_record(0,1.0,6)];
        assert!(matches!(sort_nonuniform(&group,None,None),Err(StreamError::Sequencing(_))));
    }

    #[test]
    fn ringing_filter_attenuates_only_the_edge() {
        let group = vec![spiral_record(1.0,8)];
        let unfiltered = sort_nonuniform(&group,None,None).unwrap();
        let filtered = sort_nonuniform(&group,None,Some(0.5)).unwrap();
        // the innermost samples are untouched, the outermost is attenuated
        assert_eq!(filtered.samples[[0,0,0,0]],unfiltered.samples[[0,0,0,0]]);
        assert_eq!(filtered.samples[[0,2,0,0]],unfiltered.samples[[0,2,0,0]]);
        let last = filtered.samples[[0,7,0,0]].norm();
        assert!(last < 0.1,"edge sample should be strongly attenuated, got {}",last);
    }

    #[test]
    fn oversampling_removal_halves_the_readout_axis() {
        let mut kspace = Array4::<Complex<f32>>::zeros((1,16,2,1));
        for x in 0..16 {
            for y in 0..2 {
                kspace[[0,x,y,0]] = Complex::new(3.0,0.0);
            }
        }
        let out = remove_readout_oversampling(kspace);
        assert_eq!(out.dim(),(1,8,2,1));
        // a flat line transforms to a centered impulse, survives the crop and
        // comes back flat
        for x in 0..8 {
            assert!((out[[0,x,0,0]] - Complex::new(3.0,0.0)).norm() < 1e-4);
        }
    }
}
