use mr_data::record::SensitivityMap;
use ndarray::{Array3, Array4};
use num_complex::Complex;
use thiserror::Error;

#[derive(Debug,Error)]
#[error("{0}")]
pub struct EngineError(pub String);

/// black-box reconstruction collaborator. the core hands it sorted data and
/// takes back image or sensitivity arrays; what happens in between (NUFFT,
/// SENSE, parallel-imaging calibration) is the collaborator's business.
/// any failure is fatal for the group being processed
pub trait ReconEngine {
    /// image from a non-uniform (trajectory, samples) pair, optionally with a
    /// sensitivity map for the slice
    fn reconstruct(&self,traj:&Array3<f32>,samples:&Array4<Complex<f32>>,sens:Option<&SensitivityMap>) -> Result<Array3<Complex<f32>>,EngineError>;

    /// image from a structured cartesian k-space array
    fn reconstruct_cartesian(&self,kspace:&Array4<Complex<f32>>) -> Result<Array3<Complex<f32>>,EngineError>;

    /// per-channel sensitivity calibration from a structured calibration scan
    fn calibrate(&self,kspace:&Array4<Complex<f32>>) -> Result<SensitivityMap,EngineError>;

    /// fallback sensitivity estimate from imaging data when no calibration
    /// scan was acquired for the slice
    fn sens_from_raw(&self,traj:&Array3<f32>,samples:&Array4<Complex<f32>>) -> Result<SensitivityMap,EngineError>;
}
