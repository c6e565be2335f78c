use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// the scanner frontend addresses readout samples with a 16-bit counter,
// so a reassembled readout can never exceed this
pub const MAX_ADC_SAMPLES:usize = u16::MAX as usize;

#[derive(Debug,Error)]
pub enum ProtocolError {
    #[error("cannot read protocol file {path}: {source}")]
    Io { path:String, #[source] source:std::io::Error },
    #[error("protocol file is corrupt: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("protocol mismatch: {0}")]
    Mismatch(String),
}

#[derive(Clone,Copy,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub enum TrajectoryKind {
    Cartesian,
    Spiral,
}

#[derive(Clone,Copy,Debug,Default,Serialize,Deserialize)]
pub struct Limit {
    pub maximum:u16,
    pub center:u16,
}

#[derive(Clone,Copy,Debug,Default,Serialize,Deserialize)]
pub struct EncodingLimits {
    pub slice:Limit,
    pub contrast:Limit,
    pub phase:Limit,
    pub repetition:Limit,
    pub average:Limit,
    pub set:Limit,
    pub segment:Limit,
    pub kspace_encoding_step_1:Limit,
    pub kspace_encoding_step_2:Limit,
}

#[derive(Clone,Copy,Debug,Serialize,Deserialize)]
pub struct MatrixSize {
    pub x:usize,
    pub y:usize,
    pub z:usize,
}

#[derive(Clone,Copy,Debug,Serialize,Deserialize)]
pub struct FieldOfView {
    pub x:f32,
    pub y:f32,
    pub z:f32,
}

/// user-defined scalar parameters carried over from the sequence protocol.
/// indices match the original protocol ordering but are named here so the
/// router never has to count array slots.
#[derive(Clone,Copy,Debug,Serialize,Deserialize)]
pub struct UserParams {
    pub dwell_time_us:f32,
    pub gradient_delay_s:f32,
    pub n_prediction_segments:u16,
    pub reference_voltage:f32,
}

/// immutable configuration snapshot read once at stream start. everything the
/// router and sorter need to size their buffers comes from here.
#[derive(Clone,Debug,Serialize,Deserialize)]
pub struct ProtocolSnapshot {
    pub trajectory:TrajectoryKind,
    pub encoded_matrix:MatrixSize,
    pub recon_matrix:MatrixSize,
    pub fov_mm:FieldOfView,
    pub limits:EncodingLimits,
    pub channels:usize,
    pub user:UserParams,
    // auxiliary named arrays appended to the protocol (diffusion b-values,
    // gradient directions, ...). flat storage, shape is the consumer's concern
    #[serde(default)]
    pub arrays:HashMap<String,Vec<f32>>,
}

impl ProtocolSnapshot {

    pub fn from_file(path:&Path) -> Result<Self,ProtocolError> {
        let mut f = File::open(path).map_err(|e| ProtocolError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut s = String::new();
        f.read_to_string(&mut s).map_err(|e| ProtocolError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let snapshot:ProtocolSnapshot = serde_json::from_str(&s)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn validate(&self) -> Result<(),ProtocolError> {
        if self.channels == 0 {
            return Err(ProtocolError::Mismatch("receiver channel count is 0".to_string()));
        }
        if self.encoded_matrix.x == 0 || self.encoded_matrix.y == 0 || self.encoded_matrix.z == 0 {
            return Err(ProtocolError::Mismatch(format!("encoded matrix has a zero dimension: {:?}",self.encoded_matrix)));
        }
        if self.user.dwell_time_us <= 0.0 {
            return Err(ProtocolError::Mismatch(format!("non-positive dwell time: {}",self.user.dwell_time_us)));
        }
        if self.n_segments() == 0 {
            return Err(ProtocolError::Mismatch("segment count is 0".to_string()));
        }
        Ok(())
    }

    pub fn n_slices(&self) -> usize {
        self.limits.slice.maximum as usize + 1
    }

    pub fn n_contrasts(&self) -> usize {
        self.limits.contrast.maximum as usize + 1
    }

    pub fn n_segments(&self) -> usize {
        // the segment encoding limit is the preferred source, the user
        // parameter is kept for compatibility with older protocols
        let n = self.limits.segment.maximum as usize + 1;
        if n > 1 {
            n
        } else {
            (self.user.n_prediction_segments as usize).max(1)
        }
    }

    pub fn dwell_time_s(&self) -> f32 {
        1e-6 * self.user.dwell_time_us
    }

    /// in-plane voxel size in mm. the slice axis stays at 1 so position
    /// shifts along it pass through unscaled
    pub fn resolution_mm(&self) -> [f32;3] {
        [
            self.fov_mm.x / self.encoded_matrix.x as f32,
            self.fov_mm.y / self.encoded_matrix.y as f32,
            1.0,
        ]
    }

    /// full readout length once all ADC segments are stitched together
    pub fn full_samples(&self,samples_per_segment:usize) -> Result<usize,ProtocolError> {
        let full = samples_per_segment * self.n_segments();
        if full > MAX_ADC_SAMPLES {
            return Err(ProtocolError::Mismatch(format!(
                "number of samples {} exceeds the addressable maximum of {}",full,MAX_ADC_SAMPLES)));
        }
        Ok(full)
    }

    pub fn array(&self,key:&str) -> Option<&[f32]> {
        self.arrays.get(key).map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ProtocolSnapshot {
        ProtocolSnapshot {
            trajectory: TrajectoryKind::Spiral,
            encoded_matrix: MatrixSize { x: 64, y: 64, z: 1 },
            recon_matrix: MatrixSize { x: 64, y: 64, z: 1 },
            fov_mm: FieldOfView { x: 192.0, y: 192.0, z: 5.0 },
            limits: EncodingLimits {
                slice: Limit { maximum: 3, center: 0 },
                contrast: Limit { maximum: 1, center: 0 },
                segment: Limit { maximum: 3, center: 0 },
                ..EncodingLimits::default()
            },
            channels: 4,
            user: UserParams {
                dwell_time_us: 2.0,
                gradient_delay_s: 0.0,
                n_prediction_segments: 1,
                reference_voltage: 223.0,
            },
            arrays: HashMap::new(),
        }
    }

    #[test]
    fn limits_to_counts() {
        let p = snapshot();
        assert_eq!(p.n_slices(),4);
        assert_eq!(p.n_contrasts(),2);
        assert_eq!(p.n_segments(),4);
    }

    #[test]
    fn full_samples_respects_addressable_max() {
        let p = snapshot();
        assert_eq!(p.full_samples(1000).unwrap(),4000);
        assert!(p.full_samples(20000).is_err());
    }

    #[test]
    fn validation_rejects_zero_channels() {
        let mut p = snapshot();
        p.channels = 0;
        assert!(matches!(p.validate(),Err(ProtocolError::Mismatch(_))));
    }

    #[test]
    fn json_round_trip() {
        let p = snapshot();
        let s = serde_json::to_string_pretty(&p).unwrap();
        let q:ProtocolSnapshot = serde_json::from_str(&s).unwrap();
        assert_eq!(q.channels,p.channels);
        assert_eq!(q.n_segments(),p.n_segments());
        assert_eq!(q.resolution_mm(),p.resolution_mm());
    }

    #[test]
    fn resolution_keeps_slice_axis_unscaled() {
        let p = snapshot();
        let res = p.resolution_mm();
        assert_eq!(res[0],3.0);
        assert_eq!(res[1],3.0);
        assert_eq!(res[2],1.0);
    }
}
