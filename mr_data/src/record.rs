use ndarray::{s, Array1, Array2, Array3, Array4};
use num_complex::Complex;
use thiserror::Error;

#[derive(Debug,Error)]
pub enum RecordError {
    #[error("segment {got} arrived where segment {expected} was expected")]
    SegmentOrder { expected:u16, got:u16 },
    #[error("segment payload is {got:?} but the readout was opened with {expected:?}")]
    SegmentShape { expected:(usize,usize), got:(usize,usize) },
    #[error("readout finalized after {filled} of {expected} segments")]
    Unfinished { filled:u16, expected:u16 },
}

/// encoding counters attached to every acquisition record
#[derive(Clone,Copy,Debug,Default,PartialEq,Eq)]
pub struct EncodingIdx {
    pub slice:u16,
    pub contrast:u16,
    pub phase:u16,
    pub repetition:u16,
    pub average:u16,
    pub set:u16,
    pub segment:u16,
    pub step1:u16,
    pub step2:u16,
}

/// closed role variant. the scanner sets exactly one of these per record;
/// completion flags combine with any of them
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum AcqRole {
    Noise,
    Dummy,
    PhaseNavigator,
    Calibration,
    Imaging,
}

#[derive(Clone,Copy,Debug,Default,PartialEq,Eq)]
pub struct CompletionFlags {
    pub last_in_slice:bool,
    pub last_in_repetition:bool,
    pub last_in_measurement:bool,
}

impl CompletionFlags {
    pub fn completes_group(&self) -> bool {
        self.last_in_slice || self.last_in_repetition
    }

    pub fn merge(&mut self,other:&CompletionFlags) {
        self.last_in_slice |= other.last_in_slice;
        self.last_in_repetition |= other.last_in_repetition;
        self.last_in_measurement |= other.last_in_measurement;
    }
}

/// acquisition pose: direction cosines of the logical axes plus the slice
/// position in the patient coordinate system [mm]
#[derive(Clone,Copy,Debug)]
pub struct Pose {
    pub read_dir:[f32;3],
    pub phase_dir:[f32;3],
    pub slice_dir:[f32;3],
    pub position:[f32;3],
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            read_dir: [1.0,0.0,0.0],
            phase_dir: [0.0,1.0,0.0],
            slice_dir: [0.0,0.0,1.0],
            position: [0.0,0.0,0.0],
        }
    }
}

/// what the protocol attached to a readout. an explicit variant instead of
/// sniffing array shapes: either nothing (cartesian), a ready trajectory in
/// unitless cycles/FOV, or a nominal gradient waveform [T/m] on the fixed
/// gradient raster that still has to be run through the predictor
#[derive(Clone,Debug)]
pub enum TrajectorySource {
    None,
    // [samples, dims]
    Measured(Array2<f32>),
    // [grad_samples, dims]
    Gradient(Array2<f32>),
}

/// one readout: complex samples per channel plus everything needed to place
/// them in k-space. immutable after routing except for the in-place segment
/// fill handled by InProgressReadout
#[derive(Clone,Debug)]
pub struct AcquisitionRecord {
    pub idx:EncodingIdx,
    pub role:AcqRole,
    pub flags:CompletionFlags,
    pub pose:Pose,
    // [channels, samples]
    pub data:Array2<Complex<f32>>,
    // [samples, 3] unitless cycles/FOV, populated once predicted or measured
    pub traj:Option<Array2<f32>>,
    // zeroth-order phase track [rad] on the ADC raster
    pub k0:Option<Array1<f32>>,
    pub traj_source:TrajectorySource,
}

impl AcquisitionRecord {

    pub fn new(idx:EncodingIdx,role:AcqRole,data:Array2<Complex<f32>>) -> Self {
        Self {
            idx,
            role,
            flags: CompletionFlags::default(),
            pose: Pose::default(),
            data,
            traj: None,
            k0: None,
            traj_source: TrajectorySource::None,
        }
    }

    pub fn channels(&self) -> usize {
        self.data.dim().0
    }

    pub fn samples(&self) -> usize {
        self.data.dim().1
    }
}

/// reassembly of a multi-segment readout with owned, pre-sized sample
/// storage. segments must arrive in order starting at 1 (the segment-0 record
/// seeds the readout); the record is frozen again on finalize
#[derive(Debug)]
pub struct InProgressReadout {
    record:AcquisitionRecord,
    samples_per_segment:usize,
    n_segments:u16,
    next_segment:u16,
}

impl InProgressReadout {

    pub fn begin(mut seed:AcquisitionRecord,n_segments:u16) -> Self {
        let (nc,ns) = seed.data.dim();
        if n_segments > 1 {
            let mut full = Array2::<Complex<f32>>::zeros((nc,ns * n_segments as usize));
            full.slice_mut(s![..,..ns]).assign(&seed.data);
            seed.data = full;
        }
        Self {
            record: seed,
            samples_per_segment: ns,
            n_segments,
            next_segment: 1,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.next_segment == self.n_segments
    }

    /// write a later segment's payload into the same channel rows at the
    /// segment's sample offset, and fold its completion flags in
    pub fn write_segment(&mut self,seg:&AcquisitionRecord) -> Result<(),RecordError> {
        if seg.idx.segment != self.next_segment || self.is_complete() {
            return Err(RecordError::SegmentOrder {
                expected: self.next_segment,
                got: seg.idx.segment,
            });
        }
        let expected = (self.record.data.dim().0,self.samples_per_segment);
        if seg.data.dim() != expected {
            return Err(RecordError::SegmentShape {
                expected,
                got: seg.data.dim(),
            });
        }
        let lo = seg.idx.segment as usize * self.samples_per_segment;
        let hi = lo + self.samples_per_segment;
        self.record.data.slice_mut(s![..,lo..hi]).assign(&seg.data);
        self.record.flags.merge(&seg.flags);
        self.next_segment += 1;
        Ok(())
    }

    pub fn finalize(self) -> Result<AcquisitionRecord,RecordError> {
        if !self.is_complete() {
            return Err(RecordError::Unfinished {
                filled: self.next_segment,
                expected: self.n_segments,
            });
        }
        Ok(self.record)
    }
}

/// sensitivity map for one slice as produced by the calibration transform,
/// [nx, ny, nz, channels]
pub type SensitivityMap = Array4<Complex<f32>>;

#[derive(Clone,Debug)]
pub struct ImageVolume {
    pub slice:u16,
    pub contrast:u16,
    pub data:Array3<Complex<f32>>,
}

#[derive(Clone,Debug)]
pub struct Waveform {
    pub waveform_id:u16,
    pub time_stamp:u64,
    // [channels, samples]
    pub data:Array2<f32>,
}

/// one item of the ordered input stream. the core consumes acquisitions;
/// images and waveforms pass through to the output sink untouched
#[derive(Debug)]
pub enum StreamItem {
    Acquisition(AcquisitionRecord),
    Image(ImageVolume),
    Waveform(Waveform),
    Close,
}
