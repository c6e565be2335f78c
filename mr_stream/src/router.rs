use mr_data::record::{AcqRole, AcquisitionRecord, ImageVolume, InProgressReadout, SensitivityMap, TrajectorySource};
use mr_protocol::{ProtocolSnapshot, TrajectoryKind};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use traj_predict::girf::GirfResponse;
use traj_predict::frame::Rotation;
use traj_predict::predict::predict;
use crate::engine::ReconEngine;
use crate::error::StreamError;
use crate::reassemble;
use crate::sort;
use crate::whiten::NoiseModel;

/// what to do with non-empty, unflagged groups at stream end. the condition
/// is always reported before the policy applies
#[derive(Clone,Copy,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub enum TrailingPolicy {
    Discard,
    Process,
}

impl Default for TrailingPolicy {
    fn default() -> Self {
        TrailingPolicy::Discard
    }
}

#[derive(Clone,Copy,Debug,Serialize,Deserialize)]
pub struct RouterConfig {
    pub trailing_policy:TrailingPolicy,
    /// raised-cosine edge attenuation of the outermost trajectory samples
    pub ringing_filter_factor:Option<f32>,
    /// crop readout oversampling from calibration scans
    pub remove_oversampling:bool,
    /// estimate a sensitivity map from imaging data when a slice completes
    /// without a calibration scan
    pub derive_sens_from_raw:bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            trailing_policy: TrailingPolicy::default(),
            ringing_filter_factor: Some(0.95),
            remove_oversampling: true,
            derive_sens_from_raw: false,
        }
    }
}

/// a group handed off by the router. the router's buffer for this
/// (slice, contrast) cell is already empty again when this exists
#[derive(Debug)]
pub struct CompletedGroup {
    pub slice:u16,
    pub contrast:u16,
    pub unflagged:bool,
    pub records:Vec<AcquisitionRecord>,
}

/// per-readout trajectory state: set once at segment 0, read when the last
/// segment is reassembled, then discarded with the open readout
struct TrajectoryState {
    pred:Array2<f32>,
    base:Array2<f32>,
    shift:[f32;3],
}

struct OpenReadout {
    readout:InProgressReadout,
    traj:Option<TrajectoryState>,
}

/// the streaming state machine. classifies every incoming acquisition,
/// maintains per-slice/contrast buffers, stitches segmented readouts and
/// decides when a group is complete. single consumer of one ordered stream
pub struct AcquisitionRouter<E:ReconEngine> {
    snapshot:ProtocolSnapshot,
    girf:Option<GirfResponse>,
    config:RouterConfig,
    engine:E,
    noise_buffer:Vec<AcquisitionRecord>,
    noise_model:Option<NoiseModel>,
    // [slice][contrast]
    groups:Vec<Vec<Vec<AcquisitionRecord>>>,
    open:Vec<Vec<Option<OpenReadout>>>,
    // [slice]
    acs:Vec<Vec<AcquisitionRecord>>,
    sensmaps:Vec<Option<SensitivityMap>>,
    dummies:usize,
    navigators:usize,
    dropped_readouts:usize,
}

impl<E:ReconEngine> AcquisitionRouter<E> {

    pub fn new(snapshot:ProtocolSnapshot,girf:Option<GirfResponse>,config:RouterConfig,engine:E) -> Result<Self,StreamError> {
        snapshot.validate()?;
        let n_slc = snapshot.n_slices();
        let n_contr = snapshot.n_contrasts();
        let groups = (0..n_slc).map(|_| (0..n_contr).map(|_| Vec::new()).collect()).collect();
        let open = (0..n_slc).map(|_| (0..n_contr).map(|_| None).collect()).collect();
        let acs = (0..n_slc).map(|_| Vec::new()).collect();
        let sensmaps = (0..n_slc).map(|_| None).collect();
        Ok(Self {
            snapshot,
            girf,
            config,
            engine,
            noise_buffer: Vec::new(),
            noise_model: None,
            groups,
            open,
            acs,
            sensmaps,
            dummies: 0,
            navigators: 0,
            dropped_readouts: 0,
        })
    }

    pub fn noise_model(&self) -> Option<&NoiseModel> {
        self.noise_model.as_ref()
    }

    pub fn sensitivity(&self,slice:u16) -> Option<&SensitivityMap> {
        self.sensmaps.get(slice as usize).and_then(|m| m.as_ref())
    }

    pub fn snapshot(&self) -> &ProtocolSnapshot {
        &self.snapshot
    }

    pub fn engine_ref(&self) -> &E {
        &self.engine
    }

    pub fn dropped_readouts(&self) -> usize {
        self.dropped_readouts
    }

    /// classify and buffer one incoming record, returning a completed group
    /// when this record carried a completion flag
    pub fn route(&mut self,record:AcquisitionRecord) -> Result<Option<CompletedGroup>,StreamError> {

        // the first non-noise record after a run of noise records triggers
        // the one-shot decorrelation matrix build
        if record.role != AcqRole::Noise && !self.noise_buffer.is_empty() && self.noise_model.is_none() {
            let model = NoiseModel::build(&self.noise_buffer)?;
            log::info!("noise decorrelation matrix built from {} records",self.noise_buffer.len());
            self.noise_model = Some(model);
            self.noise_buffer.clear();
        }

        match record.role {
            AcqRole::Noise => {
                if self.noise_model.is_none() {
                    self.noise_buffer.push(record);
                } else {
                    log::debug!("noise record after the decorrelation matrix was built, discarded");
                }
                Ok(None)
            }
            AcqRole::Dummy => {
                self.dummies += 1;
                log::debug!("dummy scan discarded ({} so far)",self.dummies);
                Ok(None)
            }
            AcqRole::PhaseNavigator => {
                self.navigators += 1;
                log::debug!("phase navigator discarded ({} so far)",self.navigators);
                Ok(None)
            }
            AcqRole::Calibration => self.route_calibration(record),
            AcqRole::Imaging => self.route_imaging(record),
        }
    }

    fn route_calibration(&mut self,record:AcquisitionRecord) -> Result<Option<CompletedGroup>,StreamError> {
        let slice = record.idx.slice as usize;
        if slice >= self.acs.len() {
            return Err(StreamError::Protocol(format!(
                "calibration slice {} outside the protocol's {} slices",slice,self.acs.len())));
        }
        let last = record.flags.last_in_slice;
        self.acs[slice].push(record);
        if last {
            let buffer = std::mem::take(&mut self.acs[slice]);
            log::info!("calibrating slice {} from {} reference readouts",slice,buffer.len());
            let mut kspace = sort::sort_cartesian(&buffer,self.noise_model.as_ref(),
                &self.snapshot.encoded_matrix,self.snapshot.channels,true)?;
            if self.config.remove_oversampling {
                kspace = sort::remove_readout_oversampling(kspace);
            }
            let map = self.engine.calibrate(&kspace)
                .map_err(|e| StreamError::Collaborator(e.to_string()))?;
            self.sensmaps[slice] = Some(map);
        }
        Ok(None)
    }

    fn route_imaging(&mut self,record:AcquisitionRecord) -> Result<Option<CompletedGroup>,StreamError> {
        let slice = record.idx.slice as usize;
        let contrast = record.idx.contrast as usize;
        if slice >= self.groups.len() || contrast >= self.groups[slice].len() {
            return Err(StreamError::Protocol(format!(
                "imaging record at slice {} contrast {} outside the protocol limits",slice,contrast)));
        }

        self.fill_missing_sensitivities();

        let nseg = self.snapshot.n_segments() as u16;
        if record.idx.segment == 0 {
            if self.open[slice][contrast].take().is_some() {
                self.dropped_readouts += 1;
                log::error!("readout at slice {} contrast {} never saw its last segment, dropped",slice,contrast);
            }
            let opened = self.open_readout(record,nseg)?;
            self.open[slice][contrast] = Some(opened);
        } else {
            match self.open[slice][contrast].as_mut() {
                None => {
                    self.dropped_readouts += 1;
                    log::error!("segment {} at slice {} contrast {} has no open readout, dropped",
                        record.idx.segment,slice,contrast);
                    return Ok(None);
                }
                Some(open) => {
                    if let Err(e) = open.readout.write_segment(&record) {
                        self.open[slice][contrast] = None;
                        self.dropped_readouts += 1;
                        log::error!("readout at slice {} contrast {} dropped: {}",slice,contrast,e);
                        return Ok(None);
                    }
                }
            }
        }

        // the final segment freezes the readout and re-applies the shift
        // correction recorded at segment 0
        let mut completion = false;
        let done = self.open[slice][contrast].as_ref().map(|o| o.readout.is_complete()).unwrap_or(false);
        if done {
            if let Some(open) = self.open[slice][contrast].take() {
                match Self::finish_readout(open,&self.snapshot) {
                    Ok(rec) => {
                        completion = rec.flags.completes_group();
                        self.groups[slice][contrast].push(rec);
                    }
                    Err(e) => {
                        self.dropped_readouts += 1;
                        log::error!("readout at slice {} contrast {} dropped: {}",slice,contrast,e);
                    }
                }
            }
        }

        if !completion {
            return Ok(None);
        }

        if self.config.derive_sens_from_raw
            && self.sensmaps[slice].is_none()
            && self.snapshot.trajectory == TrajectoryKind::Spiral {
            let sorted = sort::sort_nonuniform(&self.groups[slice][contrast],self.noise_model.as_ref(),None)?;
            let map = self.engine.sens_from_raw(&sorted.traj,&sorted.samples)
                .map_err(|e| StreamError::Collaborator(e.to_string()))?;
            log::info!("sensitivity for slice {} estimated from imaging data",slice);
            self.sensmaps[slice] = Some(map);
        }

        let records = std::mem::take(&mut self.groups[slice][contrast]);
        log::info!("group complete: slice {} contrast {} with {} readouts",slice,contrast,records.len());
        Ok(Some(CompletedGroup {
            slice: slice as u16,
            contrast: contrast as u16,
            unflagged: false,
            records,
        }))
    }

    fn open_readout(&self,mut record:AcquisitionRecord,nseg:u16) -> Result<OpenReadout,StreamError> {
        let full = self.snapshot.full_samples(record.samples())?;
        let state = match std::mem::replace(&mut record.traj_source,TrajectorySource::None) {
            TrajectorySource::None => None,
            TrajectorySource::Measured(t) => {
                if t.dim() != (full,3) {
                    return Err(StreamError::Protocol(format!(
                        "measured trajectory is {:?}, readout stitches to {} samples",t.dim(),full)));
                }
                record.traj = Some(t.clone());
                Some(TrajectoryState {
                    pred: t.clone(),
                    base: t,
                    shift: self.shift_for(&record),
                })
            }
            TrajectorySource::Gradient(g) => {
                let girf = self.girf.as_ref().ok_or_else(|| StreamError::Protocol(
                    "gradient trajectory source but no impulse response was loaded".to_string()))?;
                let out = predict(&g,&record.pose,&record.idx,girf,&self.snapshot,full)?;
                record.traj = Some(out.pred.clone());
                record.k0 = Some(out.k0);
                Some(TrajectoryState {
                    pred: out.pred,
                    base: out.base,
                    shift: self.shift_for(&record),
                })
            }
        };
        Ok(OpenReadout {
            readout: InProgressReadout::begin(record,nseg),
            traj: state,
        })
    }

    fn shift_for(&self,record:&AcquisitionRecord) -> [f32;3] {
        let rot = Rotation::from_pose(&record.pose);
        let v = rot.patient_to_logical(record.pose.position);
        let res = self.snapshot.resolution_mm();
        [v[0] / res[0],v[1] / res[1],v[2] / res[2]]
    }

    fn finish_readout(open:OpenReadout,snapshot:&ProtocolSnapshot) -> Result<AcquisitionRecord,StreamError> {
        let OpenReadout { readout, traj } = open;
        let mut rec = readout.finalize()?;
        if let Some(state) = traj {
            // the slice axis carries no shift correction
            let matrix = [snapshot.encoded_matrix.x,snapshot.encoded_matrix.y,0];
            reassemble::reapply_shift(&mut rec.data,&state.pred,&state.base,state.shift,matrix)?;
        }
        Ok(rec)
    }

    /// duplicate adjacent sensitivity maps when fewer calibration slices than
    /// imaging slices were acquired. parity alternates with the total slice
    /// count; a heuristic carried over from the acquisition scheme, not a
    /// verified invariant
    fn fill_missing_sensitivities(&mut self) {
        let n = self.sensmaps.len();
        let present = self.sensmaps.iter().filter(|m| m.is_some()).count();
        if present == 0 || present == n {
            return;
        }
        if n % 2 == 0 {
            for i in (0..n - 1).step_by(2) {
                self.sensmaps[i] = self.sensmaps[i + 1].clone();
            }
        } else {
            for i in (1..n).step_by(2) {
                self.sensmaps[i] = self.sensmaps[i - 1].clone();
            }
        }
        log::warn!("fewer calibration maps than slices, duplicated adjacent maps across {} slices",n);
    }

    /// stream-end flush. unflagged non-empty groups are always reported, the
    /// configured policy decides whether they go through the normal
    /// completion path or are dropped
    pub fn finish(&mut self) -> Vec<CompletedGroup> {
        let mut out = Vec::new();
        for slice in 0..self.open.len() {
            for contrast in 0..self.open[slice].len() {
                if self.open[slice][contrast].take().is_some() {
                    self.dropped_readouts += 1;
                    log::warn!("stream ended inside a segmented readout at slice {} contrast {}, dropped",slice,contrast);
                }
            }
        }
        for slice in 0..self.groups.len() {
            for contrast in 0..self.groups[slice].len() {
                if self.groups[slice][contrast].is_empty() {
                    continue;
                }
                let n = self.groups[slice][contrast].len();
                log::warn!("unflagged trailing data: slice {} contrast {} holds {} readouts at stream end",slice,contrast,n);
                let records = std::mem::take(&mut self.groups[slice][contrast]);
                match self.config.trailing_policy {
                    TrailingPolicy::Discard => drop(records),
                    TrailingPolicy::Process => out.push(CompletedGroup {
                        slice: slice as u16,
                        contrast: contrast as u16,
                        unflagged: true,
                        records,
                    }),
                }
            }
        }
        if self.dummies + self.navigators > 0 {
            log::debug!("discarded {} dummy and {} navigator records over the stream",self.dummies,self.navigators);
        }
        out
    }

    /// sort a completed group and hand it to the collaborator, yielding the
    /// image volume for the emission sink
    pub fn reconstruct(&self,group:&CompletedGroup) -> Result<ImageVolume,StreamError> {
        let data = match self.snapshot.trajectory {
            TrajectoryKind::Cartesian => {
                let kspace = sort::sort_cartesian(&group.records,self.noise_model.as_ref(),
                    &self.snapshot.encoded_matrix,self.snapshot.channels,false)?;
                self.engine.reconstruct_cartesian(&kspace)
            }
            TrajectoryKind::Spiral => {
                let sorted = sort::sort_nonuniform(&group.records,self.noise_model.as_ref(),
                    self.config.ringing_filter_factor)?;
                self.engine.reconstruct(&sorted.traj,&sorted.samples,self.sensitivity(group.slice))
            }
        }.map_err(|e| StreamError::Collaborator(e.to_string()))?;
        Ok(ImageVolume {
            slice: group.slice,
            contrast: group.contrast,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use mr_data::record::EncodingIdx;
    use mr_protocol::{EncodingLimits, FieldOfView, Limit, MatrixSize, UserParams};
    use ndarray::{Array3, Array4};
    use num_complex::Complex;
    use crate::engine::EngineError;

    #[derive(Default)]
    struct MockEngine {
        calibrations:RefCell<usize>,
        raw_sens:RefCell<usize>,
        reconstructions:RefCell<usize>,
    }

    impl ReconEngine for MockEngine {
        fn reconstruct(&self,_traj:&Array3<f32>,samples:&Array4<Complex<f32>>,_sens:Option<&SensitivityMap>) -> Result<Array3<Complex<f32>>,EngineError> {
            *self.reconstructions.borrow_mut() += 1;
            let n = samples.dim().1;
            Ok(Array3::zeros((n,n,1)))
        }
        fn reconstruct_cartesian(&self,kspace:&Array4<Complex<f32>>) -> Result<Array3<Complex<f32>>,EngineError> {
            *self.reconstructions.borrow_mut() += 1;
            let d = kspace.dim();
            Ok(Array3::zeros((d.1,d.2,d.3)))
        }
        fn calibrate(&self,kspace:&Array4<Complex<f32>>) -> Result<SensitivityMap,EngineError> {
            *self.calibrations.borrow_mut() += 1;
            let d = kspace.dim();
            Ok(Array4::from_elem((d.1,d.2,d.3,d.0),Complex::new(1.0,0.0)))
        }
        fn sens_from_raw(&self,_traj:&Array3<f32>,samples:&Array4<Complex<f32>>) -> Result<SensitivityMap,EngineError> {
            *self.raw_sens.borrow_mut() += 1;
            let d = samples.dim();
            Ok(Array4::from_elem((d.1,d.1,1,d.3),Complex::new(1.0,0.0)))
        }
    }

    fn snapshot(kind:TrajectoryKind,n_slc:u16,n_seg:u16) -> ProtocolSnapshot {
        ProtocolSnapshot {
            trajectory: kind,
            encoded_matrix: MatrixSize { x: 8, y: 4, z: 1 },
            recon_matrix: MatrixSize { x: 8, y: 4, z: 1 },
            fov_mm: FieldOfView { x: 192.0, y: 192.0, z: 5.0 },
            limits: EncodingLimits {
                slice: Limit { maximum: n_slc - 1, center: 0 },
                segment: Limit { maximum: n_seg - 1, center: 0 },
                ..EncodingLimits::default()
            },
            channels: 1,
            user: UserParams {
                dwell_time_us: 2.0,
                gradient_delay_s: 0.0,
                n_prediction_segments: 1,
                reference_voltage: 223.0,
            },
            arrays: HashMap::new(),
        }
    }

    fn router(kind:TrajectoryKind,n_slc:u16,n_seg:u16,config:RouterConfig) -> AcquisitionRouter<MockEngine> {
        AcquisitionRouter::new(snapshot(kind,n_slc,n_seg),None,config,MockEngine::default()).unwrap()
    }

    fn imaging(slice:u16,step1:u16,last:bool) -> AcquisitionRecord {
        let idx = EncodingIdx { slice, step1, ..EncodingIdx::default() };
        let data = Array2::from_elem((1,8),Complex::new(step1 as f32 + 1.0,0.0));
        let mut rec = AcquisitionRecord::new(idx,AcqRole::Imaging,data);
        rec.flags.last_in_slice = last;
        rec
    }

    fn calibration(slice:u16,step1:u16,last:bool) -> AcquisitionRecord {
        let mut rec = imaging(slice,step1,last);
        rec.role = AcqRole::Calibration;
        rec
    }

    fn noise() -> AcquisitionRecord {
        AcquisitionRecord::new(EncodingIdx::default(),AcqRole::Noise,
            Array2::from_elem((1,8),Complex::new(0.1,0.2)))
    }

    #[test]
    fn group_completes_on_last_in_slice_and_buffer_restarts() {
        let mut r = router(TrajectoryKind::Cartesian,1,1,RouterConfig::default());
        for i in 0..3 {
            assert!(r.route(imaging(0,i,false)).unwrap().is_none());
        }
        let group = r.route(imaging(0,3,true)).unwrap().unwrap();
        assert_eq!(group.records.len(),4);
        assert!(!group.unflagged);
        assert_eq!(group.slice,0);

        // the buffer starts over: the next completed group only holds what
        // came after the hand-off
        assert!(r.route(imaging(0,0,false)).unwrap().is_none());
        let next = r.route(imaging(0,1,true)).unwrap().unwrap();
        assert_eq!(next.records.len(),2);
    }

    #[test]
    fn trailing_data_is_discarded_by_default() {
        let mut r = router(TrajectoryKind::Cartesian,1,1,RouterConfig::default());
        r.route(imaging(0,0,false)).unwrap();
        r.route(imaging(0,1,false)).unwrap();
        let flushed = r.finish();
        assert!(flushed.is_empty());
    }

    #[test]
    fn trailing_data_flushes_under_process_policy() {
        let config = RouterConfig { trailing_policy: TrailingPolicy::Process, ..RouterConfig::default() };
        let mut r = router(TrajectoryKind::Cartesian,1,1,config);
        r.route(imaging(0,0,false)).unwrap();
        r.route(imaging(0,1,false)).unwrap();
        let flushed = r.finish();
        assert_eq!(flushed.len(),1);
        assert!(flushed[0].unflagged);
        assert_eq!(flushed[0].records.len(),2);
    }

    #[test]
    fn calibration_builds_and_caches_the_map() {
        let mut r = router(TrajectoryKind::Cartesian,2,1,RouterConfig::default());
        assert!(r.route(calibration(1,0,false)).unwrap().is_none());
        assert!(r.route(calibration(1,1,true)).unwrap().is_none());
        assert_eq!(*r.engine.calibrations.borrow(),1);
        assert!(r.sensitivity(1).is_some());
        assert!(r.sensitivity(0).is_none());
    }

    #[test]
    fn noise_model_is_built_once() {
        let mut r = router(TrajectoryKind::Cartesian,1,1,RouterConfig::default());
        r.route(noise()).unwrap();
        r.route(noise()).unwrap();
        assert!(r.noise_model().is_none());
        r.route(imaging(0,0,false)).unwrap();
        assert!(r.noise_model().is_some());
        // late noise records are discarded, the model stays
        r.route(noise()).unwrap();
        assert!(r.noise_model().is_some());
    }

    #[test]
    fn orphan_segment_is_dropped_not_fatal() {
        let mut r = router(TrajectoryKind::Cartesian,1,2,RouterConfig::default());
        let mut seg = imaging(0,0,false);
        seg.idx.segment = 1;
        assert!(r.route(seg).unwrap().is_none());
        assert_eq!(r.dropped_readouts(),1);

        // the stream keeps working afterwards
        assert!(r.route(imaging(0,1,false)).unwrap().is_none());
        let mut seg = imaging(0,1,true);
        seg.idx.segment = 1;
        let group = r.route(seg).unwrap().unwrap();
        assert_eq!(group.records.len(),1);
        assert_eq!(group.records[0].samples(),16);
    }

    #[test]
    fn segments_stitch_into_one_readout() {
        let mut r = router(TrajectoryKind::Cartesian,1,2,RouterConfig::default());
        assert!(r.route(imaging(0,0,false)).unwrap().is_none());
        let mut seg = imaging(0,0,true);
        seg.idx.segment = 1;
        seg.data.fill(Complex::new(9.0,0.0));
        let group = r.route(seg).unwrap().unwrap();
        assert_eq!(group.records.len(),1);
        let rec = &group.records[0];
        assert_eq!(rec.samples(),16);
        assert_eq!(rec.data[[0,0]],Complex::new(1.0,0.0));
        assert_eq!(rec.data[[0,8]],Complex::new(9.0,0.0));
    }

    #[test]
    fn even_slice_count_copies_maps_downward() {
        let mut r = router(TrajectoryKind::Cartesian,4,1,RouterConfig::default());
        r.route(calibration(1,0,true)).unwrap();
        r.route(calibration(3,0,true)).unwrap();
        r.route(imaging(0,0,false)).unwrap();
        assert!(r.sensitivity(0).is_some());
        assert!(r.sensitivity(2).is_some());
    }

    #[test]
    fn odd_slice_count_copies_maps_upward() {
        let mut r = router(TrajectoryKind::Cartesian,3,1,RouterConfig::default());
        r.route(calibration(0,0,true)).unwrap();
        r.route(imaging(0,0,false)).unwrap();
        assert!(r.sensitivity(1).is_some());
        assert!(r.sensitivity(2).is_none());
    }

    #[test]
    fn cartesian_reconstruction_goes_through_the_collaborator() {
        let mut r = router(TrajectoryKind::Cartesian,1,1,RouterConfig::default());
        for i in 0..3 {
            r.route(imaging(0,i,false)).unwrap();
        }
        let group = r.route(imaging(0,3,true)).unwrap().unwrap();
        let image = r.reconstruct(&group).unwrap();
        assert_eq!(image.slice,0);
        assert_eq!(image.data.dim(),(8,4,1));
        assert_eq!(*r.engine.reconstructions.borrow(),1);
    }
}
