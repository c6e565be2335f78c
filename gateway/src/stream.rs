use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use mr_data::record::{AcqRole, AcquisitionRecord, CompletionFlags, EncodingIdx, ImageVolume, Pose,
                      StreamItem, TrajectorySource, Waveform};
use ndarray::{Array2, Array3};
use num_complex::Complex;
use thiserror::Error;

// item tags
const TAG_CLOSE:u8 = 0;
const TAG_ACQUISITION:u8 = 1;
const TAG_IMAGE:u8 = 2;
const TAG_WAVEFORM:u8 = 3;

#[derive(Debug,Error)]
pub enum ReadError {
    #[error("stream file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream file is corrupt: {0}")]
    Format(String),
}

/// reader for a recorded acquisition stream: tagged little-endian records,
/// one item per frame, terminated by a close marker or end of file
pub struct StreamReader {
    r:BufReader<File>,
}

impl StreamReader {

    pub fn open(path:&Path) -> Result<Self,ReadError> {
        let f = File::open(path)?;
        Ok(Self { r: BufReader::new(f) })
    }

    pub fn next_item(&mut self) -> Result<StreamItem,ReadError> {
        let tag = match self.r.read_u8() {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(StreamItem::Close),
            Err(e) => return Err(e.into()),
        };
        match tag {
            TAG_CLOSE => Ok(StreamItem::Close),
            TAG_ACQUISITION => Ok(StreamItem::Acquisition(self.read_acquisition()?)),
            TAG_IMAGE => Ok(StreamItem::Image(self.read_image()?)),
            TAG_WAVEFORM => Ok(StreamItem::Waveform(self.read_waveform()?)),
            t => Err(ReadError::Format(format!("unknown item tag {}",t))),
        }
    }

    fn read_vec3(&mut self) -> Result<[f32;3],ReadError> {
        let mut v = [0.0f32;3];
        for x in v.iter_mut() {
            *x = self.r.read_f32::<LittleEndian>()?;
        }
        Ok(v)
    }

    fn read_f32_array(&mut self,rows:usize,cols:usize) -> Result<Array2<f32>,ReadError> {
        let mut flat = vec![0.0f32;rows * cols];
        self.r.read_f32_into::<LittleEndian>(&mut flat)?;
        Array2::from_shape_vec((rows,cols),flat)
            .map_err(|e| ReadError::Format(e.to_string()))
    }

    fn read_complex_array(&mut self,rows:usize,cols:usize) -> Result<Array2<Complex<f32>>,ReadError> {
        let mut flat = vec![0.0f32;rows * cols * 2];
        self.r.read_f32_into::<LittleEndian>(&mut flat)?;
        let complex:Vec<Complex<f32>> = (0..rows * cols)
            .map(|i| Complex::new(flat[2 * i],flat[2 * i + 1]))
            .collect();
        Array2::from_shape_vec((rows,cols),complex)
            .map_err(|e| ReadError::Format(e.to_string()))
    }

    fn read_acquisition(&mut self) -> Result<AcquisitionRecord,ReadError> {
        let idx = EncodingIdx {
            slice: self.r.read_u16::<LittleEndian>()?,
            contrast: self.r.read_u16::<LittleEndian>()?,
            phase: self.r.read_u16::<LittleEndian>()?,
            repetition: self.r.read_u16::<LittleEndian>()?,
            average: self.r.read_u16::<LittleEndian>()?,
            set: self.r.read_u16::<LittleEndian>()?,
            segment: self.r.read_u16::<LittleEndian>()?,
            step1: self.r.read_u16::<LittleEndian>()?,
            step2: self.r.read_u16::<LittleEndian>()?,
        };
        let role = match self.r.read_u8()? {
            0 => AcqRole::Noise,
            1 => AcqRole::Dummy,
            2 => AcqRole::PhaseNavigator,
            3 => AcqRole::Calibration,
            4 => AcqRole::Imaging,
            x => return Err(ReadError::Format(format!("unknown role code {}",x))),
        };
        let bits = self.r.read_u8()?;
        let flags = CompletionFlags {
            last_in_slice: bits & 1 != 0,
            last_in_repetition: bits & 2 != 0,
            last_in_measurement: bits & 4 != 0,
        };
        let pose = Pose {
            read_dir: self.read_vec3()?,
            phase_dir: self.read_vec3()?,
            slice_dir: self.read_vec3()?,
            position: self.read_vec3()?,
        };
        let channels = self.r.read_u16::<LittleEndian>()? as usize;
        let samples = self.r.read_u32::<LittleEndian>()? as usize;
        let traj_source = match self.r.read_u8()? {
            0 => TrajectorySource::None,
            tag @ (1 | 2) => {
                let rows = self.r.read_u32::<LittleEndian>()? as usize;
                let dims = self.r.read_u8()? as usize;
                let arr = self.read_f32_array(rows,dims)?;
                if tag == 1 {
                    TrajectorySource::Measured(arr)
                } else {
                    TrajectorySource::Gradient(arr)
                }
            }
            x => return Err(ReadError::Format(format!("unknown trajectory tag {}",x))),
        };
        let data = self.read_complex_array(channels,samples)?;
        let mut rec = AcquisitionRecord::new(idx,role,data);
        rec.flags = flags;
        rec.pose = pose;
        rec.traj_source = traj_source;
        Ok(rec)
    }

    fn read_image(&mut self) -> Result<ImageVolume,ReadError> {
        let slice = self.r.read_u16::<LittleEndian>()?;
        let contrast = self.r.read_u16::<LittleEndian>()?;
        let nx = self.r.read_u16::<LittleEndian>()? as usize;
        let ny = self.r.read_u16::<LittleEndian>()? as usize;
        let nz = self.r.read_u16::<LittleEndian>()? as usize;
        let mut flat = vec![0.0f32;nx * ny * nz * 2];
        self.r.read_f32_into::<LittleEndian>(&mut flat)?;
        let complex:Vec<Complex<f32>> = (0..nx * ny * nz)
            .map(|i| Complex::new(flat[2 * i],flat[2 * i + 1]))
            .collect();
        let data = Array3::from_shape_vec((nx,ny,nz),complex)
            .map_err(|e| ReadError::Format(e.to_string()))?;
        Ok(ImageVolume { slice, contrast, data })
    }

    fn read_waveform(&mut self) -> Result<Waveform,ReadError> {
        let waveform_id = self.r.read_u16::<LittleEndian>()?;
        let time_stamp = self.r.read_u64::<LittleEndian>()?;
        let channels = self.r.read_u16::<LittleEndian>()? as usize;
        let samples = self.r.read_u32::<LittleEndian>()? as usize;
        let data = self.read_f32_array(channels,samples)?;
        Ok(Waveform { waveform_id, time_stamp, data })
    }
}

/// writer counterpart, used to record streams for replay
pub struct StreamWriter {
    w:BufWriter<File>,
}

impl StreamWriter {

    pub fn create(path:&Path) -> Result<Self,ReadError> {
        let f = File::create(path)?;
        Ok(Self { w: BufWriter::new(f) })
    }

    pub fn write_item(&mut self,item:&StreamItem) -> Result<(),ReadError> {
        match item {
            StreamItem::Close => self.w.write_u8(TAG_CLOSE)?,
            StreamItem::Acquisition(rec) => {
                self.w.write_u8(TAG_ACQUISITION)?;
                self.write_acquisition(rec)?;
            }
            StreamItem::Image(img) => {
                self.w.write_u8(TAG_IMAGE)?;
                self.write_image(img)?;
            }
            StreamItem::Waveform(wf) => {
                self.w.write_u8(TAG_WAVEFORM)?;
                self.write_waveform(wf)?;
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<(),ReadError> {
        self.w.flush()?;
        Ok(())
    }

    fn write_vec3(&mut self,v:&[f32;3]) -> Result<(),ReadError> {
        for x in v {
            self.w.write_f32::<LittleEndian>(*x)?;
        }
        Ok(())
    }

    fn write_acquisition(&mut self,rec:&AcquisitionRecord) -> Result<(),ReadError> {
        for v in [rec.idx.slice,rec.idx.contrast,rec.idx.phase,rec.idx.repetition,
                  rec.idx.average,rec.idx.set,rec.idx.segment,rec.idx.step1,rec.idx.step2] {
            self.w.write_u16::<LittleEndian>(v)?;
        }
        let role = match rec.role {
            AcqRole::Noise => 0u8,
            AcqRole::Dummy => 1,
            AcqRole::PhaseNavigator => 2,
            AcqRole::Calibration => 3,
            AcqRole::Imaging => 4,
        };
        self.w.write_u8(role)?;
        let mut bits = 0u8;
        if rec.flags.last_in_slice { bits |= 1; }
        if rec.flags.last_in_repetition { bits |= 2; }
        if rec.flags.last_in_measurement { bits |= 4; }
        self.w.write_u8(bits)?;
        self.write_vec3(&rec.pose.read_dir)?;
        self.write_vec3(&rec.pose.phase_dir)?;
        self.write_vec3(&rec.pose.slice_dir)?;
        self.write_vec3(&rec.pose.position)?;
        self.w.write_u16::<LittleEndian>(rec.channels() as u16)?;
        self.w.write_u32::<LittleEndian>(rec.samples() as u32)?;
        match &rec.traj_source {
            TrajectorySource::None => self.w.write_u8(0)?,
            TrajectorySource::Measured(arr) | TrajectorySource::Gradient(arr) => {
                let tag = if matches!(rec.traj_source,TrajectorySource::Measured(_)) { 1 } else { 2 };
                self.w.write_u8(tag)?;
                self.w.write_u32::<LittleEndian>(arr.dim().0 as u32)?;
                self.w.write_u8(arr.dim().1 as u8)?;
                for v in arr.iter() {
                    self.w.write_f32::<LittleEndian>(*v)?;
                }
            }
        }
        for c in rec.data.iter() {
            self.w.write_f32::<LittleEndian>(c.re)?;
            self.w.write_f32::<LittleEndian>(c.im)?;
        }
        Ok(())
    }

    fn write_image(&mut self,img:&ImageVolume) -> Result<(),ReadError> {
        self.w.write_u16::<LittleEndian>(img.slice)?;
        self.w.write_u16::<LittleEndian>(img.contrast)?;
        let d = img.data.dim();
        self.w.write_u16::<LittleEndian>(d.0 as u16)?;
        self.w.write_u16::<LittleEndian>(d.1 as u16)?;
        self.w.write_u16::<LittleEndian>(d.2 as u16)?;
        for c in img.data.iter() {
            self.w.write_f32::<LittleEndian>(c.re)?;
            self.w.write_f32::<LittleEndian>(c.im)?;
        }
        Ok(())
    }

    fn write_waveform(&mut self,wf:&Waveform) -> Result<(),ReadError> {
        self.w.write_u16::<LittleEndian>(wf.waveform_id)?;
        self.w.write_u64::<LittleEndian>(wf.time_stamp)?;
        self.w.write_u16::<LittleEndian>(wf.data.dim().0 as u16)?;
        self.w.write_u32::<LittleEndian>(wf.data.dim().1 as u32)?;
        for v in wf.data.iter() {
            self.w.write_f32::<LittleEndian>(*v)?;
        }
        Ok(())
    }
}
