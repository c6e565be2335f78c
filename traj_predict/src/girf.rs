use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use byteorder::{ByteOrder, LittleEndian};
use ndarray::{Array3, ArrayView1, Axis};
use num_complex::Complex;
use crate::predict::TrajError;

const N_INPUTS:usize = 3;
const N_OUTPUTS:usize = 4;

/// measured gradient impulse response in the frequency domain,
/// [3 input axes, 4 output axes, samples] on a fixed time raster.
/// output axis 0 is the zeroth-order (global field) term, axes 1..3 the
/// spatial gradient axes. loaded once per process lifetime
#[derive(Clone,Debug)]
pub struct GirfResponse {
    data:Array3<Complex<f32>>,
    pub dt:f32,
}

impl GirfResponse {

    pub fn new(data:Array3<Complex<f32>>,dt:f32) -> Result<Self,TrajError> {
        let d = data.dim();
        if d.0 != N_INPUTS || d.1 != N_OUTPUTS || d.2 == 0 {
            return Err(TrajError::Format(format!(
                "impulse response must be [{},{} ,samples], got {:?}",N_INPUTS,N_OUTPUTS,d)));
        }
        Ok(Self { data, dt })
    }

    /// unit spatial response with no zeroth-order term. prediction through
    /// this response reproduces the nominal trajectory
    pub fn identity(n_samples:usize,dt:f32) -> Self {
        let mut data = Array3::<Complex<f32>>::zeros((N_INPUTS,N_OUTPUTS,n_samples));
        for input in 0..N_INPUTS {
            for s in 0..n_samples {
                data[[input,input + 1,s]] = Complex::new(1.0,0.0);
            }
        }
        Self { data, dt }
    }

    pub fn samples(&self) -> usize {
        self.data.dim().2
    }

    pub fn term(&self,input:usize,output:usize) -> ArrayView1<Complex<f32>> {
        self.data.index_axis(Axis(0),input).index_axis_move(Axis(0),output)
    }

    /// linear resampling of the response onto a longer raster. this degrades
    /// the measurement, callers warn before using it
    pub fn resampled(&self,n:usize) -> Array3<Complex<f32>> {
        let old = self.samples();
        let mut out = Array3::<Complex<f32>>::zeros((N_INPUTS,N_OUTPUTS,n));
        for input in 0..N_INPUTS {
            for output in 0..N_OUTPUTS {
                for i in 0..n {
                    let x = i as f32 * (old - 1) as f32 / (n - 1) as f32;
                    let lo = (x.floor() as usize).min(old - 1);
                    let hi = (lo + 1).min(old - 1);
                    let frac = x - lo as f32;
                    let a = self.data[[input,output,lo]];
                    let b = self.data[[input,output,hi]];
                    out[[input,output,i]] = a + (b - a) * frac;
                }
            }
        }
        out
    }

    /// binary layout: three u32 dims, f32 dt, then interleaved re/im floats
    /// in (input, output, sample) order, all little endian
    pub fn from_file(path:&Path) -> Result<Self,TrajError> {
        let mut f = File::open(path).map_err(|e| TrajError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut bytes = Vec::<u8>::new();
        f.read_to_end(&mut bytes).map_err(|e| TrajError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        if bytes.len() < 16 {
            return Err(TrajError::Format(format!("impulse response file {:?} is truncated",path)));
        }
        let n_in = LittleEndian::read_u32(&bytes[0..4]) as usize;
        let n_out = LittleEndian::read_u32(&bytes[4..8]) as usize;
        let n_samp = LittleEndian::read_u32(&bytes[8..12]) as usize;
        let dt = LittleEndian::read_f32(&bytes[12..16]);
        let numel = n_in * n_out * n_samp;
        if bytes.len() != 16 + numel * 8 {
            return Err(TrajError::Format(format!(
                "impulse response payload is {} bytes, header implies {}",bytes.len() - 16,numel * 8)));
        }
        let mut flat:Vec<f32> = vec![0.0;numel * 2];
        LittleEndian::read_f32_into(&bytes[16..],&mut flat);
        let complex:Vec<Complex<f32>> = (0..numel)
            .map(|i| Complex::new(flat[2 * i],flat[2 * i + 1]))
            .collect();
        let data = Array3::from_shape_vec((n_in,n_out,n_samp),complex)
            .map_err(|e| TrajError::Format(e.to_string()))?;
        Self::new(data,dt)
    }

    pub fn to_file(&self,path:&Path) -> Result<(),TrajError> {
        let d = self.data.dim();
        let mut bytes = Vec::<u8>::with_capacity(16 + self.data.len() * 8);
        let mut buf4 = [0u8;4];
        LittleEndian::write_u32(&mut buf4,d.0 as u32);
        bytes.extend_from_slice(&buf4);
        LittleEndian::write_u32(&mut buf4,d.1 as u32);
        bytes.extend_from_slice(&buf4);
        LittleEndian::write_u32(&mut buf4,d.2 as u32);
        bytes.extend_from_slice(&buf4);
        LittleEndian::write_f32(&mut buf4,self.dt);
        bytes.extend_from_slice(&buf4);
        for c in self.data.iter() {
            LittleEndian::write_f32(&mut buf4,c.re);
            bytes.extend_from_slice(&buf4);
            LittleEndian::write_f32(&mut buf4,c.im);
            bytes.extend_from_slice(&buf4);
        }
        let mut f = File::create(path).map_err(|e| TrajError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        f.write_all(&bytes).map_err(|e| TrajError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }
}
