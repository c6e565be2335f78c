use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use byteorder::{ByteOrder, LittleEndian};
use ndarray::Array3;
use num_complex::Complex;
use nifti::writer::WriterOptions;
use thiserror::Error;

// the reconstruction tools expect at least this many header dimensions,
// trailing ones are padded
const MIN_HDR_DIMS:usize = 5;

#[derive(Debug,Error)]
pub enum CflError {
    #[error("cannot access {path}: {source}")]
    Io { path:String, #[source] source:std::io::Error },
    #[error("cfl header is corrupt: {0}")]
    Header(String),
    #[error("cfl data length {got} does not match header dimensions {dims:?}")]
    Truncated { got:usize, dims:Vec<usize> },
    #[error("nifti export failed: {0}")]
    Nifti(String),
}

fn cfl_base_decode(cfl_base:&Path) -> (PathBuf,PathBuf) {
    (cfl_base.with_extension("hdr"),cfl_base.with_extension("cfl"))
}

fn io_err(path:&Path,source:std::io::Error) -> CflError {
    CflError::Io { path: path.display().to_string(), source }
}

/// write a complex array of any rank as a cfl pair (text header with a
/// "# Dimensions" line plus interleaved little-endian float pairs)
pub fn write_cfl(data:&[Complex<f32>],dims:&[usize],cfl_base:&Path) -> Result<(),CflError> {
    let numel:usize = dims.iter().product();
    if numel != data.len() {
        return Err(CflError::Truncated { got: data.len(), dims: dims.to_vec() });
    }
    let (hdr,cfl) = cfl_base_decode(cfl_base);

    let mut dim_strs:Vec<String> = dims.iter().map(|d| d.to_string()).collect();
    while dim_strs.len() < MIN_HDR_DIMS {
        dim_strs.push(String::from("1"));
    }
    let hdr_str = format!("# Dimensions\n{}\n",dim_strs.join(" "));
    let mut f = File::create(&hdr).map_err(|e| io_err(&hdr,e))?;
    f.write_all(hdr_str.as_bytes()).map_err(|e| io_err(&hdr,e))?;

    let mut flat:Vec<f32> = Vec::with_capacity(2 * data.len());
    for c in data {
        flat.push(c.re);
        flat.push(c.im);
    }
    let mut bytes:Vec<u8> = vec![0;4 * flat.len()];
    LittleEndian::write_f32_into(&flat,&mut bytes);
    let mut f = File::create(&cfl).map_err(|e| io_err(&cfl,e))?;
    f.write_all(&bytes).map_err(|e| io_err(&cfl,e))?;
    Ok(())
}

pub fn read_dims(cfl_base:&Path) -> Result<Vec<usize>,CflError> {
    let (hdr,_) = cfl_base_decode(cfl_base);
    let mut f = File::open(&hdr).map_err(|e| io_err(&hdr,e))?;
    let mut s = String::new();
    f.read_to_string(&mut s).map_err(|e| io_err(&hdr,e))?;
    let lines:Vec<&str> = s.lines().collect();
    let dim_line = lines.iter().position(|l| l.starts_with("# Dimensions"))
        .and_then(|i| lines.get(i + 1))
        .ok_or_else(|| CflError::Header(format!("no dimension entry in {:?}",hdr)))?;
    let dims:Result<Vec<usize>,_> = dim_line.split_whitespace().map(|t| t.parse::<usize>()).collect();
    dims.map_err(|e| CflError::Header(format!("bad dimension entry in {:?}: {}",hdr,e)))
}

pub fn read_cfl(cfl_base:&Path) -> Result<(Vec<Complex<f32>>,Vec<usize>),CflError> {
    let dims = read_dims(cfl_base)?;
    let (_,cfl) = cfl_base_decode(cfl_base);
    let mut f = File::open(&cfl).map_err(|e| io_err(&cfl,e))?;
    let mut bytes = Vec::<u8>::new();
    f.read_to_end(&mut bytes).map_err(|e| io_err(&cfl,e))?;
    let mut flat:Vec<f32> = vec![0.0;bytes.len() / 4];
    LittleEndian::read_f32_into(&bytes,&mut flat);
    let data:Vec<Complex<f32>> = (0..flat.len() / 2)
        .map(|i| Complex::new(flat[2 * i],flat[2 * i + 1]))
        .collect();
    let numel:usize = dims.iter().product();
    if data.len() != numel {
        return Err(CflError::Truncated { got: data.len(), dims });
    }
    Ok((data,dims))
}

/// magnitude export for the image emission sink
pub fn to_nifti(vol:&Array3<Complex<f32>>,nifti_base:&Path) -> Result<(),CflError> {
    let mag = vol.mapv(|c| c.norm());
    WriterOptions::new(nifti_base)
        .write_nifti(&mag)
        .map_err(|e| CflError::Nifti(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cfl_round_trip() {
        let dims = vec![3,4,2];
        let data:Vec<Complex<f32>> = (0..24).map(|i| Complex::new(i as f32,-(i as f32))).collect();
        let base = std::env::temp_dir().join("mr_data_cfl_test");
        write_cfl(&data,&dims,&base).unwrap();
        let (back,back_dims) = read_cfl(&base).unwrap();
        assert_eq!(back_dims,vec![3,4,2,1,1]);
        assert_eq!(back,data);
        std::fs::remove_file(base.with_extension("cfl")).unwrap();
        std::fs::remove_file(base.with_extension("hdr")).unwrap();
    }

    #[test]
    fn write_rejects_mismatched_shape() {
        let data = vec![Complex::new(0.0f32,0.0);5];
        let base = std::env::temp_dir().join("mr_data_cfl_bad");
        assert!(matches!(write_cfl(&data,&[2,4],&base),Err(CflError::Truncated { .. })));
    }

    #[test]
    fn header_pads_to_five_dims() {
        let data = vec![Complex::new(1.0f32,0.0);6];
        let base = std::env::temp_dir().join("mr_data_cfl_pad");
        write_cfl(&data,&[2,3],&base).unwrap();
        let dims = read_dims(&base).unwrap();
        assert_eq!(dims,vec![2,3,1,1,1]);
        std::fs::remove_file(base.with_extension("cfl")).unwrap();
        std::fs::remove_file(base.with_extension("hdr")).unwrap();
    }
}
