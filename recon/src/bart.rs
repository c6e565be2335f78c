use std::fs::create_dir_all;
use std::path::{Path, PathBuf};
use std::process::Command;
use mr_data::cfl::{self, CflError};
use mr_data::record::SensitivityMap;
use mr_stream::{EngineError, ReconEngine};
use ndarray::{Array3, Array4};
use num_complex::Complex;
use thiserror::Error;
use crate::recon_settings::BartSettings;

#[derive(Debug,Error)]
pub enum ReconError {
    #[error("cannot prepare work directory {path}: {source}")]
    Io { path:String, #[source] source:std::io::Error },
    #[error(transparent)]
    Cfl(#[from] CflError),
    #[error("failed to launch {tool}: {source}")]
    Launch { tool:String, #[source] source:std::io::Error },
    #[error("{tool} exited with {status}")]
    Failed { tool:String, status:String },
    #[error("{tool} returned unexpected dimensions {dims:?}")]
    BadResult { tool:String, dims:Vec<usize> },
}

/// reconstruction collaborator backed by the BART toolbox. sorted arrays are
/// exchanged as cfl pairs in a work directory and each call shells out to the
/// bart binary
pub struct BartEngine {
    settings:BartSettings,
    work_dir:PathBuf,
    matrix:[usize;3],
}

impl BartEngine {

    pub fn new(settings:BartSettings,work_dir:&Path,matrix:[usize;3]) -> Result<Self,ReconError> {
        create_dir_all(work_dir).map_err(|e| ReconError::Io {
            path: work_dir.display().to_string(),
            source: e,
        })?;
        Ok(Self {
            settings,
            work_dir: work_dir.to_owned(),
            matrix,
        })
    }

    fn base(&self,name:&str) -> PathBuf {
        self.work_dir.join(name)
    }

    fn run(&self,tool:&str,args:&[String]) -> Result<(),ReconError> {
        let mut cmd = Command::new(&self.settings.bart_binary);
        cmd.arg(tool);
        for a in args {
            cmd.arg(a);
        }
        log::debug!("{:?}",cmd);
        let output = cmd.output().map_err(|e| ReconError::Launch {
            tool: tool.to_string(),
            source: e,
        })?;
        if !output.status.success() {
            log::error!("{} failed: {}",tool,String::from_utf8_lossy(&output.stderr));
            return Err(ReconError::Failed {
                tool: tool.to_string(),
                status: output.status.to_string(),
            });
        }
        Ok(())
    }

    fn write_samples(&self,samples:&Array4<Complex<f32>>,name:&str) -> Result<PathBuf,ReconError> {
        let base = self.base(name);
        let flat = column_major(samples.view().into_dyn());
        let d = samples.dim();
        cfl::write_cfl(&flat,&[d.0,d.1,d.2,d.3],&base)?;
        Ok(base)
    }

    fn write_traj(&self,traj:&ndarray::Array3<f32>,name:&str) -> Result<PathBuf,ReconError> {
        let base = self.base(name);
        let complex = traj.mapv(|v| Complex::new(v,0.0));
        let flat = column_major(complex.view().into_dyn());
        let d = traj.dim();
        cfl::write_cfl(&flat,&[d.0,d.1,d.2],&base)?;
        Ok(base)
    }

    /// k-space and sensitivity arrays cross the boundary as (nx,ny,nz,nc)
    fn write_kspace(&self,kspace:&Array4<Complex<f32>>,name:&str) -> Result<PathBuf,ReconError> {
        let base = self.base(name);
        let permuted = kspace.view().permuted_axes([1,2,3,0]);
        let flat = column_major(permuted.into_dyn());
        let d = kspace.dim();
        cfl::write_cfl(&flat,&[d.1,d.2,d.3,d.0],&base)?;
        Ok(base)
    }

    fn nufft_inverse(&self,traj:&Path,data:&Path,out:&Path) -> Result<(),ReconError> {
        let [nx,_,nz] = self.matrix;
        self.run("nufft",&[
            String::from("-i"),
            format!("-l{}",self.settings.nufft_lambda),
            format!("-d{}:{}:{}",nx,nx,nz),
            String::from("-t"),
            path_arg(traj),
            path_arg(data),
            path_arg(out),
        ])
    }

    fn pics(&self,traj:Option<&Path>,data:&Path,sens:&Path,out:&Path) -> Result<(),ReconError> {
        let mut args = vec![
            String::from("-l1"),
            format!("-r{}",self.settings.regularization),
            format!("-i{}",self.settings.max_iter),
        ];
        if self.settings.respect_scaling {
            args.push(String::from("-S"));
        }
        if let Some(t) = traj {
            args.push(String::from("-e"));
            args.push(String::from("-t"));
            args.push(path_arg(t));
        }
        args.push(path_arg(data));
        args.push(path_arg(sens));
        args.push(path_arg(out));
        self.run("pics",&args)
    }

    fn ecalib(&self,kspace:&Path,out:&Path) -> Result<(),ReconError> {
        self.run("ecalib",&[
            String::from("-m"),
            String::from("1"),
            format!("-k{}",self.settings.espirit_kernel),
            String::from("-I"),
            path_arg(kspace),
            path_arg(out),
        ])
    }

    fn try_reconstruct(&self,traj:&Array3<f32>,samples:&Array4<Complex<f32>>,sens:Option<&SensitivityMap>) -> Result<Array3<Complex<f32>>,ReconError> {
        let traj_base = self.write_traj(traj,"traj")?;
        let data_base = self.write_samples(samples,"rawdata")?;
        let img_base = self.base("img");
        match sens {
            Some(map) => {
                let sens_base = self.write_kspace(&map.view().permuted_axes([3,0,1,2]).to_owned(),"sens")?;
                self.pics(Some(&traj_base),&data_base,&sens_base,&img_base)?;
                let (data,dims) = cfl::read_cfl(&img_base)?;
                array3_from(data,&dims,"pics")
            }
            None => {
                // inverse gridding per channel, combined by sum of squares
                self.nufft_inverse(&traj_base,&data_base,&img_base)?;
                let (data,dims) = cfl::read_cfl(&img_base)?;
                let channels = array4_from(data,&dims,"nufft")?;
                Ok(sum_of_squares(&channels))
            }
        }
    }

    fn try_reconstruct_cartesian(&self,kspace:&Array4<Complex<f32>>) -> Result<Array3<Complex<f32>>,ReconError> {
        let ksp_base = self.write_kspace(kspace,"ksp")?;
        let sens_base = self.base("ksp_sens");
        let img_base = self.base("img");
        // a unit sensitivity turns pics into a plain regularized inversion
        let d = kspace.dim();
        self.run("ones",&[
            String::from("4"),
            d.1.to_string(),
            d.2.to_string(),
            d.3.to_string(),
            d.0.to_string(),
            path_arg(&sens_base),
        ])?;
        self.pics(None,&ksp_base,&sens_base,&img_base)?;
        let (data,dims) = cfl::read_cfl(&img_base)?;
        array3_from(data,&dims,"pics")
    }

    fn try_calibrate(&self,kspace:&Array4<Complex<f32>>) -> Result<SensitivityMap,ReconError> {
        let ksp_base = self.write_kspace(kspace,"acs")?;
        let sens_base = self.base("sensmap");
        self.ecalib(&ksp_base,&sens_base)?;
        let (data,dims) = cfl::read_cfl(&sens_base)?;
        array4_from(data,&dims,"ecalib")
    }

    fn try_sens_from_raw(&self,traj:&Array3<f32>,samples:&Array4<Complex<f32>>) -> Result<SensitivityMap,ReconError> {
        let traj_base = self.write_traj(traj,"traj")?;
        let data_base = self.write_samples(samples,"rawdata")?;
        let img_base = self.base("lowres");
        let ksp_base = self.base("lowres_ksp");
        let sens_base = self.base("sensmap");
        self.nufft_inverse(&traj_base,&data_base,&img_base)?;
        // back to k-space over the three spatial axes, then calibrate
        self.run("fft",&[
            String::from("-u"),
            String::from("7"),
            path_arg(&img_base),
            path_arg(&ksp_base),
        ])?;
        self.run("ecalib",&[
            String::from("-m"),
            String::from("1"),
            String::from("-I"),
            path_arg(&ksp_base),
            path_arg(&sens_base),
        ])?;
        let (data,dims) = cfl::read_cfl(&sens_base)?;
        array4_from(data,&dims,"ecalib")
    }
}

impl ReconEngine for BartEngine {
    fn reconstruct(&self,traj:&Array3<f32>,samples:&Array4<Complex<f32>>,sens:Option<&SensitivityMap>) -> Result<Array3<Complex<f32>>,EngineError> {
        self.try_reconstruct(traj,samples,sens).map_err(|e| EngineError(e.to_string()))
    }
    fn reconstruct_cartesian(&self,kspace:&Array4<Complex<f32>>) -> Result<Array3<Complex<f32>>,EngineError> {
        self.try_reconstruct_cartesian(kspace).map_err(|e| EngineError(e.to_string()))
    }
    fn calibrate(&self,kspace:&Array4<Complex<f32>>) -> Result<SensitivityMap,EngineError> {
        self.try_calibrate(kspace).map_err(|e| EngineError(e.to_string()))
    }
    fn sens_from_raw(&self,traj:&Array3<f32>,samples:&Array4<Complex<f32>>) -> Result<SensitivityMap,EngineError> {
        self.try_sens_from_raw(traj,samples).map_err(|e| EngineError(e.to_string()))
    }
}

fn path_arg(p:&Path) -> String {
    p.display().to_string()
}

/// cfl payloads are column major: flatten with the first axis fastest
fn column_major(view:ndarray::ArrayViewD<Complex<f32>>) -> Vec<Complex<f32>> {
    view.reversed_axes().iter().cloned().collect()
}

fn array3_from(data:Vec<Complex<f32>>,dims:&[usize],tool:&str) -> Result<Array3<Complex<f32>>,ReconError> {
    let mut d = dims.to_vec();
    while d.len() < 3 {
        d.push(1);
    }
    if d[3..].iter().any(|&x| x != 1) {
        return Err(ReconError::BadResult { tool: tool.to_string(), dims: dims.to_vec() });
    }
    let arr = Array3::from_shape_vec((d[2],d[1],d[0]),data)
        .map_err(|_| ReconError::BadResult { tool: tool.to_string(), dims: dims.to_vec() })?;
    Ok(arr.reversed_axes().as_standard_layout().to_owned())
}

fn array4_from(data:Vec<Complex<f32>>,dims:&[usize],tool:&str) -> Result<Array4<Complex<f32>>,ReconError> {
    let mut d = dims.to_vec();
    while d.len() < 4 {
        d.push(1);
    }
    if d[4..].iter().any(|&x| x != 1) {
        return Err(ReconError::BadResult { tool: tool.to_string(), dims: dims.to_vec() });
    }
    let arr = Array4::from_shape_vec((d[3],d[2],d[1],d[0]),data)
        .map_err(|_| ReconError::BadResult { tool: tool.to_string(), dims: dims.to_vec() })?;
    Ok(arr.reversed_axes().as_standard_layout().to_owned())
}

fn sum_of_squares(channels:&Array4<Complex<f32>>) -> Array3<Complex<f32>> {
    let (nx,ny,nz,nc) = channels.dim();
    let mut out = Array3::<Complex<f32>>::zeros((nx,ny,nz));
    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                let mut acc = 0.0f32;
                for c in 0..nc {
                    acc += channels[[x,y,z,c]].norm_sqr();
                }
                out[[x,y,z]] = Complex::new(acc.sqrt(),0.0);
            }
        }
    }
    out
}
