use mr_data::record::AcquisitionRecord;
use ndarray::Array2;
use num_complex::Complex;
use crate::error::StreamError;

/// inter-channel noise decorrelation transform. built once per stream from
/// the first contiguous run of noise-only records, immutable afterwards
#[derive(Clone,Debug)]
pub struct NoiseModel {
    dmtx:Array2<Complex<f32>>,
}

impl NoiseModel {

    /// factor the sample covariance of the concatenated noise records and
    /// invert the lower-triangular factor. the caller must not invoke this
    /// with an empty buffer
    pub fn build(noise:&[AcquisitionRecord]) -> Result<Self,StreamError> {
        if noise.is_empty() {
            return Err(StreamError::Noise("noise buffer is empty".to_string()));
        }
        let nc = noise[0].channels();
        let mut total = 0usize;
        for rec in noise {
            if rec.channels() != nc {
                return Err(StreamError::Noise(format!(
                    "noise records disagree on channel count ({} vs {})",rec.channels(),nc)));
            }
            total += rec.samples();
        }
        if total < 2 {
            return Err(StreamError::Noise(format!("{} noise samples are not enough for a covariance",total)));
        }

        let mut cov = Array2::<Complex<f32>>::zeros((nc,nc));
        for rec in noise {
            let ns = rec.samples();
            for i in 0..nc {
                for j in 0..nc {
                    let mut acc = Complex::new(0.0f32,0.0);
                    for s in 0..ns {
                        acc += rec.data[[i,s]] * rec.data[[j,s]].conj();
                    }
                    cov[[i,j]] += acc;
                }
            }
        }
        let norm = 1.0 / (total as f32 - 1.0);
        cov.mapv_inplace(|c| c * norm);

        let l = cholesky_lower(&cov)?;
        let mut dmtx = invert_lower(&l);
        // scale to unit variance in the real and imaginary parts
        let scale = 2.0f32.sqrt();
        dmtx.mapv_inplace(|c| c * scale);
        Ok(Self { dmtx })
    }

    pub fn channels(&self) -> usize {
        self.dmtx.dim().0
    }

    /// left-multiply a [channels, samples] readout by the decorrelation matrix
    pub fn apply(&self,data:&Array2<Complex<f32>>) -> Array2<Complex<f32>> {
        let (nc,ns) = data.dim();
        let mut out = Array2::<Complex<f32>>::zeros((nc,ns));
        for i in 0..nc {
            // the factor is lower triangular, rows only reach back
            for k in 0..=i {
                let w = self.dmtx[[i,k]];
                if w == Complex::new(0.0,0.0) {
                    continue;
                }
                for s in 0..ns {
                    out[[i,s]] += w * data[[k,s]];
                }
            }
        }
        out
    }
}

/// cholesky factorization of a small hermitian positive-definite matrix.
/// channel counts are tiny so no external solver is needed
fn cholesky_lower(a:&Array2<Complex<f32>>) -> Result<Array2<Complex<f32>>,StreamError> {
    let n = a.dim().0;
    let mut l = Array2::<Complex<f32>>::zeros((n,n));
    for j in 0..n {
        let mut diag = a[[j,j]].re;
        for k in 0..j {
            diag -= l[[j,k]].norm_sqr();
        }
        if diag <= 0.0 || !diag.is_finite() {
            return Err(StreamError::Noise(format!("covariance is not positive definite at channel {}",j)));
        }
        let d = diag.sqrt();
        l[[j,j]] = Complex::new(d,0.0);
        for i in (j + 1)..n {
            let mut acc = a[[i,j]];
            for k in 0..j {
                acc -= l[[i,k]] * l[[j,k]].conj();
            }
            l[[i,j]] = acc / d;
        }
    }
    Ok(l)
}

/// inverse of a lower-triangular matrix by forward substitution
fn invert_lower(l:&Array2<Complex<f32>>) -> Array2<Complex<f32>> {
    let n = l.dim().0;
    let mut inv = Array2::<Complex<f32>>::zeros((n,n));
    for j in 0..n {
        inv[[j,j]] = Complex::new(1.0,0.0) / l[[j,j]];
        for i in (j + 1)..n {
            let mut acc = Complex::new(0.0f32,0.0);
            for k in j..i {
                acc += l[[i,k]] * inv[[k,j]];
            }
            inv[[i,j]] = -acc / l[[i,i]];
        }
    }
    inv
}

#[cfg(test)]
mod tests {
    use super::*;
    use mr_data::record::{AcqRole, EncodingIdx};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn correlated_noise(rng:&mut StdRng,samples:usize) -> AcquisitionRecord {
        let mut data = Array2::<Complex<f32>>::zeros((2,samples));
        for s in 0..samples {
            let a = Complex::new(rng.gen::<f32>() - 0.5,rng.gen::<f32>() - 0.5);
            let b = Complex::new(rng.gen::<f32>() - 0.5,rng.gen::<f32>() - 0.5);
            data[[0,s]] = a;
            data[[1,s]] = a * 0.8 + b * 0.6;
        }
        AcquisitionRecord::new(EncodingIdx::default(),AcqRole::Noise,data)
    }

    /// magnitude of the inter-channel correlation coefficient
    fn correlation(data:&Array2<Complex<f32>>) -> f32 {
        let ns = data.dim().1;
        let mut c01 = Complex::new(0.0f32,0.0);
        let mut c00 = 0.0f32;
        let mut c11 = 0.0f32;
        for s in 0..ns {
            c01 += data[[0,s]] * data[[1,s]].conj();
            c00 += data[[0,s]].norm_sqr();
            c11 += data[[1,s]].norm_sqr();
        }
        c01.norm() / (c00 * c11).sqrt()
    }

    #[test]
    fn whitening_decorrelates_the_channels() {
        let mut rng = StdRng::seed_from_u64(17);
        let records:Vec<AcquisitionRecord> = (0..4).map(|_| correlated_noise(&mut rng,4096)).collect();
        let model = NoiseModel::build(&records).unwrap();
        assert_eq!(model.channels(),2);

        let raw = ndarray::concatenate(ndarray::Axis(1),
            &records.iter().map(|r| r.data.view()).collect::<Vec<_>>()).unwrap();
        let white = model.apply(&raw);
        let before = correlation(&raw);
        let after = correlation(&white);
        assert!(before > 0.5,"test input should be visibly correlated, got {}",before);
        assert!(after < 0.05,"residual correlation {} (was {})",after,before);
    }

    #[test]
    fn empty_buffer_is_rejected() {
        assert!(matches!(NoiseModel::build(&[]),Err(StreamError::Noise(_))));
    }

    #[test]
    fn mismatched_channel_counts_are_rejected() {
        let a = AcquisitionRecord::new(EncodingIdx::default(),AcqRole::Noise,
            Array2::from_elem((2,8),Complex::new(1.0,0.0)));
        let b = AcquisitionRecord::new(EncodingIdx::default(),AcqRole::Noise,
            Array2::from_elem((3,8),Complex::new(1.0,0.0)));
        assert!(matches!(NoiseModel::build(&[a,b]),Err(StreamError::Noise(_))));
    }

    #[test]
    fn identity_covariance_scales_by_sqrt_two() {
        // two independent channels that already have unit variance per
        // complex sample should come out scaled by sqrt(2) and stay diagonal
        let mut rng = StdRng::seed_from_u64(3);
        let mut data = Array2::<Complex<f32>>::zeros((2,4096));
        for s in 0..4096 {
            for c in 0..2 {
                // uniform on [-a,a] per part, variance 2*a^2/3 = 1 for the
                // complex sample when a = sqrt(3/2)
                let a = (1.5f32).sqrt();
                data[[c,s]] = Complex::new((rng.gen::<f32>() * 2.0 - 1.0) * a,(rng.gen::<f32>() * 2.0 - 1.0) * a);
            }
        }
        let rec = AcquisitionRecord::new(EncodingIdx::default(),AcqRole::Noise,data);
        let model = NoiseModel::build(&[rec]).unwrap();
        let d0 = model.dmtx[[0,0]];
        assert!((d0.re - 2.0f32.sqrt()).abs() < 0.15,"diagonal scale {}",d0.re);
        assert!(model.dmtx[[1,0]].norm() < 0.15);
    }
}
