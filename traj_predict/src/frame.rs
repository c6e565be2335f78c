use mr_data::record::Pose;
use ndarray::Array2;

fn round6(x:f32) -> f32 {
    (x * 1e6).round() / 1e6
}

/// rotation between the logical gradient axes (phase, read, slice) and the
/// fixed device axes, built from the acquisition's direction cosines.
/// columns are the logical unit vectors expressed in device coordinates
#[derive(Clone,Copy,Debug)]
pub struct Rotation {
    m:[[f32;3];3],
}

impl Rotation {

    pub fn from_pose(pose:&Pose) -> Self {
        let mut m = [[0.0f32;3];3];
        for r in 0..3 {
            m[r][0] = round6(pose.phase_dir[r]);
            m[r][1] = round6(pose.read_dir[r]);
            m[r][2] = round6(pose.slice_dir[r]);
        }
        Self { m }
    }

    /// rotate a [3, samples] gradient from logical axes into the device frame
    pub fn logical_to_device(&self,grad:&Array2<f32>) -> Array2<f32> {
        self.apply(grad,false)
    }

    /// inverse rotation. direction cosines are orthonormal so the inverse is
    /// the transpose
    pub fn device_to_logical(&self,grad:&Array2<f32>) -> Array2<f32> {
        self.apply(grad,true)
    }

    /// express a patient-coordinate vector (e.g. the slice position) in
    /// logical axes
    pub fn patient_to_logical(&self,v:[f32;3]) -> [f32;3] {
        let mut out = [0.0f32;3];
        for r in 0..3 {
            for c in 0..3 {
                out[r] += self.m[c][r] * v[c];
            }
        }
        out
    }

    fn apply(&self,grad:&Array2<f32>,transpose:bool) -> Array2<f32> {
        let n = grad.dim().1;
        let mut out = Array2::<f32>::zeros((3,n));
        for s in 0..n {
            for r in 0..3 {
                let mut acc = 0.0;
                for c in 0..3 {
                    let m = if transpose { self.m[c][r] } else { self.m[r][c] };
                    acc += m * grad[[c,s]];
                }
                out[[r,s]] = acc;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tilted_pose() -> Pose {
        // in-plane rotation by 30 degrees about the slice axis
        let c = (30.0f32).to_radians().cos();
        let s = (30.0f32).to_radians().sin();
        Pose {
            phase_dir: [c,s,0.0],
            read_dir: [-s,c,0.0],
            slice_dir: [0.0,0.0,1.0],
            position: [0.0,0.0,0.0],
        }
    }

    #[test]
    fn identity_pose_is_identity() {
        let rot = Rotation::from_pose(&Pose::default());
        let g = Array2::from_shape_vec((3,2),vec![1.0,2.0,3.0,4.0,5.0,6.0]).unwrap();
        let d = rot.logical_to_device(&g);
        // the default pose maps phase->y, read->x, slice->z
        assert_eq!(d[[0,0]],3.0);
        assert_eq!(d[[1,0]],1.0);
        assert_eq!(d[[2,0]],5.0);
    }

    #[test]
    fn rotation_round_trip() {
        let rot = Rotation::from_pose(&tilted_pose());
        let g = Array2::from_shape_vec((3,3),vec![1.0,0.5,-0.3,0.0,2.0,1.0,-1.0,0.0,0.7]).unwrap();
        let back = rot.device_to_logical(&rot.logical_to_device(&g));
        for (a,b) in back.iter().zip(g.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn patient_vector_follows_the_same_inverse() {
        let rot = Rotation::from_pose(&tilted_pose());
        let v = rot.patient_to_logical([1.0,0.0,0.0]);
        let c = (30.0f32).to_radians().cos();
        let s = (30.0f32).to_radians().sin();
        assert!((v[0] - c).abs() < 1e-5);
        assert!((v[1] + s).abs() < 1e-5);
        assert!(v[2].abs() < 1e-5);
    }
}
