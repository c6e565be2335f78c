pub mod fft;
pub mod frame;
pub mod girf;
pub mod predict;

pub use frame::Rotation;
pub use girf::GirfResponse;
pub use predict::{predict, PredictedTrajectory, TrajError, DT_GRAD, GAMMA_BAR};
