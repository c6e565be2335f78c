pub mod engine;
pub mod error;
pub mod reassemble;
pub mod router;
pub mod sort;
pub mod whiten;

pub use engine::{EngineError, ReconEngine};
pub use error::StreamError;
pub use router::{AcquisitionRouter, CompletedGroup, RouterConfig, TrailingPolicy};
pub use whiten::NoiseModel;
