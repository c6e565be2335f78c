pub mod protocol;
pub mod settings;

pub use protocol::{EncodingLimits, FieldOfView, Limit, MatrixSize, ProtocolError, ProtocolSnapshot, TrajectoryKind, UserParams};
pub use settings::{ConfigFile, SettingsError};
