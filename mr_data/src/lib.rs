pub mod cfl;
pub mod record;

pub use record::{AcqRole, AcquisitionRecord, CompletionFlags, EncodingIdx, ImageVolume, InProgressReadout,
                 Pose, RecordError, SensitivityMap, StreamItem, TrajectorySource, Waveform};
