use mr_data::record::RecordError;
use mr_protocol::ProtocolError;
use thiserror::Error;
use traj_predict::TrajError;

#[derive(Debug,Error)]
pub enum StreamError {
    /// required header fields absent or inconsistent. fatal, aborts the stream
    #[error("protocol mismatch: {0}")]
    Protocol(String),
    /// a record arrived that the stream state cannot accept. fatal for the
    /// affected readout only
    #[error("sequencing error: {0}")]
    Sequencing(String),
    #[error("noise decorrelation failed: {0}")]
    Noise(String),
    /// the external reconstruction call failed. fatal for that group, groups
    /// already emitted are unaffected
    #[error("reconstruction collaborator failed: {0}")]
    Collaborator(String),
    #[error(transparent)]
    Prediction(#[from] TrajError),
}

impl From<RecordError> for StreamError {
    fn from(e:RecordError) -> Self {
        StreamError::Sequencing(e.to_string())
    }
}

impl From<ProtocolError> for StreamError {
    fn from(e:ProtocolError) -> Self {
        StreamError::Protocol(e.to_string())
    }
}
