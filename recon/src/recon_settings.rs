use std::path::PathBuf;
use mr_protocol::ConfigFile;
use serde::{Deserialize, Serialize};

/// options for the external BART reconstruction binary
#[derive(Clone,Debug,Serialize,Deserialize)]
pub struct BartSettings {
    pub bart_binary:PathBuf,
    pub max_iter:u32,
    pub regularization:f32,
    pub respect_scaling:bool,
    /// ESPIRiT calibration kernel size
    pub espirit_kernel:u32,
    /// regularization for the inverse gridding fallback
    pub nufft_lambda:f32,
}

impl Default for BartSettings {
    fn default() -> Self {
        Self {
            bart_binary: PathBuf::from("bart"),
            max_iter: 50,
            regularization: 0.001,
            respect_scaling: true,
            espirit_kernel: 6,
            nufft_lambda: 0.005,
        }
    }
}

impl ConfigFile for BartSettings {
    fn file_ext() -> String {
        String::from("recon_settings")
    }
}
