pub mod bart;
pub mod recon_settings;

pub use bart::{BartEngine, ReconError};
pub use recon_settings::BartSettings;
