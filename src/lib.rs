pub mod audio;
pub mod calibration;
pub mod config;
pub mod engine;
pub mod error;
pub mod offline;
pub mod streaming;

pub use calibration::CalibrationThresholds;
pub use config::Config;
pub use engine::VoiceEngine;
pub use error::EngineError;
