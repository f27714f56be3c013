use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::frame::validate_fft_size;
use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub analysis: AnalysisConfig,
    pub calibration: CalibrationConfig,
    pub vad: VadConfig,
    pub suppression: SuppressionConfig,
    pub streaming: StreamingConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Input device name; `None` uses the system default.
    pub device: Option<String>,
    pub fft_size: usize,
    /// Block size used when replaying files as a live source.
    pub block_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub sample_count: usize,
    pub sample_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Continuous silence required before leaving the speaking state.
    pub hysteresis_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuppressionConfig {
    pub enabled: bool,
    /// Optional JSON noise profile overriding the values below.
    pub profile: Option<PathBuf>,
    pub highpass_hz: f32,
    pub gate_threshold_db: f32,
    pub gate_hold_ms: u64,
    pub gate_release_ms: u64,
}

/// Which side of the suppression stage feeds the chunk recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSource {
    Suppressed,
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub chunk_ms: u64,
    pub source: ChunkSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub thresholds_path: PathBuf,
    /// When set, `detect` also writes every chunk here as a WAV file.
    pub chunks_directory: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            analysis: AnalysisConfig::default(),
            calibration: CalibrationConfig::default(),
            vad: VadConfig::default(),
            suppression: SuppressionConfig::default(),
            streaming: StreamingConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            fft_size: 1024,
            block_ms: 10,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            sample_count: 100,
            sample_interval_ms: 50,
        }
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self { hysteresis_ms: 800 }
    }
}

impl Default for SuppressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            profile: None,
            highpass_hz: 80.0,
            gate_threshold_db: -50.0,
            gate_hold_ms: 150,
            gate_release_ms: 100,
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_ms: 1000,
            source: ChunkSource::Suppressed,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            thresholds_path: default_data_dir().join("thresholds.json"),
            chunks_directory: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("voxgate")
}

// --- Derived settings ---

impl Config {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.analysis.tick_interval_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.calibration.sample_interval_ms)
    }

    pub fn hysteresis(&self) -> Duration {
        Duration::from_millis(self.vad.hysteresis_ms)
    }

    pub fn chunk_duration(&self) -> Duration {
        Duration::from_millis(self.streaming.chunk_ms)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_fft_size(self.capture.fft_size)?;
        let non_zero = [
            ("analysis.tick_interval_ms", self.analysis.tick_interval_ms),
            ("calibration.sample_interval_ms", self.calibration.sample_interval_ms),
            ("streaming.chunk_ms", self.streaming.chunk_ms),
            ("capture.block_ms", self.capture.block_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(EngineError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

// --- Config loading ---

impl Config {
    /// Load config and return the resolved file path (if any).
    pub fn load_with_path(path: Option<&Path>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        // 1. Check explicit path
        if let Some(p) = path {
            let content = std::fs::read_to_string(p).map_err(|e| {
                anyhow::anyhow!("Failed to read config file {}: {}", p.display(), e)
            })?;
            let config: Config = toml::from_str(&content)?;
            return Ok((config, Some(p.to_path_buf())));
        }

        // 2. Check beside the executable
        if let Ok(exe_path) = std::env::current_exe() {
            let beside_exe = exe_path.parent().map(|p| p.join("voxgate.toml"));
            if let Some(p) = beside_exe {
                if p.exists() {
                    let content = std::fs::read_to_string(&p)?;
                    let config: Config = toml::from_str(&content)?;
                    return Ok((config, Some(p)));
                }
            }
        }

        // 3. Check platform config directory (e.g. ~/.config/voxgate/config.toml)
        if let Some(config_dir) = dirs::config_dir() {
            let platform_config = config_dir.join("voxgate").join("config.toml");
            if platform_config.exists() {
                let content = std::fs::read_to_string(&platform_config)?;
                let config: Config = toml::from_str(&content)?;
                return Ok((config, Some(platform_config)));
            }
        }

        // 4. Fall back to defaults
        tracing::info!("No config file found, using defaults");
        Ok((Config::default(), None))
    }

    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (config, _) = Self::load_with_path(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Generate a default config file with all fields and inline documentation.
    pub fn generate_default_commented() -> String {
        let thresholds_path = default_data_dir().join("thresholds.json");
        let thresholds_str = thresholds_path.to_string_lossy().replace('\\', "\\\\");

        format!(
r#"# voxgate configuration

[capture]
# Input device name. Leave unset to use the system default microphone.
# device = "USB Microphone"
# FFT size for spectral analysis. Power of two; 512 or 1024 are typical.
fft_size = 1024
# Block size in milliseconds when a WAV file is replayed as a live source.
block_ms = 10

[analysis]
# Interval between analysis ticks. Each tick extracts features from the
# most recent audio window and updates the speaking state.
tick_interval_ms = 50

[calibration]
# Number of feature samples collected during calibration.
sample_count = 100
# Interval between calibration samples (100 x 50 ms = 5 seconds).
sample_interval_ms = 50

[vad]
# Milliseconds of continuous silence before speech is considered finished.
# Lower = faster end-of-utterance, higher = more tolerant of pauses.
hysteresis_ms = 800

[suppression]
# Run audio through the noise suppression stage before analysis.
enabled = true
# Optional JSON noise profile; its values override the ones below.
# profile = "/path/to/profile.json"
# High-pass cutoff removing DC offset and low rumble.
highpass_hz = 80.0
# Blocks quieter than this (dBFS) are gated out.
gate_threshold_db = -50.0
# How long the gate stays open after the last loud block.
gate_hold_ms = 150
# Fade-out time once the gate closes.
gate_release_ms = 100

[streaming]
# Duration of each emitted audio chunk while speaking.
chunk_ms = 1000
# Which audio the chunks contain: "suppressed" or "raw".
source = "suppressed"

[output]
# Where calibration thresholds are stored.
thresholds_path = "{thresholds_path}"
# Directory for WAV copies of emitted chunks (detect command only).
# chunks_directory = "/path/to/chunks"
"#,
            thresholds_path = thresholds_str
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capture.fft_size, 1024);
        assert_eq!(config.analysis.tick_interval_ms, 50);
        assert_eq!(config.calibration.sample_count, 100);
        assert_eq!(config.calibration.sample_interval_ms, 50);
        assert_eq!(config.vad.hysteresis_ms, 800);
        assert!(config.suppression.enabled);
        assert!(config.suppression.profile.is_none());
        assert_eq!(config.streaming.chunk_ms, 1000);
        assert_eq!(config.streaming.source, ChunkSource::Suppressed);
        assert!(config.output.chunks_directory.is_none());
        assert!(config.output.thresholds_path.ends_with("thresholds.json"));
    }

    #[test]
    fn test_parse_toml_config() {
        let toml_str = r#"
            [capture]
            fft_size = 512

            [vad]
            hysteresis_ms = 1200
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.capture.fft_size, 512);
        assert_eq!(config.vad.hysteresis_ms, 1200);
        // Defaults still applied for unspecified fields
        assert_eq!(config.capture.block_ms, 10);
        assert_eq!(config.analysis.tick_interval_ms, 50);
        assert_eq!(config.calibration.sample_count, 100);
    }

    #[test]
    fn test_parse_full_toml_config() {
        let toml_str = r#"
            [capture]
            device = "USB Mic"
            fft_size = 2048
            block_ms = 20

            [analysis]
            tick_interval_ms = 40

            [calibration]
            sample_count = 60
            sample_interval_ms = 25

            [vad]
            hysteresis_ms = 1500

            [suppression]
            enabled = false
            profile = "/etc/voxgate/profile.json"
            highpass_hz = 120.0
            gate_threshold_db = -45.0
            gate_hold_ms = 200
            gate_release_ms = 50

            [streaming]
            chunk_ms = 500
            source = "raw"

            [output]
            thresholds_path = "/tmp/voxgate/thresholds.json"
            chunks_directory = "/tmp/voxgate/chunks"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.capture.device.as_deref(), Some("USB Mic"));
        assert_eq!(config.capture.fft_size, 2048);
        assert_eq!(config.tick_interval(), Duration::from_millis(40));
        assert_eq!(config.calibration.sample_count, 60);
        assert_eq!(config.sample_interval(), Duration::from_millis(25));
        assert_eq!(config.hysteresis(), Duration::from_millis(1500));
        assert!(!config.suppression.enabled);
        assert_eq!(
            config.suppression.profile,
            Some(PathBuf::from("/etc/voxgate/profile.json"))
        );
        assert_eq!(config.suppression.gate_hold_ms, 200);
        assert_eq!(config.streaming.source, ChunkSource::Raw);
        assert_eq!(config.chunk_duration(), Duration::from_millis(500));
        assert_eq!(
            config.output.chunks_directory,
            Some(PathBuf::from("/tmp/voxgate/chunks"))
        );
    }

    #[test]
    fn test_validate_rejects_bad_fft_size() {
        let mut config = Config::default();
        config.capture.fft_size = 1000;
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.analysis.tick_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tick_interval_ms"));
    }

    #[test]
    fn test_config_roundtrip_serialize() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.capture.fft_size, config.capture.fft_size);
        assert_eq!(parsed.vad.hysteresis_ms, config.vad.hysteresis_ms);
        assert_eq!(parsed.output.thresholds_path, config.output.thresholds_path);
    }

    #[test]
    fn test_load_nonexistent_path_errors() {
        let result = Config::load(Some(Path::new("/nonexistent/config.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_values_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config_file = tmp.path().join("voxgate.toml");
        std::fs::write(&config_file, "[capture]\nfft_size = 300\n").unwrap();
        assert!(Config::load(Some(config_file.as_path())).is_err());
    }

    #[test]
    fn test_load_with_path_returns_resolved_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config_file = tmp.path().join("voxgate.toml");
        std::fs::write(&config_file, "[vad]\nhysteresis_ms = 1000\n").unwrap();

        let (config, resolved) = Config::load_with_path(Some(config_file.as_path())).unwrap();
        assert_eq!(config.vad.hysteresis_ms, 1000);
        assert_eq!(resolved, Some(config_file));
    }

    #[test]
    fn test_generate_default_commented_is_valid_toml() {
        let content = Config::generate_default_commented();
        let config: Config = toml::from_str(&content).unwrap();
        assert_eq!(config.capture.fft_size, 1024);
        assert_eq!(config.calibration.sample_count, 100);
        assert_eq!(config.vad.hysteresis_ms, 800);
        assert_eq!(config.streaming.source, ChunkSource::Suppressed);
        assert_eq!(
            config.output.thresholds_path,
            Config::default().output.thresholds_path
        );
    }

    #[test]
    fn test_generate_default_commented_has_all_sections() {
        let content = Config::generate_default_commented();
        for section in [
            "[capture]",
            "[analysis]",
            "[calibration]",
            "[vad]",
            "[suppression]",
            "[streaming]",
            "[output]",
        ] {
            assert!(content.contains(section), "missing {section}");
        }
    }
}
