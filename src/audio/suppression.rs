// Noise suppression stage of the processing graph.
//
// The graph only sees `NoiseSuppressor`: a block-in-place processor that
// runs on the source's real-time thread. Suppressors are produced by a
// `SuppressorLoader`, which may need I/O (a noise profile on disk) and is
// therefore async and fallible.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SuppressionConfig;
use crate::error::EngineError;

pub trait NoiseSuppressor: Send {
    fn process(&mut self, block: &mut [f32]);
    fn name(&self) -> &'static str;
}

#[async_trait]
pub trait SuppressorLoader: Send + Sync {
    async fn load(&self, sample_rate: u32) -> Result<Box<dyn NoiseSuppressor>, EngineError>;
}

pub struct Passthrough;

impl NoiseSuppressor for Passthrough {
    fn process(&mut self, _block: &mut [f32]) {}

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

/// One-pole high-pass filter removing DC offset and low rumble.
pub struct HighPassDenoiser {
    alpha: f32,
    prev_input: f32,
    prev_output: f32,
}

impl HighPassDenoiser {
    pub fn new(cutoff_hz: f32, sample_rate: u32) -> Self {
        let rc = 1.0 / (2.0 * std::f32::consts::PI * cutoff_hz.max(1.0));
        let dt = 1.0 / sample_rate.max(1) as f32;
        Self {
            alpha: rc / (rc + dt),
            prev_input: 0.0,
            prev_output: 0.0,
        }
    }
}

impl NoiseSuppressor for HighPassDenoiser {
    fn process(&mut self, block: &mut [f32]) {
        for sample in block.iter_mut() {
            let input = *sample;
            let output = self.alpha * (self.prev_output + input - self.prev_input);
            self.prev_input = input;
            self.prev_output = output;
            *sample = output;
        }
    }

    fn name(&self) -> &'static str {
        "highpass"
    }
}

/// Block-level noise gate. Opens when a block's RMS reaches the threshold,
/// stays open for the hold time, then fades out over the release time.
pub struct NoiseGate {
    threshold: f32,
    hold_samples: usize,
    release_step: f32,
    hold_remaining: usize,
    gain: f32,
}

impl NoiseGate {
    pub fn new(threshold_db: f32, hold_ms: u64, release_ms: u64, sample_rate: u32) -> Self {
        let per_ms = sample_rate as f32 / 1000.0;
        let release_samples = (release_ms as f32 * per_ms).max(1.0);
        Self {
            threshold: 10f32.powf(threshold_db / 20.0),
            hold_samples: (hold_ms as f32 * per_ms) as usize,
            release_step: 1.0 / release_samples,
            hold_remaining: 0,
            gain: 0.0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.gain > 0.0
    }
}

impl NoiseSuppressor for NoiseGate {
    fn process(&mut self, block: &mut [f32]) {
        if block.is_empty() {
            return;
        }
        let energy: f32 = block.iter().map(|s| s * s).sum::<f32>() / block.len() as f32;
        if energy.sqrt() >= self.threshold {
            self.gain = 1.0;
            self.hold_remaining = self.hold_samples;
            return;
        }

        for sample in block.iter_mut() {
            if self.hold_remaining > 0 {
                self.hold_remaining -= 1;
            } else if self.gain > 0.0 {
                self.gain = (self.gain - self.release_step).max(0.0);
            }
            *sample *= self.gain;
        }
    }

    fn name(&self) -> &'static str {
        "gate"
    }
}

/// `denoise -> gate`, applied in that order to every block.
pub struct SuppressionChain {
    denoise: Box<dyn NoiseSuppressor>,
    gate: Box<dyn NoiseSuppressor>,
}

impl SuppressionChain {
    pub fn new(denoise: Box<dyn NoiseSuppressor>, gate: Box<dyn NoiseSuppressor>) -> Self {
        Self { denoise, gate }
    }
}

impl NoiseSuppressor for SuppressionChain {
    fn process(&mut self, block: &mut [f32]) {
        self.denoise.process(block);
        self.gate.process(block);
    }

    fn name(&self) -> &'static str {
        "highpass+gate"
    }
}

/// Tunables for the built-in suppression chain, loadable from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseProfile {
    pub highpass_hz: f32,
    pub gate_threshold_db: f32,
    pub gate_hold_ms: u64,
    pub gate_release_ms: u64,
}

impl Default for NoiseProfile {
    fn default() -> Self {
        Self {
            highpass_hz: 80.0,
            gate_threshold_db: -50.0,
            gate_hold_ms: 150,
            gate_release_ms: 100,
        }
    }
}

impl From<&SuppressionConfig> for NoiseProfile {
    fn from(cfg: &SuppressionConfig) -> Self {
        Self {
            highpass_hz: cfg.highpass_hz,
            gate_threshold_db: cfg.gate_threshold_db,
            gate_hold_ms: cfg.gate_hold_ms,
            gate_release_ms: cfg.gate_release_ms,
        }
    }
}

impl NoiseProfile {
    pub fn validate(&self, sample_rate: u32) -> Result<(), String> {
        let nyquist = sample_rate as f32 / 2.0;
        if !(self.highpass_hz > 0.0 && self.highpass_hz < nyquist) {
            return Err(format!(
                "highpass_hz must be between 0 and {nyquist} Hz, got {}",
                self.highpass_hz
            ));
        }
        if !(self.gate_threshold_db <= 0.0) {
            return Err(format!(
                "gate_threshold_db must be at most 0 dBFS, got {}",
                self.gate_threshold_db
            ));
        }
        Ok(())
    }

    pub fn build(&self, sample_rate: u32) -> SuppressionChain {
        SuppressionChain::new(
            Box::new(HighPassDenoiser::new(self.highpass_hz, sample_rate)),
            Box::new(NoiseGate::new(
                self.gate_threshold_db,
                self.gate_hold_ms,
                self.gate_release_ms,
                sample_rate,
            )),
        )
    }
}

/// Loads the built-in chain, optionally tuned by a profile file.
pub struct ProfileLoader {
    enabled: bool,
    profile_path: Option<PathBuf>,
    fallback: NoiseProfile,
}

impl ProfileLoader {
    pub fn from_config(cfg: &SuppressionConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            profile_path: cfg.profile.clone(),
            fallback: NoiseProfile::from(cfg),
        }
    }

    async fn read_profile(&self) -> Result<NoiseProfile, EngineError> {
        let Some(path) = &self.profile_path else {
            return Ok(self.fallback.clone());
        };
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| EngineError::SuppressionLoad(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| EngineError::SuppressionLoad(format!("{}: {e}", path.display())))
    }
}

#[async_trait]
impl SuppressorLoader for ProfileLoader {
    async fn load(&self, sample_rate: u32) -> Result<Box<dyn NoiseSuppressor>, EngineError> {
        if !self.enabled {
            return Ok(Box::new(Passthrough));
        }
        let profile = self.read_profile().await?;
        profile
            .validate(sample_rate)
            .map_err(EngineError::SuppressionLoad)?;
        tracing::debug!(?profile, "noise profile loaded");
        Ok(Box::new(profile.build(sample_rate)))
    }
}
