// Calibration: derive detection thresholds from a short sampling session.
//
// A session collects a fixed number of `FeatureSet` samples at a fixed
// interval with no early exit, then reduces each metric to percentiles:
// amplitude at the 70th, spectral centroid and ZCR between the 10th and 90th.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::audio::features::FeatureSet;
use crate::audio::frame::FrameAnalyzer;
use crate::audio::graph::AnalyserTap;

pub const AMPLITUDE_PERCENTILE: f64 = 0.70;
pub const RANGE_LOW_PERCENTILE: f64 = 0.10;
pub const RANGE_HIGH_PERCENTILE: f64 = 0.90;

/// Thresholds consumed by the VAD. Persisted as a flat JSON record; absent
/// fields fall back to the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CalibrationThresholds {
    #[serde(alias = "amplitude_threshold")]
    pub amplitude_threshold: f64,
    #[serde(alias = "spectral_centroid_min")]
    pub spectral_centroid_min: f64,
    #[serde(alias = "spectral_centroid_max")]
    pub spectral_centroid_max: f64,
    #[serde(alias = "zcr_min")]
    pub zcr_min: f64,
    #[serde(alias = "zcr_max")]
    pub zcr_max: f64,
}

impl Default for CalibrationThresholds {
    /// Generic thresholds used before any calibration and when a
    /// calibration run collected no samples.
    fn default() -> Self {
        Self {
            amplitude_threshold: 15.0,
            spectral_centroid_min: 800.0,
            spectral_centroid_max: 5_000.0,
            zcr_min: 0.05,
            zcr_max: 0.35,
        }
    }
}

/// Value at `floor(p * n)` of an ascending slice. Caller guarantees non-empty.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let index = (sorted.len() as f64 * p).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

fn sorted_metric(samples: &[FeatureSet], metric: impl Fn(&FeatureSet) -> f64) -> Vec<f64> {
    let mut values: Vec<f64> = samples.iter().map(metric).collect();
    values.sort_by(f64::total_cmp);
    values
}

pub fn derive_thresholds(samples: &[FeatureSet]) -> CalibrationThresholds {
    if samples.is_empty() {
        return CalibrationThresholds::default();
    }

    let amplitudes = sorted_metric(samples, |f| f.amplitude);
    let centroids = sorted_metric(samples, |f| f.spectral_centroid);
    let zcrs = sorted_metric(samples, |f| f.zero_crossing_rate);

    CalibrationThresholds {
        amplitude_threshold: percentile(&amplitudes, AMPLITUDE_PERCENTILE),
        spectral_centroid_min: percentile(&centroids, RANGE_LOW_PERCENTILE),
        spectral_centroid_max: percentile(&centroids, RANGE_HIGH_PERCENTILE),
        zcr_min: percentile(&zcrs, RANGE_LOW_PERCENTILE),
        zcr_max: percentile(&zcrs, RANGE_HIGH_PERCENTILE),
    }
}

/// Accumulates samples up to a fixed budget.
pub struct CalibrationSampler {
    samples: Vec<FeatureSet>,
    target: usize,
}

impl CalibrationSampler {
    pub fn new(target: usize) -> Self {
        Self {
            samples: Vec::with_capacity(target),
            target,
        }
    }

    /// Record one sample. Returns true once the budget is reached; further
    /// samples are ignored.
    pub fn push(&mut self, features: FeatureSet) -> bool {
        if self.samples.len() < self.target {
            self.samples.push(features);
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.samples.len() >= self.target
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn finish(self) -> CalibrationThresholds {
        derive_thresholds(&self.samples)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CalibrationSettings {
    pub sample_count: usize,
    pub sample_interval: Duration,
}

/// Sample the analyser tap at a fixed interval until the budget is spent.
pub async fn run_calibration(
    tap: &AnalyserTap,
    analyzer: &mut FrameAnalyzer,
    settings: CalibrationSettings,
) -> CalibrationThresholds {
    let mut sampler = CalibrationSampler::new(settings.sample_count);
    let mut ticker = tokio::time::interval(settings.sample_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Calibrating: {} samples every {} ms",
        settings.sample_count,
        settings.sample_interval.as_millis()
    );
    while !sampler.is_complete() {
        ticker.tick().await;
        let features = analyzer.features_with(|buf| tap.copy_latest(buf));
        sampler.push(features);
    }

    debug!("Calibration collected {} samples", sampler.len());
    let thresholds = sampler.finish();
    info!(?thresholds, "Calibration complete");
    thresholds
}

/// Shared, swappable view of the active thresholds. Writers replace the whole
/// value; readers take a copy per tick.
#[derive(Debug, Clone, Default)]
pub struct ThresholdHandle {
    inner: Arc<RwLock<CalibrationThresholds>>,
}

impl ThresholdHandle {
    pub fn new(thresholds: CalibrationThresholds) -> Self {
        Self {
            inner: Arc::new(RwLock::new(thresholds)),
        }
    }

    pub fn current(&self) -> CalibrationThresholds {
        match self.inner.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn replace(&self, thresholds: CalibrationThresholds) {
        match self.inner.write() {
            Ok(mut guard) => *guard = thresholds,
            Err(poisoned) => *poisoned.into_inner() = thresholds,
        }
    }
}

/// JSON file holding the last calibration result.
pub struct ThresholdStore {
    path: PathBuf,
}

impl ThresholdStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means "never calibrated": defaults are returned.
    pub fn load(&self) -> Result<CalibrationThresholds> {
        if !self.path.exists() {
            return Ok(CalibrationThresholds::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, thresholds: &CalibrationThresholds) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(thresholds)?;
        // Write atomically: write to temp then rename, so a reader never sees
        // a half-written file.
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
