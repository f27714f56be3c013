// Analysis frames: the latest window of samples plus its magnitude spectrum.
//
// The analyzer owns every buffer it touches and reuses them on each tick, so
// steady-state analysis performs no allocation.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::debug;

use crate::audio::features::FeatureSet;
use crate::error::EngineError;

pub const MIN_FFT_SIZE: usize = 32;
pub const MAX_FFT_SIZE: usize = 32_768;

/// Spectrum values below this level map to 0.
pub const MIN_DECIBELS: f32 = -100.0;
/// Spectrum values above this level map to 1.
pub const MAX_DECIBELS: f32 = -30.0;
/// Weight given to the previous spectrum when smoothing over time.
pub const SMOOTHING_TIME_CONSTANT: f32 = 0.8;

/// Time-domain window and its normalized magnitude spectrum.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    time_domain: Vec<f32>,
    frequency: Vec<f32>,
}

impl AudioFrame {
    fn zeroed(fft_size: usize) -> Self {
        Self {
            time_domain: vec![0.0; fft_size],
            frequency: vec![0.0; fft_size / 2],
        }
    }

    /// Samples in [-1, 1], oldest first.
    pub fn time_domain(&self) -> &[f32] {
        &self.time_domain
    }

    /// `fft_size / 2` magnitudes normalized to [0, 1].
    pub fn frequency(&self) -> &[f32] {
        &self.frequency
    }
}

pub fn validate_fft_size(fft_size: usize) -> Result<(), EngineError> {
    if !fft_size.is_power_of_two() || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft_size) {
        return Err(EngineError::InvalidConfig(format!(
            "fft_size must be a power of two between {MIN_FFT_SIZE} and {MAX_FFT_SIZE}, got {fft_size}"
        )));
    }
    Ok(())
}

pub struct FrameAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    sample_rate: u32,
    window: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    frame: AudioFrame,
}

impl FrameAnalyzer {
    pub fn new(fft_size: usize, sample_rate: u32) -> Result<Self, EngineError> {
        validate_fft_size(fft_size)?;
        if sample_rate == 0 {
            return Err(EngineError::InvalidConfig(
                "sample_rate must be non-zero".to_string(),
            ));
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        // Blackman window, as used by browser analyser nodes.
        let n = fft_size as f32;
        let window = (0..fft_size)
            .map(|i| {
                let x = i as f32 / n;
                0.42 - 0.5 * (2.0 * std::f32::consts::PI * x).cos()
                    + 0.08 * (4.0 * std::f32::consts::PI * x).cos()
            })
            .collect();

        debug!(fft_size, sample_rate, "frame analyzer ready");

        Ok(Self {
            fft,
            fft_size,
            sample_rate,
            window,
            spectrum: vec![Complex::new(0.0, 0.0); fft_size],
            scratch,
            smoothed: vec![0.0; fft_size / 2],
            frame: AudioFrame::zeroed(fft_size),
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Let `fill` write the latest `fft_size` samples into the frame, then
    /// recompute the spectrum.
    pub fn analyze_with(&mut self, fill: impl FnOnce(&mut [f32])) -> &AudioFrame {
        fill(&mut self.frame.time_domain);
        self.update_spectrum();
        &self.frame
    }

    /// Analyze the trailing `fft_size` samples of `samples`, zero-padding at
    /// the front if fewer are available.
    pub fn analyze(&mut self, samples: &[f32]) -> &AudioFrame {
        let fft_size = self.fft_size;
        self.analyze_with(|buf| {
            let take = samples.len().min(fft_size);
            let pad = fft_size - take;
            buf[..pad].fill(0.0);
            buf[pad..].copy_from_slice(&samples[samples.len() - take..]);
        })
    }

    /// Convenience: analyze and extract features in one step.
    pub fn features(&mut self, samples: &[f32]) -> FeatureSet {
        let sample_rate = self.sample_rate;
        FeatureSet::extract(self.analyze(samples), sample_rate)
    }

    pub fn features_with(&mut self, fill: impl FnOnce(&mut [f32])) -> FeatureSet {
        let sample_rate = self.sample_rate;
        FeatureSet::extract(self.analyze_with(fill), sample_rate)
    }

    fn update_spectrum(&mut self) {
        for ((slot, &sample), &w) in self
            .spectrum
            .iter_mut()
            .zip(&self.frame.time_domain)
            .zip(&self.window)
        {
            *slot = Complex::new(sample * w, 0.0);
        }

        self.fft
            .process_with_scratch(&mut self.spectrum, &mut self.scratch);

        let scale = 1.0 / self.fft_size as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        for ((bin, smoothed), out) in self
            .spectrum
            .iter()
            .zip(self.smoothed.iter_mut())
            .zip(self.frame.frequency.iter_mut())
        {
            let magnitude = bin.norm() * scale;
            *smoothed =
                SMOOTHING_TIME_CONSTANT * *smoothed + (1.0 - SMOOTHING_TIME_CONSTANT) * magnitude;
            *out = if *smoothed > 0.0 {
                let db = 20.0 * smoothed.log10();
                ((db - MIN_DECIBELS) / range).clamp(0.0, 1.0)
            } else {
                0.0
            };
        }
    }
}
