// Per-tick audio features.
//
// All functions here are pure and total: degenerate input (an empty frame or
// an all-zero spectrum) yields 0 rather than an error.

use crate::audio::frame::AudioFrame;

/// Only every `AMPLITUDE_STRIDE`th sample contributes to the amplitude.
pub const AMPLITUDE_STRIDE: usize = 4;

/// Features derived from a single analysis frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FeatureSet {
    /// Mean absolute deviation from zero, scaled to [0, 100].
    pub amplitude: f64,
    /// Magnitude-weighted mean frequency in Hz.
    pub spectral_centroid: f64,
    /// Fraction of adjacent samples that change sign, in [0, 1].
    pub zero_crossing_rate: f64,
}

impl FeatureSet {
    pub fn extract(frame: &AudioFrame, sample_rate: u32) -> Self {
        Self {
            amplitude: amplitude(frame.time_domain()),
            spectral_centroid: spectral_centroid(frame.frequency(), sample_rate),
            zero_crossing_rate: zero_crossing_rate(frame.time_domain()),
        }
    }
}

/// Mean absolute deviation of the time-domain samples, sampled at a fixed
/// stride and scaled ×100.
pub fn amplitude(time_frame: &[f32]) -> f64 {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for &sample in time_frame.iter().step_by(AMPLITUDE_STRIDE) {
        sum += f64::from(sample.abs().min(1.0));
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64 * 100.0).clamp(0.0, 100.0)
}

/// Magnitude-weighted mean frequency of a spectrum of `fft_size / 2` bins.
pub fn spectral_centroid(freq_frame: &[f32], sample_rate: u32) -> f64 {
    if freq_frame.is_empty() {
        return 0.0;
    }
    let fft_size = (freq_frame.len() * 2) as f64;
    let bin_width = f64::from(sample_rate) / fft_size;

    let mut weighted = 0.0f64;
    let mut total = 0.0f64;
    for (bin, &magnitude) in freq_frame.iter().enumerate() {
        let magnitude = f64::from(magnitude.max(0.0));
        weighted += bin as f64 * bin_width * magnitude;
        total += magnitude;
    }

    if total <= 0.0 {
        0.0
    } else {
        weighted / total
    }
}

/// Fraction of adjacent sample pairs whose sign differs.
pub fn zero_crossing_rate(time_frame: &[f32]) -> f64 {
    if time_frame.len() < 2 {
        return 0.0;
    }
    let crossings = time_frame
        .windows(2)
        .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
        .count();
    crossings as f64 / (time_frame.len() - 1) as f64
}
