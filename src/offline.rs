// Detection over a recorded file, without real-time pacing.
//
// Audio is pushed through the same suppressor, frame analyzer and VAD as a
// live session. The tick clock is derived from the sample position, so a
// file produces the same transitions no matter how fast it is processed.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use crate::audio::frame::FrameAnalyzer;
use crate::audio::ring_buffer::RingBuffer;
use crate::audio::source::read_wav_mono;
use crate::audio::suppression::{NoiseSuppressor, ProfileLoader, SuppressorLoader};
use crate::audio::vad::{Transition, VoiceActivityDetector};
use crate::calibration::CalibrationThresholds;
use crate::config::Config;
use crate::error::EngineError;

/// One speaking interval. `end` is the tick at which speech was declared
/// over, so it includes the hysteresis window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechSegment {
    pub start: Duration,
    pub end: Duration,
}

impl SpeechSegment {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

#[derive(Debug, Clone)]
pub struct OfflineReport {
    pub duration: Duration,
    pub sample_rate: u32,
    pub ticks: usize,
    pub segments: Vec<SpeechSegment>,
}

impl OfflineReport {
    pub fn speech_time(&self) -> Duration {
        self.segments.iter().map(SpeechSegment::duration).sum()
    }
}

pub async fn analyze_file(
    path: &Path,
    config: &Config,
    thresholds: &CalibrationThresholds,
) -> Result<OfflineReport> {
    let (samples, sample_rate) = read_wav_mono(path)?;
    let loader = ProfileLoader::from_config(&config.suppression);
    let mut suppressor = loader.load(sample_rate).await?;
    info!(
        "Analyzing {} ({} samples at {} Hz, suppressor {})",
        path.display(),
        samples.len(),
        sample_rate,
        suppressor.name()
    );
    Ok(analyze_samples(
        &samples,
        sample_rate,
        config,
        thresholds,
        suppressor.as_mut(),
    )?)
}

pub fn analyze_samples(
    samples: &[f32],
    sample_rate: u32,
    config: &Config,
    thresholds: &CalibrationThresholds,
    suppressor: &mut dyn NoiseSuppressor,
) -> Result<OfflineReport, EngineError> {
    config.validate()?;
    if sample_rate == 0 {
        return Err(EngineError::InvalidConfig(
            "sample rate must be non-zero".to_string(),
        ));
    }

    let mut analyzer = FrameAnalyzer::new(config.capture.fft_size, sample_rate)?;
    let mut window = RingBuffer::new(config.capture.fft_size);
    let mut vad = VoiceActivityDetector::new(config.hysteresis());

    let tick = config.tick_interval();
    let duration = Duration::from_secs_f64(samples.len() as f64 / f64::from(sample_rate));
    let mut block: Vec<f32> = Vec::new();
    let mut consumed = 0usize;
    let mut ticks = 0usize;
    let mut open: Option<Duration> = None;
    let mut segments = Vec::new();

    loop {
        let now = tick * ticks as u32;
        if now > duration {
            break;
        }

        // Everything captured up to this tick has reached the tap.
        let due = ((now.as_secs_f64() * f64::from(sample_rate)) as usize).min(samples.len());
        if due > consumed {
            block.clear();
            block.extend_from_slice(&samples[consumed..due]);
            suppressor.process(&mut block);
            window.push(&block);
            consumed = due;
        }

        let features = analyzer.features_with(|buf| window.copy_latest(buf));
        match vad.update(&features, thresholds, now) {
            Some(Transition::Started) => open = Some(now),
            Some(Transition::Ended) => {
                if let Some(start) = open.take() {
                    segments.push(SpeechSegment { start, end: now });
                }
            }
            None => {}
        }
        ticks += 1;
    }

    if let Some(start) = open {
        debug!("Speech still open at end of input");
        segments.push(SpeechSegment {
            start,
            end: duration,
        });
    }

    Ok(OfflineReport {
        duration,
        sample_rate,
        ticks,
        segments,
    })
}
