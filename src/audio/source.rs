// Audio sources feeding the processing graph.
//
// A source delivers mono f32 blocks to a sink on its own thread (the
// real-time side). The analysis loop never reads from a source directly; it
// samples whatever the graph's analyser tap holds at tick time.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader};

use crate::error::EngineError;

/// Receives each block of mono samples produced by a source.
pub type BlockSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrack {
    pub label: String,
    pub enabled: bool,
    pub live: bool,
}

impl AudioTrack {
    pub fn is_active(&self) -> bool {
        self.enabled && self.live
    }
}

pub trait AudioSource {
    /// The audio track this source would capture, if it has one.
    fn audio_track(&self) -> Option<AudioTrack>;

    fn sample_rate(&self) -> u32;

    /// Install the sink that receives every captured block.
    fn connect(&mut self, sink: BlockSink) -> Result<(), EngineError>;

    /// Start (or resume) block delivery.
    fn resume(&mut self) -> Result<(), EngineError>;

    /// Stop delivery and release the underlying device. Safe to call more
    /// than once, and on a source that was never connected.
    fn close(&mut self);
}

/// Downmix interleaved input to mono, converting each sample with `convert`.
pub fn append_downmixed_samples<T, F>(
    buf: &mut Vec<f32>,
    data: &[T],
    channels: usize,
    mut convert: F,
) where
    T: Copy,
    F: FnMut(T) -> f32,
{
    if channels <= 1 {
        buf.extend(data.iter().copied().map(&mut convert));
        return;
    }

    let mut acc = 0.0f32;
    let mut count = 0usize;
    for sample in data.iter().copied() {
        acc += convert(sample);
        count += 1;
        if count == channels {
            buf.push(acc / channels as f32);
            acc = 0.0;
            count = 0;
        }
    }
    if count > 0 {
        buf.push(acc / count as f32);
    }
}

/// Decode a WAV file to mono f32 samples in [-1, 1]. Returns the samples and
/// the file's sample rate.
pub fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, u32)> {
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file {}", path.display()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let mut samples = Vec::new();
    match spec.sample_format {
        SampleFormat::Float => {
            let data: Vec<f32> = reader
                .into_samples::<f32>()
                .collect::<std::result::Result<_, _>>()?;
            append_downmixed_samples(&mut samples, &data, channels, |s| s);
        }
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            let data: Vec<i32> = reader
                .into_samples::<i32>()
                .collect::<std::result::Result<_, _>>()?;
            append_downmixed_samples(&mut samples, &data, channels, |s| s as f32 / scale);
        }
    }
    Ok((samples, spec.sample_rate))
}

/// Plays in-memory samples (usually decoded from a WAV file) as a live
/// source, one block at a time on a playback thread.
pub struct WavSource {
    label: String,
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    block_samples: usize,
    realtime: bool,
    sink: Option<BlockSink>,
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    playback: Option<JoinHandle<()>>,
}

impl WavSource {
    pub fn open(path: &Path, block_ms: u64, realtime: bool) -> Result<Self> {
        let (samples, sample_rate) = read_wav_mono(path)?;
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "wav".to_string());
        tracing::debug!(
            "Loaded {}: {} samples at {} Hz",
            label,
            samples.len(),
            sample_rate
        );
        Ok(Self::from_samples(label, samples, sample_rate, block_ms, realtime))
    }

    pub fn from_samples(
        label: impl Into<String>,
        samples: Vec<f32>,
        sample_rate: u32,
        block_ms: u64,
        realtime: bool,
    ) -> Self {
        let block_samples = ((u64::from(sample_rate) * block_ms) / 1000).max(1) as usize;
        Self {
            label: label.into(),
            samples: Arc::new(samples),
            sample_rate,
            block_samples,
            realtime,
            sink: None,
            stop: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
            playback: None,
        }
    }

    /// Set once every sample has been delivered. Lets callers stop detection
    /// at the end of a file.
    pub fn finished_flag(&self) -> Arc<AtomicBool> {
        self.finished.clone()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate.max(1)))
    }
}

impl AudioSource for WavSource {
    fn audio_track(&self) -> Option<AudioTrack> {
        Some(AudioTrack {
            label: self.label.clone(),
            enabled: true,
            live: !self.samples.is_empty(),
        })
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn connect(&mut self, sink: BlockSink) -> Result<(), EngineError> {
        if self.sink.is_some() || self.playback.is_some() {
            return Err(EngineError::AudioContext(format!(
                "{} is already connected",
                self.label
            )));
        }
        self.sink = Some(sink);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        if self.playback.is_some() {
            return Ok(());
        }
        let mut sink = self.sink.take().ok_or_else(|| {
            EngineError::AudioContext(format!("{} has no connected sink", self.label))
        })?;

        let samples = self.samples.clone();
        let block_samples = self.block_samples;
        let block_duration =
            Duration::from_secs_f64(block_samples as f64 / f64::from(self.sample_rate.max(1)));
        let realtime = self.realtime;
        let stop = self.stop.clone();
        let finished = self.finished.clone();

        let handle = std::thread::Builder::new()
            .name("wav-playback".into())
            .spawn(move || {
                let started = Instant::now();
                for (index, block) in samples.chunks(block_samples).enumerate() {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    if realtime {
                        let due = started + block_duration * index as u32;
                        let now = Instant::now();
                        if due > now {
                            std::thread::sleep(due - now);
                        }
                    }
                    sink(block);
                }
                finished.store(true, Ordering::Release);
            })
            .map_err(|e| EngineError::AudioContext(format!("failed to spawn playback: {e}")))?;

        self.playback = Some(handle);
        Ok(())
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.sink = None;
        if let Some(handle) = self.playback.take() {
            if handle.join().is_err() {
                tracing::warn!("{}: playback thread panicked", self.label);
            }
        }
    }
}

impl Drop for WavSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_downmix_stereo() {
        let mut buf = Vec::new();
        append_downmixed_samples(&mut buf, &[1.0f32, 0.0, 0.5, 0.5], 2, |s| s);
        assert_eq!(buf, vec![0.5, 0.5]);
    }

    #[test]
    fn test_downmix_mono_passthrough() {
        let mut buf = Vec::new();
        append_downmixed_samples(&mut buf, &[16_384i16, -16_384], 1, |s| s as f32 / 32_768.0);
        assert_eq!(buf, vec![0.5, -0.5]);
    }

    #[test]
    fn test_empty_source_is_not_live() {
        let source = WavSource::from_samples("empty", Vec::new(), 16_000, 20, false);
        let track = source.audio_track().unwrap();
        assert!(!track.is_active());
    }

    #[test]
    fn test_resume_without_sink_fails() {
        let mut source = WavSource::from_samples("x", vec![0.0; 100], 16_000, 20, false);
        assert!(matches!(
            source.resume(),
            Err(EngineError::AudioContext(_))
        ));
    }

    #[test]
    fn test_delivers_all_samples_in_blocks() {
        let mut source = WavSource::from_samples("x", vec![0.25; 1000], 16_000, 20, false);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink_received = received.clone();
        source
            .connect(Box::new(move |block| {
                sink_received.lock().unwrap().push(block.len());
            }))
            .unwrap();
        source.resume().unwrap();

        let finished = source.finished_flag();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !finished.load(Ordering::Acquire) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        source.close();

        let blocks = received.lock().unwrap();
        // 20 ms at 16 kHz = 320 samples per block.
        assert_eq!(*blocks, vec![320, 320, 320, 40]);
    }

    #[test]
    fn test_open_wav_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tone.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..400 {
            writer.write_sample(16_384i16).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let source = WavSource::open(&path, 20, false).unwrap();
        assert_eq!(source.sample_rate(), 8_000);
        assert_eq!(source.samples.len(), 400);
        assert!((source.samples[0] - 0.25).abs() < 1e-6);
        assert!((source.duration().as_secs_f64() - 0.05).abs() < 1e-9);
    }
}
