// Audio chunk streaming keyed to speaking state.
//
// A `StreamingSession` owns at most one `ChunkRecorder` and makes its
// start/stop controls idempotent, so the detector can call them on every
// transition without tracking recorder state itself.

use std::io::Cursor;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{debug, info, warn};

use crate::audio::graph::RecorderFeed;

pub trait ChunkRecorder: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}

/// One encoded chunk as handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Base64 of a 16-bit mono WAV file.
    pub data: String,
    /// False only for the trailing chunk flushed when recording stops.
    pub is_speaking: bool,
}

pub struct StreamingSession {
    recorder: Option<Box<dyn ChunkRecorder>>,
    streaming: bool,
}

impl StreamingSession {
    pub fn new(recorder: Option<Box<dyn ChunkRecorder>>) -> Self {
        Self {
            recorder,
            streaming: false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Start the recorder unless it is already running. A missing recorder
    /// is a no-op.
    pub fn start_streaming(&mut self) {
        if self.streaming {
            return;
        }
        let Some(recorder) = self.recorder.as_mut() else {
            return;
        };
        match recorder.start() {
            Ok(()) => self.streaming = true,
            Err(e) => warn!("Failed to start chunk recorder: {:#}", e),
        }
    }

    pub fn stop_streaming(&mut self) {
        if !self.streaming {
            return;
        }
        self.streaming = false;
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.stop() {
                warn!("Failed to stop chunk recorder: {:#}", e);
            }
        }
    }
}

/// Encode mono samples as a 16-bit WAV file and return it as base64.
pub fn encode_chunk(samples: &[f32], sample_rate: u32) -> Result<String> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec).context("Failed to start WAV chunk")?;
        for &sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            writer.write_sample(value)?;
        }
        writer.finalize().context("Failed to finalize WAV chunk")?;
    }
    Ok(STANDARD.encode(cursor.into_inner()))
}

/// Records blocks from the graph's recorder feed and emits a WAV chunk every
/// `chunk_duration` while started. Chunks are sent on `output` converted into
/// whatever message type the receiver expects.
///
/// `stop` only detaches the feed. The encoder encodes its tail chunk on its
/// own thread and is joined on drop or by [`PcmChunkRecorder::flush`].
pub struct PcmChunkRecorder<T = AudioChunk> {
    feed: RecorderFeed,
    sample_rate: u32,
    chunk_duration: Duration,
    output: Sender<T>,
    encoder: Option<JoinHandle<()>>,
    draining: Vec<JoinHandle<()>>,
}

impl<T: From<AudioChunk> + Send + 'static> PcmChunkRecorder<T> {
    pub fn new(
        feed: RecorderFeed,
        sample_rate: u32,
        chunk_duration: Duration,
        output: Sender<T>,
    ) -> Self {
        Self {
            feed,
            sample_rate,
            chunk_duration,
            output,
            encoder: None,
            draining: Vec::new(),
        }
    }
}

impl<T> PcmChunkRecorder<T> {
    /// Wait for every stopped encoder to send its last chunk.
    pub fn flush(&mut self) {
        for handle in self.draining.drain(..) {
            if handle.join().is_err() {
                warn!("chunk encoder thread panicked");
            }
        }
    }

    fn reap_finished(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) = self
            .draining
            .drain(..)
            .partition(|handle| handle.is_finished());
        self.draining = running;
        for handle in done {
            if handle.join().is_err() {
                warn!("chunk encoder thread panicked");
            }
        }
    }
}

impl<T: From<AudioChunk> + Send + 'static> ChunkRecorder for PcmChunkRecorder<T> {
    fn start(&mut self) -> Result<()> {
        if self.encoder.is_some() {
            return Ok(());
        }
        self.reap_finished();
        let (tx, rx) = mpsc::channel();
        if !self.feed.attach(tx) {
            anyhow::bail!("another recorder is attached to the feed");
        }
        let sample_rate = self.sample_rate;
        let chunk_duration = self.chunk_duration;
        let output = self.output.clone();
        let handle = std::thread::Builder::new()
            .name("chunk-encoder".into())
            .spawn(move || run_encoder(rx, sample_rate, chunk_duration, output));
        match handle {
            Ok(handle) => {
                self.encoder = Some(handle);
                debug!("Chunk recorder started");
                Ok(())
            }
            Err(e) => {
                drop(self.feed.detach());
                Err(e).context("Failed to spawn chunk encoder thread")
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.encoder.take() else {
            return Ok(());
        };
        // Dropping the sender ends the encoder's receive loop.
        drop(self.feed.detach());
        self.draining.push(handle);
        self.reap_finished();
        debug!("Chunk recorder stopped");
        Ok(())
    }
}

impl<T> Drop for PcmChunkRecorder<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.encoder.take() {
            drop(self.feed.detach());
            self.draining.push(handle);
        }
        self.flush();
    }
}

fn emit<T: From<AudioChunk>>(
    output: &Sender<T>,
    samples: &[f32],
    sample_rate: u32,
    is_speaking: bool,
) {
    match encode_chunk(samples, sample_rate) {
        Ok(data) => {
            debug!(samples = samples.len(), is_speaking, "Chunk encoded");
            let _ = output.send(AudioChunk { data, is_speaking }.into());
        }
        Err(e) => warn!("Dropping chunk of {} samples: {:#}", samples.len(), e),
    }
}

fn run_encoder<T: From<AudioChunk>>(
    rx: Receiver<Vec<f32>>,
    sample_rate: u32,
    chunk_duration: Duration,
    output: Sender<T>,
) {
    let mut pending: Vec<f32> = Vec::new();
    let mut deadline = Instant::now() + chunk_duration;

    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(block) => pending.extend_from_slice(&block),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if Instant::now() >= deadline {
            if !pending.is_empty() {
                emit(&output, &pending, sample_rate, true);
                pending.clear();
            }
            deadline += chunk_duration;
        }
    }

    if !pending.is_empty() {
        emit(&output, &pending, sample_rate, false);
    }
    info!("Chunk encoder exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counts {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    struct CountingRecorder(Arc<Counts>);

    impl ChunkRecorder for CountingRecorder {
        fn start(&mut self) -> Result<()> {
            self.0.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.0.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn decode(chunk: &AudioChunk) -> (hound::WavSpec, Vec<i16>) {
        let bytes = STANDARD.decode(&chunk.data).unwrap();
        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        let spec = reader.spec();
        let samples = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        (spec, samples)
    }

    #[test]
    fn test_start_stop_are_idempotent() {
        let counts = Arc::new(Counts::default());
        let mut session = StreamingSession::new(Some(Box::new(CountingRecorder(counts.clone()))));

        session.start_streaming();
        session.start_streaming();
        assert!(session.is_streaming());
        assert_eq!(counts.starts.load(Ordering::SeqCst), 1);

        session.stop_streaming();
        session.stop_streaming();
        assert!(!session.is_streaming());
        assert_eq!(counts.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let counts = Arc::new(Counts::default());
        let mut session = StreamingSession::new(Some(Box::new(CountingRecorder(counts.clone()))));
        session.stop_streaming();
        assert_eq!(counts.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_recorder_is_noop() {
        let mut session = StreamingSession::new(None);
        session.start_streaming();
        assert!(!session.is_streaming());
        session.stop_streaming();
    }

    #[test]
    fn test_encode_chunk_is_16bit_mono_wav() {
        let chunk = AudioChunk {
            data: encode_chunk(&[0.0, 0.5, -0.5, 2.0], 16_000).unwrap(),
            is_speaking: true,
        };
        let (spec, samples) = decode(&chunk);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16_000);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(samples, vec![0, 16_383, -16_383, i16::MAX]);
    }

    #[test]
    fn test_recorder_flushes_partial_chunk_on_stop() {
        let feed = RecorderFeed::default();
        let (tx, rx) = mpsc::channel();
        let mut recorder: PcmChunkRecorder =
            PcmChunkRecorder::new(feed.clone(), 8_000, Duration::from_secs(60), tx);

        recorder.start().unwrap();
        assert!(feed.is_attached());
        feed.forward(&[0.25; 100]);
        feed.forward(&[0.25; 60]);
        recorder.stop().unwrap();
        assert!(!feed.is_attached());
        recorder.flush();

        let chunks: Vec<AudioChunk> = rx.try_iter().collect();
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].is_speaking);
        let (_, samples) = decode(&chunks[0]);
        assert_eq!(samples.len(), 160);
    }

    #[test]
    fn test_recorder_emits_speaking_chunks_on_interval() {
        let feed = RecorderFeed::default();
        let (tx, rx) = mpsc::channel();
        let mut recorder: PcmChunkRecorder =
            PcmChunkRecorder::new(feed.clone(), 8_000, Duration::from_millis(20), tx);

        recorder.start().unwrap();
        feed.forward(&[0.1; 80]);
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(first.is_speaking);
        recorder.stop().unwrap();
    }

    #[test]
    fn test_stop_with_no_audio_emits_nothing() {
        let feed = RecorderFeed::default();
        let (tx, rx) = mpsc::channel();
        let mut recorder: PcmChunkRecorder =
            PcmChunkRecorder::new(feed, 8_000, Duration::from_secs(1), tx);
        recorder.start().unwrap();
        recorder.stop().unwrap();
        recorder.stop().unwrap();
        drop(recorder);
        assert!(rx.try_iter().next().is_none());
    }

    /// Converting into this type stalls the encoder thread.
    struct SlowChunk(AudioChunk);

    impl From<AudioChunk> for SlowChunk {
        fn from(chunk: AudioChunk) -> Self {
            std::thread::sleep(Duration::from_millis(300));
            SlowChunk(chunk)
        }
    }

    #[test]
    fn test_stop_does_not_wait_for_tail_encoding() {
        let feed = RecorderFeed::default();
        let (tx, rx) = mpsc::channel::<SlowChunk>();
        let mut recorder = PcmChunkRecorder::new(feed.clone(), 8_000, Duration::from_secs(60), tx);

        recorder.start().unwrap();
        feed.forward(&[0.25; 80]);

        let stopping = Instant::now();
        recorder.stop().unwrap();
        assert!(stopping.elapsed() < Duration::from_millis(150));
        assert!(!feed.is_attached());

        // A new segment can start while the previous tail is still encoding.
        recorder.start().unwrap();
        assert!(feed.is_attached());
        recorder.stop().unwrap();

        let tail = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!tail.0.is_speaking);
        drop(recorder);
        assert!(rx.try_iter().all(|chunk| !chunk.0.is_speaking));
    }
}
