// Processing graph: source -> denoise -> gate -> analyser tap.
//
// The source's real-time thread runs the suppressor on every block and writes
// the result into the analyser tap, which keeps only the latest window. The
// analysis loop copies that window once per tick; blocks it never looked at
// are simply overwritten. While a chunk recorder is attached, each block is
// also forwarded to it.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::info;

use crate::audio::frame::validate_fft_size;
use crate::audio::ring_buffer::RingBuffer;
use crate::audio::source::AudioSource;
use crate::audio::suppression::SuppressorLoader;
use crate::config::{ChunkSource, Config};
use crate::error::EngineError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Latest-window view of the processed stream.
#[derive(Clone)]
pub struct AnalyserTap {
    buffer: Arc<Mutex<RingBuffer>>,
}

impl AnalyserTap {
    pub fn new(window: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(RingBuffer::new(window))),
        }
    }

    pub fn write(&self, block: &[f32]) {
        lock(&self.buffer).push(block);
    }

    pub fn copy_latest(&self, out: &mut [f32]) {
        lock(&self.buffer).copy_latest(out);
    }

    pub fn total_written(&self) -> u64 {
        lock(&self.buffer).total_written()
    }
}

/// Slot through which the graph hands blocks to an attached recorder.
#[derive(Clone, Default)]
pub struct RecorderFeed {
    slot: Arc<Mutex<Option<Sender<Vec<f32>>>>>,
}

impl RecorderFeed {
    /// Returns false if a recorder is already attached.
    pub fn attach(&self, sender: Sender<Vec<f32>>) -> bool {
        let mut slot = lock(&self.slot);
        if slot.is_some() {
            return false;
        }
        *slot = Some(sender);
        true
    }

    /// Detach the recorder. Dropping the returned sender closes its channel.
    pub fn detach(&self) -> Option<Sender<Vec<f32>>> {
        lock(&self.slot).take()
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.slot).is_some()
    }

    pub fn forward(&self, block: &[f32]) {
        let mut slot = lock(&self.slot);
        if let Some(sender) = slot.as_ref() {
            if sender.send(block.to_vec()).is_err() {
                *slot = None;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GraphSettings {
    pub fft_size: usize,
    pub chunk_source: ChunkSource,
}

impl From<&Config> for GraphSettings {
    fn from(config: &Config) -> Self {
        Self {
            fft_size: config.capture.fft_size,
            chunk_source: config.streaming.source,
        }
    }
}

pub struct ProcessingGraph {
    source: Box<dyn AudioSource>,
    tap: AnalyserTap,
    feed: RecorderFeed,
    sample_rate: u32,
    suppressor: &'static str,
    torn_down: bool,
}

impl ProcessingGraph {
    /// Validate the source, load the suppressor, wire the graph and start the
    /// source.
    ///
    /// Every failure after the source is taken tears the partial graph down
    /// before returning. Dropping the returned future mid-load does the same,
    /// since the partial graph is owned by the future.
    pub async fn build(
        source: Box<dyn AudioSource>,
        loader: &dyn SuppressorLoader,
        settings: GraphSettings,
    ) -> Result<Self, EngineError> {
        validate_fft_size(settings.fft_size)?;

        let track = source.audio_track().ok_or(EngineError::NoAudioTrack)?;
        if !track.is_active() {
            return Err(EngineError::InactiveTrack);
        }
        let sample_rate = source.sample_rate();
        if sample_rate == 0 {
            return Err(EngineError::AudioContext(format!(
                "{} reports a zero sample rate",
                track.label
            )));
        }

        let mut graph = Self {
            source,
            tap: AnalyserTap::new(settings.fft_size),
            feed: RecorderFeed::default(),
            sample_rate,
            suppressor: "none",
            torn_down: false,
        };

        let mut suppressor = loader.load(sample_rate).await?;
        graph.suppressor = suppressor.name();

        let tap = graph.tap.clone();
        let feed = graph.feed.clone();
        let chunk_source = settings.chunk_source;
        let mut processed: Vec<f32> = Vec::new();
        graph.source.connect(Box::new(move |block: &[f32]| {
            if chunk_source == ChunkSource::Raw {
                feed.forward(block);
            }
            processed.clear();
            processed.extend_from_slice(block);
            suppressor.process(&mut processed);
            tap.write(&processed);
            if chunk_source == ChunkSource::Suppressed {
                feed.forward(&processed);
            }
        }))?;
        graph.source.resume()?;

        info!(
            "Processing graph running: track '{}', {} Hz, suppressor {}",
            track.label, sample_rate, graph.suppressor
        );
        Ok(graph)
    }

    pub fn tap(&self) -> &AnalyserTap {
        &self.tap
    }

    pub fn feed(&self) -> &RecorderFeed {
        &self.feed
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn suppressor_name(&self) -> &'static str {
        self.suppressor
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Disconnect every node and release the source. Idempotent.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        drop(self.feed.detach());
        self.source.close();
        info!("Processing graph torn down");
    }
}

impl Drop for ProcessingGraph {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::audio::source::{AudioTrack, BlockSink};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts lifecycle calls so tests can assert on teardown.
    #[derive(Default)]
    pub struct SourceProbe {
        pub connects: AtomicUsize,
        pub resumes: AtomicUsize,
        pub closes: AtomicUsize,
    }

    /// Source whose blocks are pushed by the test through `push`.
    pub struct ManualSource {
        pub track: Option<AudioTrack>,
        pub sample_rate: u32,
        pub fail_resume: bool,
        pub probe: Arc<SourceProbe>,
        pub sink: Arc<Mutex<Option<BlockSink>>>,
    }

    impl ManualSource {
        pub fn new(sample_rate: u32) -> Self {
            Self {
                track: Some(AudioTrack {
                    label: "manual".to_string(),
                    enabled: true,
                    live: true,
                }),
                sample_rate,
                fail_resume: false,
                probe: Arc::new(SourceProbe::default()),
                sink: Arc::new(Mutex::new(None)),
            }
        }
    }

    /// Push a block into a connected [`ManualSource`].
    pub fn push(sink: &Arc<Mutex<Option<BlockSink>>>, block: &[f32]) {
        if let Some(sink) = lock(sink).as_mut() {
            sink(block);
        }
    }

    impl AudioSource for ManualSource {
        fn audio_track(&self) -> Option<AudioTrack> {
            self.track.clone()
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn connect(&mut self, sink: BlockSink) -> Result<(), EngineError> {
            self.probe.connects.fetch_add(1, Ordering::SeqCst);
            *lock(&self.sink) = Some(sink);
            Ok(())
        }

        fn resume(&mut self) -> Result<(), EngineError> {
            self.probe.resumes.fetch_add(1, Ordering::SeqCst);
            if self.fail_resume {
                return Err(EngineError::AudioContext("device busy".to_string()));
            }
            Ok(())
        }

        fn close(&mut self) {
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
            *lock(&self.sink) = None;
        }
    }
}
