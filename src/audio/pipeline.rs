// Analysis pipeline: analyser tap -> features -> VAD -> detection events.
//
// The loop runs on its own thread and is driven by a fixed-interval ticker
// rather than by incoming audio. Each tick copies whatever window the tap
// holds, so a slow tick never builds a backlog: missed ticks are skipped.
// `DetectionEvent`s go over a channel to whoever dispatches the callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::audio::features::FeatureSet;
use crate::audio::frame::FrameAnalyzer;
use crate::audio::graph::AnalyserTap;
use crate::audio::vad::{Transition, VoiceActivityDetector};
use crate::calibration::ThresholdHandle;
use crate::error::EngineError;
use crate::streaming::{AudioChunk, StreamingSession};

/// Upper bound on a single sleep, so shutdown is noticed promptly even with
/// long tick intervals.
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Messages sent from the analysis side to the callback dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionEvent {
    SpeakingStarted,
    SpeakingEnded,
    ChunkReady(AudioChunk),
}

impl From<AudioChunk> for DetectionEvent {
    fn from(chunk: AudioChunk) -> Self {
        DetectionEvent::ChunkReady(chunk)
    }
}

/// Couples the VAD to the streaming controls and the event channel.
pub struct SpeechTracker {
    vad: VoiceActivityDetector,
    streaming: StreamingSession,
    thresholds: ThresholdHandle,
    events: Sender<DetectionEvent>,
}

impl SpeechTracker {
    pub fn new(
        vad: VoiceActivityDetector,
        streaming: StreamingSession,
        thresholds: ThresholdHandle,
        events: Sender<DetectionEvent>,
    ) -> Self {
        Self {
            vad,
            streaming,
            thresholds,
            events,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.vad.is_speaking()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_streaming()
    }

    /// Feed one tick's features. Thresholds are read fresh every tick, so a
    /// recalibration takes effect on the next tick.
    pub fn on_features(&mut self, features: &FeatureSet, now: Duration) -> Option<Transition> {
        let thresholds = self.thresholds.current();
        let transition = self.vad.update(features, &thresholds, now);
        match transition {
            Some(Transition::Started) => {
                self.send(DetectionEvent::SpeakingStarted);
                self.streaming.start_streaming();
            }
            Some(Transition::Ended) => {
                self.send(DetectionEvent::SpeakingEnded);
                self.streaming.stop_streaming();
            }
            None => {}
        }
        transition
    }

    /// Close out the session: an open speech segment is ended and the
    /// recorder is stopped.
    pub fn finish(&mut self) {
        if self.vad.is_speaking() {
            self.send(DetectionEvent::SpeakingEnded);
        }
        self.vad.reset();
        self.streaming.stop_streaming();
    }

    fn send(&self, event: DetectionEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver gone; dropping detection event");
        }
    }
}

/// Everything one tick needs.
pub struct AnalysisLoop {
    analyzer: FrameAnalyzer,
    tap: AnalyserTap,
    tracker: SpeechTracker,
}

impl AnalysisLoop {
    pub fn new(analyzer: FrameAnalyzer, tap: AnalyserTap, tracker: SpeechTracker) -> Self {
        Self {
            analyzer,
            tap,
            tracker,
        }
    }

    pub fn tick(&mut self, now: Duration) -> Option<Transition> {
        let tap = &self.tap;
        let features = self.analyzer.features_with(|buf| tap.copy_latest(buf));
        self.tracker.on_features(&features, now)
    }

    pub fn tracker(&self) -> &SpeechTracker {
        &self.tracker
    }

    pub fn into_tracker(self) -> SpeechTracker {
        self.tracker
    }
}

/// The analysis loop running on its own thread.
pub struct AnalysisWorker {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<AnalysisLoop>>,
}

impl AnalysisWorker {
    pub fn spawn(analysis: AnalysisLoop, interval: Duration) -> Result<Self, EngineError> {
        if interval.is_zero() {
            return Err(EngineError::InvalidConfig(
                "tick interval must be greater than zero".to_string(),
            ));
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("analysis".into())
            .spawn(move || {
                let mut analysis = analysis;
                run_ticker(&mut analysis, interval, &flag);
                analysis
            })
            .map_err(|e| EngineError::AudioContext(format!("failed to spawn analysis thread: {e}")))?;
        info!("Analysis loop started: tick every {} ms", interval.as_millis());
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Signal the loop and wait for the tick in progress to finish. Returns
    /// the loop so the caller can close out its state.
    pub fn stop(mut self) -> Option<AnalysisLoop> {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> Option<AnalysisLoop> {
        let handle = self.handle.take()?;
        self.shutdown.store(true, Ordering::Relaxed);
        match handle.join() {
            Ok(analysis) => {
                info!("Analysis loop stopped");
                Some(analysis)
            }
            Err(_) => {
                warn!("Analysis thread panicked");
                None
            }
        }
    }
}

impl Drop for AnalysisWorker {
    fn drop(&mut self) {
        if let Some(mut analysis) = self.shutdown_and_join() {
            analysis.tracker.finish();
        }
    }
}

fn run_ticker(analysis: &mut AnalysisLoop, interval: Duration, shutdown: &AtomicBool) {
    let start = Instant::now();
    let mut next = start;

    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now < next {
            std::thread::sleep((next - now).min(SHUTDOWN_POLL));
            continue;
        }

        analysis.tick(now - start);

        next += interval;
        let now = Instant::now();
        if next <= now {
            let behind = (now - next).as_nanos() / interval.as_nanos();
            let skipped = u32::try_from(behind).unwrap_or(u32::MAX).saturating_add(1);
            debug!(skipped, "Analysis tick overran; skipping missed ticks");
            next += interval * skipped;
        }
    }
}
