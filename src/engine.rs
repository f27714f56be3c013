// Session orchestration: the public calibrate / detect API.
//
// A `VoiceEngine` owns at most one detection session. A session is the
// processing graph, the analysis worker ticking over its tap, and the
// dispatcher thread that turns `DetectionEvent`s into caller callbacks.

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::audio::frame::FrameAnalyzer;
use crate::audio::graph::{GraphSettings, ProcessingGraph};
use crate::audio::pipeline::{AnalysisLoop, AnalysisWorker, DetectionEvent, SpeechTracker};
use crate::audio::source::AudioSource;
use crate::audio::suppression::SuppressorLoader;
use crate::audio::vad::VoiceActivityDetector;
use crate::calibration::{run_calibration, CalibrationSettings, CalibrationThresholds, ThresholdHandle};
use crate::config::Config;
use crate::error::EngineError;
use crate::streaming::{PcmChunkRecorder, StreamingSession};

struct DetectionSession {
    graph: ProcessingGraph,
    worker: AnalysisWorker,
    dispatcher: JoinHandle<()>,
}

pub struct VoiceEngine {
    config: Config,
    loader: Arc<dyn SuppressorLoader>,
    thresholds: ThresholdHandle,
    session: Option<DetectionSession>,
}

impl VoiceEngine {
    pub fn new(
        config: Config,
        loader: Arc<dyn SuppressorLoader>,
        thresholds: CalibrationThresholds,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            loader,
            thresholds: ThresholdHandle::new(thresholds),
            session: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn thresholds(&self) -> CalibrationThresholds {
        self.thresholds.current()
    }

    /// Shared handle to the active thresholds, as read by the analysis loop.
    pub fn thresholds_handle(&self) -> ThresholdHandle {
        self.thresholds.clone()
    }

    pub fn is_detecting(&self) -> bool {
        self.session.is_some()
    }

    /// Sample the environment and replace the active thresholds.
    ///
    /// While a detection session is running its graph is sampled and
    /// `source` is released unused. Otherwise a temporary graph is built
    /// over `source` and torn down when sampling ends.
    pub async fn calibrate(
        &mut self,
        source: Box<dyn AudioSource>,
    ) -> Result<CalibrationThresholds, EngineError> {
        let settings = CalibrationSettings {
            sample_count: self.config.calibration.sample_count,
            sample_interval: self.config.sample_interval(),
        };

        let mut temporary = None;
        let (tap, sample_rate) = match &self.session {
            Some(session) => {
                debug!("Calibrating against the running detection graph");
                drop(source);
                (session.graph.tap().clone(), session.graph.sample_rate())
            }
            None => {
                let graph = ProcessingGraph::build(
                    source,
                    self.loader.as_ref(),
                    GraphSettings::from(&self.config),
                )
                .await?;
                let view = (graph.tap().clone(), graph.sample_rate());
                temporary = Some(graph);
                view
            }
        };

        let mut analyzer = FrameAnalyzer::new(self.config.capture.fft_size, sample_rate)?;
        let thresholds = run_calibration(&tap, &mut analyzer, settings).await;

        if let Some(mut graph) = temporary {
            graph.teardown();
        }
        self.thresholds.replace(thresholds);
        Ok(thresholds)
    }

    /// Build the graph over `source` and start ticking.
    ///
    /// `on_speaking_change` receives every speaking transition and
    /// `on_audio_chunk` every encoded chunk with its speaking flag. Both run
    /// on a dispatcher thread, in event order.
    pub async fn start_detecting<S, C>(
        &mut self,
        source: Box<dyn AudioSource>,
        on_speaking_change: S,
        on_audio_chunk: C,
    ) -> Result<(), EngineError>
    where
        S: FnMut(bool) + Send + 'static,
        C: FnMut(String, bool) + Send + 'static,
    {
        if self.session.is_some() {
            return Err(EngineError::SessionActive);
        }

        let graph = ProcessingGraph::build(
            source,
            self.loader.as_ref(),
            GraphSettings::from(&self.config),
        )
        .await?;
        let sample_rate = graph.sample_rate();
        let analyzer = FrameAnalyzer::new(self.config.capture.fft_size, sample_rate)?;

        let (events_tx, events_rx) = mpsc::channel();
        let recorder = PcmChunkRecorder::new(
            graph.feed().clone(),
            sample_rate,
            self.config.chunk_duration(),
            events_tx.clone(),
        );
        let tracker = SpeechTracker::new(
            VoiceActivityDetector::new(self.config.hysteresis()),
            StreamingSession::new(Some(Box::new(recorder))),
            self.thresholds.clone(),
            events_tx,
        );

        let dispatcher = spawn_dispatcher(events_rx, on_speaking_change, on_audio_chunk)?;
        let worker = match AnalysisWorker::spawn(
            AnalysisLoop::new(analyzer, graph.tap().clone(), tracker),
            self.config.tick_interval(),
        ) {
            Ok(worker) => worker,
            Err(e) => {
                // The loop and every event sender died with the failed spawn.
                let _ = dispatcher.join();
                return Err(e);
            }
        };

        info!("Detection started");
        self.session = Some(DetectionSession {
            graph,
            worker,
            dispatcher,
        });
        Ok(())
    }

    /// Stop the running session, if any. Returns once every callback for the
    /// session has run. An open speech segment is reported as ended.
    pub fn stop_detecting(&mut self) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };

        if let Some(analysis) = session.worker.stop() {
            let mut tracker = analysis.into_tracker();
            tracker.finish();
        }
        session.graph.teardown();
        if session.dispatcher.join().is_err() {
            warn!("Event dispatcher panicked");
        }
        info!("Detection stopped");
        true
    }
}

impl Drop for VoiceEngine {
    fn drop(&mut self) {
        self.stop_detecting();
    }
}

fn spawn_dispatcher<S, C>(
    events: Receiver<DetectionEvent>,
    mut on_speaking_change: S,
    mut on_audio_chunk: C,
) -> Result<JoinHandle<()>, EngineError>
where
    S: FnMut(bool) + Send + 'static,
    C: FnMut(String, bool) + Send + 'static,
{
    std::thread::Builder::new()
        .name("event-dispatch".into())
        .spawn(move || {
            for event in events {
                match event {
                    DetectionEvent::SpeakingStarted => on_speaking_change(true),
                    DetectionEvent::SpeakingEnded => on_speaking_change(false),
                    DetectionEvent::ChunkReady(chunk) => {
                        on_audio_chunk(chunk.data, chunk.is_speaking)
                    }
                }
            }
        })
        .map_err(|e| EngineError::AudioContext(format!("failed to spawn dispatcher: {e}")))
}
