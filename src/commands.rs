use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::Result;
use tokio::runtime::Runtime;

use voxgate::audio::chunk_writer::run_chunk_writer;
use voxgate::audio::source::{AudioSource, WavSource};
use voxgate::audio::suppression::ProfileLoader;
use voxgate::calibration::ThresholdStore;
use voxgate::offline;
use voxgate::streaming::AudioChunk;
use voxgate::{Config, EngineError, VoiceEngine};

/// Attach the user-facing sentence to an engine error.
fn explain(err: EngineError) -> anyhow::Error {
    let message = err.user_message();
    anyhow::Error::new(err).context(message)
}

/// The input for a live command: a WAV file replayed in real time, or the
/// configured microphone. The flag is set once a file has been played out.
fn open_source(
    config: &Config,
    input: Option<&Path>,
) -> Result<(Box<dyn AudioSource>, Option<Arc<AtomicBool>>)> {
    if let Some(path) = input {
        let source = WavSource::open(path, config.capture.block_ms, true)?;
        tracing::info!(
            "Replaying {} ({:.1} s)",
            path.display(),
            source.duration().as_secs_f64()
        );
        let finished = source.finished_flag();
        return Ok((Box::new(source), Some(finished)));
    }
    open_microphone(config).map(|source| (source, None))
}

#[cfg(feature = "mic")]
fn open_microphone(config: &Config) -> Result<Box<dyn AudioSource>> {
    let source = voxgate::audio::capture::MicSource::new(config.capture.device.as_deref());
    tracing::info!("Capturing from {}", source.device_name());
    Ok(Box::new(source))
}

#[cfg(not(feature = "mic"))]
fn open_microphone(_config: &Config) -> Result<Box<dyn AudioSource>> {
    anyhow::bail!("Live capture needs the `mic` feature; pass --input <WAV> instead")
}

fn build_engine(config: &Config) -> Result<(VoiceEngine, ThresholdStore)> {
    let store = ThresholdStore::new(&config.output.thresholds_path);
    let thresholds = store.load()?;
    let loader = Arc::new(ProfileLoader::from_config(&config.suppression));
    let engine = VoiceEngine::new(config.clone(), loader, thresholds).map_err(explain)?;
    Ok((engine, store))
}

/// Sample the environment and persist the derived thresholds.
pub fn calibrate(config: &Config, input: Option<&Path>, runtime: &Runtime) -> Result<()> {
    let (mut engine, store) = build_engine(config)?;
    let (source, _) = open_source(config, input)?;

    let budget = config.sample_interval() * config.calibration.sample_count as u32;
    println!(
        "Calibrating for {:.1} s. Stay quiet, or speak normally if calibrating for speech.",
        budget.as_secs_f64()
    );
    let thresholds = runtime
        .block_on(engine.calibrate(source))
        .map_err(explain)?;
    store.save(&thresholds)?;

    println!("Saved thresholds to {}", store.path().display());
    print_thresholds(&thresholds);
    Ok(())
}

/// Run detection until Ctrl+C or the end of the input file.
pub fn detect(
    config: &Config,
    input: Option<&Path>,
    save_chunks: Option<PathBuf>,
    runtime: &Runtime,
) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_ctrlc = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received");
        shutdown_ctrlc.store(true, Ordering::Relaxed);
    })?;

    let (mut engine, _) = build_engine(config)?;
    let (source, finished) = open_source(config, input)?;

    // --- Optional chunk writer thread ---
    let chunks_dir = save_chunks.or_else(|| config.output.chunks_directory.clone());
    let (chunk_tx, writer_handle) = match chunks_dir {
        Some(dir) => {
            let (tx, rx) = mpsc::channel::<AudioChunk>();
            let handle = std::thread::Builder::new()
                .name("chunk-writer".into())
                .spawn(move || {
                    if let Err(e) = run_chunk_writer(rx, &dir) {
                        tracing::error!("Chunk writer error: {:#}", e);
                    }
                })?;
            (Some(tx), Some(handle))
        }
        None => (None, None),
    };

    let started = std::time::Instant::now();
    runtime
        .block_on(engine.start_detecting(
            source,
            move |speaking| {
                let at = started.elapsed().as_secs_f64();
                if speaking {
                    tracing::info!("[{:>7.2}s] speaking", at);
                } else {
                    tracing::info!("[{:>7.2}s] silent", at);
                }
            },
            move |data, is_speaking| {
                tracing::debug!(bytes = data.len(), is_speaking, "Chunk ready");
                if let Some(tx) = &chunk_tx {
                    let _ = tx.send(AudioChunk { data, is_speaking });
                }
            },
        ))
        .map_err(explain)?;

    // Wait for shutdown signal or the end of the file.
    while !shutdown.load(Ordering::Relaxed) {
        if finished
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
        {
            // Let the last window drain through the tick loop.
            std::thread::sleep(config.hysteresis() + config.tick_interval());
            tracing::info!("End of input");
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    tracing::info!("Shutting down...");
    // Joins the dispatcher, which drops the chunk sender with its callback.
    engine.stop_detecting();
    if let Some(handle) = writer_handle {
        let _ = handle.join();
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Offline detection report for a WAV file.
pub fn analyze(config: &Config, wav: &Path, json: bool, runtime: &Runtime) -> Result<()> {
    let store = ThresholdStore::new(&config.output.thresholds_path);
    let thresholds = store.load()?;
    let report = runtime.block_on(offline::analyze_file(wav, config, &thresholds))?;

    if json {
        let segments: Vec<serde_json::Value> = report
            .segments
            .iter()
            .map(|s| {
                serde_json::json!({
                    "start_ms": s.start.as_millis() as u64,
                    "end_ms": s.end.as_millis() as u64,
                })
            })
            .collect();
        let out = serde_json::json!({
            "file": wav.display().to_string(),
            "duration_ms": report.duration.as_millis() as u64,
            "sample_rate": report.sample_rate,
            "segments": segments,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{}:", wav.display());
    println!("  Duration:  {:.2} s", report.duration.as_secs_f64());
    println!("  Ticks:     {}", report.ticks);
    println!("  Segments:  {}", report.segments.len());
    for (i, segment) in report.segments.iter().enumerate() {
        println!(
            "  {:>3}. {:>8.2} s - {:>8.2} s",
            i + 1,
            segment.start.as_secs_f64(),
            segment.end.as_secs_f64()
        );
    }
    println!("  Speech:    {:.2} s", report.speech_time().as_secs_f64());
    Ok(())
}

/// Show the stored thresholds.
pub fn show_thresholds(thresholds_path: &Path) -> Result<()> {
    let store = ThresholdStore::new(thresholds_path);
    let thresholds = store.load()?;
    if store.path().exists() {
        println!("Thresholds ({}):", store.path().display());
    } else {
        println!("Thresholds (not calibrated, using defaults):");
    }
    print_thresholds(&thresholds);
    Ok(())
}

fn print_thresholds(thresholds: &voxgate::CalibrationThresholds) {
    println!("  Amplitude:         > {:.2}", thresholds.amplitude_threshold);
    println!(
        "  Spectral centroid: {:.0} - {:.0} Hz",
        thresholds.spectral_centroid_min, thresholds.spectral_centroid_max
    );
    println!(
        "  Zero-crossing:     {:.3} - {:.3}",
        thresholds.zcr_min, thresholds.zcr_max
    );
}

#[cfg(feature = "mic")]
pub fn list_devices() -> Result<()> {
    let devices = voxgate::audio::capture::MicSource::list_devices()?;
    if devices.is_empty() {
        println!("No input devices found");
    }
    for name in devices {
        println!("{}", name);
    }
    Ok(())
}

#[cfg(not(feature = "mic"))]
pub fn list_devices() -> Result<()> {
    anyhow::bail!("Device listing needs the `mic` feature")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_show_thresholds_without_file() {
        let tmp = TempDir::new().unwrap();
        show_thresholds(&tmp.path().join("missing.json")).unwrap();
    }

    #[test]
    fn test_show_thresholds_rejects_corrupt_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("thresholds.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(show_thresholds(&path).is_err());
    }

    #[test]
    fn test_explain_keeps_user_message() {
        let err = explain(EngineError::SessionActive);
        assert_eq!(err.to_string(), "Voice detection is already running.");
        assert!(err.downcast_ref::<EngineError>().is_some());
    }

    #[cfg(not(feature = "mic"))]
    #[test]
    fn test_live_capture_needs_mic_feature() {
        let result = open_source(&Config::default(), None);
        assert!(result.is_err());
        assert!(result
            .err()
            .unwrap()
            .to_string()
            .contains("`mic` feature"));
    }
}
