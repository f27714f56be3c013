// Chunk writer thread: receives encoded AudioChunks and stores each as a WAV
// file under a per-day directory.
//
// Chunks already carry a complete WAV file, so writing is a base64 decode and
// a plain file write. Chunks flushed after speech ended get a `_tail` suffix.

use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Local};

use crate::streaming::AudioChunk;

/// Runs the chunk writer loop. Call on a dedicated thread.
///
/// Blocks until the channel is closed and returns the number of files
/// written. A chunk that fails to decode is logged and skipped.
pub fn run_chunk_writer(receiver: Receiver<AudioChunk>, directory: &Path) -> Result<usize> {
    let mut written = 0usize;

    for chunk in receiver {
        let bytes = match STANDARD.decode(&chunk.data) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Skipping undecodable chunk: {}", e);
                continue;
            }
        };

        let path = make_chunk_path(directory, Local::now(), written, chunk.is_speaking);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, &bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        written += 1;
        tracing::info!("Saved chunk: {}", path.display());
    }

    tracing::debug!("Chunk writer exiting after {} files", written);
    Ok(written)
}

fn make_chunk_path(
    base_dir: &Path,
    now: DateTime<Local>,
    sequence: usize,
    is_speaking: bool,
) -> PathBuf {
    let suffix = if is_speaking { "" } else { "_tail" };
    let filename = format!(
        "chunk_{}_{:04}{}.wav",
        now.format("%H-%M-%S-%3f"),
        sequence,
        suffix
    );
    base_dir
        .join(now.format("%Y-%m-%d").to_string())
        .join(filename)
}
