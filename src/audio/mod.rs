#[cfg(feature = "mic")]
pub mod capture;
pub mod chunk_writer;
pub mod features;
pub mod frame;
pub mod graph;
pub mod pipeline;
pub mod ring_buffer;
pub mod source;
pub mod suppression;
pub mod vad;
