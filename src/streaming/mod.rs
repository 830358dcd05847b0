//! Outbound audio streaming
//!
//! Captured audio is sliced into fixed-duration chunks, queued, and drained to
//! the connection at a paced rate.
//!
//! # Architecture
//!
//! ```text
//! PCM16 bytes ─────────────┐
//!                          ▼
//! f32 samples ──▶ Resample ──▶ Slice ──▶ ChunkQueue ──▶ AudioTransport
//!   (pooled buffer)                      (bounded)      (ConnectionManager)
//! ```
//!
//! # Failure Strategy
//!
//! - A failed slice send is logged and counted, never retried
//! - A full queue drops its oldest slices
//! - Preconnect failures are reported as `false`, never as errors

mod audio_chunk;
mod pipeline;

pub use audio_chunk::{
    downsample_into, downsampled_len, encode_pcm16, split_into_slices, AudioChunk, ChunkQueue,
};
pub use pipeline::{
    AudioTransport, PipelineStats, StreamingConfig, StreamingPipeline, WeakPipeline,
};
