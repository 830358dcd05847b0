//! Audio chunks, the bounded chunk queue, and sample conversion
//!
//! The queue stores pending slices between the producer and the drain loop.
//! When it is full, oldest slices are evicted to keep the memory bound.
//!
//! # Memory Budget
//!
//! At 24kHz mono PCM16 with 100ms slices:
//! - Slice size: 2400 samples × 2 bytes = 4,800 bytes
//! - 5 seconds: 50 slices × 4,800 bytes = 240 KB

use std::collections::VecDeque;
use tokio::time::Instant;

/// A slice of PCM16 little-endian audio
///
/// Immutable once created; ownership moves producer → queue → transport.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    data: Vec<u8>,
    sequence: u64,
    captured_at: Instant,
}

impl AudioChunk {
    pub fn new(data: Vec<u8>, sequence: u64) -> Self {
        Self {
            data,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Give up the bytes (used when handing the slice to the transport)
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sequence number for ordering (monotonically increasing)
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Duration of this chunk in milliseconds
    pub fn duration_ms(&self, sample_rate: u32, bytes_per_sample: u32) -> u64 {
        let bytes_per_second = sample_rate as u64 * bytes_per_sample as u64;
        if bytes_per_second == 0 {
            return 0;
        }
        (self.data.len() as u64 * 1000) / bytes_per_second
    }
}

/// FIFO of pending slices with oldest-first eviction
///
/// Thread-safety: This struct is NOT internally synchronized.
/// Wrap in a `Mutex` if shared across tasks.
#[derive(Debug)]
pub struct ChunkQueue {
    chunks: VecDeque<AudioChunk>,
    max_chunks: usize,
    next_sequence: u64,
}

impl ChunkQueue {
    /// Create a queue holding at most `max_duration_ms` of `chunk_duration_ms` slices
    ///
    /// # Example
    /// ```ignore
    /// // 5 seconds of 100ms slices = 50 slices max
    /// let queue = ChunkQueue::new(5000, 100);
    /// ```
    pub fn new(max_duration_ms: u32, chunk_duration_ms: u32) -> Self {
        let max_chunks = if chunk_duration_ms == 0 {
            1
        } else {
            ((max_duration_ms as f32 / chunk_duration_ms as f32).ceil() as usize).max(1)
        };

        Self {
            chunks: VecDeque::with_capacity(max_chunks),
            max_chunks,
            next_sequence: 0,
        }
    }

    /// Append a slice, evicting the oldest if at capacity
    ///
    /// Returns the number of slices evicted (0 or 1).
    pub fn push(&mut self, data: Vec<u8>) -> usize {
        let mut evicted = 0;
        if self.chunks.len() >= self.max_chunks {
            self.chunks.pop_front();
            evicted = 1;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.chunks.push_back(AudioChunk::new(data, sequence));
        evicted
    }

    /// Remove and return the oldest slice
    pub fn pop_front(&mut self) -> Option<AudioChunk> {
        self.chunks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_chunks
    }

    /// Approximate memory usage in bytes
    pub fn memory_bytes(&self) -> usize {
        self.chunks.iter().map(AudioChunk::len).sum()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Get the sequence number that will be assigned to the next push
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

/// Split `data` into consecutive slices of `slice_len` bytes
///
/// The last slice may be shorter. A zero `slice_len` yields one slice.
pub fn split_into_slices(data: &[u8], slice_len: usize) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return Vec::new();
    }
    if slice_len == 0 {
        return vec![data.to_vec()];
    }
    data.chunks(slice_len).map(<[u8]>::to_vec).collect()
}

/// Number of output samples `downsample_into` produces for `len` input samples
pub fn downsampled_len(len: usize, source_rate: u32, target_rate: u32) -> usize {
    match resample_ratio(source_rate, target_rate) {
        Some(ratio) => len.div_ceil(ratio),
        None => len,
    }
}

/// Downsample by averaging, writing into `out`
///
/// Only integer ratios (e.g. 48kHz → 24kHz) are supported; other ratios, equal
/// rates, or zero rates copy the input unchanged. Returns the number of
/// samples written, bounded by `out.len()`.
pub fn downsample_into(samples: &[f32], source_rate: u32, target_rate: u32, out: &mut [f32]) -> usize {
    let Some(ratio) = resample_ratio(source_rate, target_rate) else {
        let n = samples.len().min(out.len());
        out[..n].copy_from_slice(&samples[..n]);
        return n;
    };

    let mut written = 0;
    for (slot, group) in out.iter_mut().zip(samples.chunks(ratio)) {
        *slot = group.iter().sum::<f32>() / group.len() as f32;
        written += 1;
    }
    written
}

fn resample_ratio(source_rate: u32, target_rate: u32) -> Option<usize> {
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), passing through",
            source_rate,
            target_rate
        );
        return None;
    }
    if source_rate == target_rate {
        return None;
    }
    if source_rate % target_rate != 0 {
        log::warn!(
            "Unsupported resample ratio {}:{}, passing through",
            source_rate,
            target_rate
        );
        return None;
    }
    Some((source_rate / target_rate) as usize)
}

/// Convert float samples in [-1.0, 1.0] to PCM16 little-endian bytes
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| {
            let clamped = s.clamp(-1.0, 1.0);
            let value = if clamped < 0.0 {
                (clamped * 32768.0) as i16
            } else {
                (clamped * 32767.0) as i16
            };
            value.to_le_bytes()
        })
        .collect()
}
