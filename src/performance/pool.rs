//! Pool of reusable sample buffers
//!
//! Buffers are checked out by value: while a caller holds a `PooledBuffer`
//! the pool keeps only an in-use marker, so the same storage can never be
//! handed to two callers. Returning the buffer puts its storage back.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// A buffer checked out of a `BufferPool`
///
/// Derefs to a slice of exactly the requested length; the underlying
/// storage may be larger.
#[derive(Debug)]
pub struct PooledBuffer {
    id: u64,
    storage: Vec<f32>,
    len: usize,
}

impl PooledBuffer {
    /// Pool identity used to match the buffer on release
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Length of the underlying storage
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Address of the underlying storage (identity checks in tests/diagnostics)
    pub fn storage_ptr(&self) -> *const f32 {
        self.storage.as_ptr()
    }
}

impl Deref for PooledBuffer {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.storage[..self.len]
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.storage[..self.len]
    }
}

#[derive(Debug)]
struct PoolEntry {
    id: u64,
    capacity: usize,
    /// `None` while checked out
    storage: Option<Vec<f32>>,
    in_use: bool,
    last_used: Instant,
}

/// Pool of `f32` buffers with idle eviction
#[derive(Debug, Default)]
pub struct BufferPool {
    entries: Mutex<Vec<PoolEntry>>,
    next_id: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<PoolEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add `count` idle buffers of `len` samples
    pub fn preallocate(&self, count: usize, len: usize) {
        let now = Instant::now();
        let mut entries = self.entries();
        for _ in 0..count {
            entries.push(PoolEntry {
                id: self.next_id(),
                capacity: len,
                storage: Some(vec![0.0; len]),
                in_use: false,
                last_used: now,
            });
        }
    }

    /// Check out a buffer of at least `size` samples
    ///
    /// Reuses the first idle buffer that is large enough, otherwise allocates
    /// a new one and tracks it as in use.
    pub fn acquire(&self, size: usize) -> PooledBuffer {
        let now = Instant::now();
        let mut entries = self.entries();

        if let Some(entry) = entries
            .iter_mut()
            .find(|e| !e.in_use && e.capacity >= size)
        {
            if let Some(storage) = entry.storage.take() {
                entry.in_use = true;
                entry.last_used = now;
                return PooledBuffer {
                    id: entry.id,
                    storage,
                    len: size,
                };
            }
        }

        let id = self.next_id();
        log::debug!("BufferPool: allocating buffer {} ({} samples)", id, size);
        entries.push(PoolEntry {
            id,
            capacity: size,
            storage: None,
            in_use: true,
            last_used: now,
        });
        PooledBuffer {
            id,
            storage: vec![0.0; size],
            len: size,
        }
    }

    /// Return a buffer to the pool
    ///
    /// Buffers the pool does not know (evicted, cleared, or foreign) are dropped.
    pub fn release(&self, buffer: PooledBuffer) {
        let mut entries = self.entries();
        match entries.iter_mut().find(|e| e.id == buffer.id && e.in_use) {
            Some(entry) => {
                entry.in_use = false;
                entry.last_used = Instant::now();
                entry.storage = Some(buffer.storage);
            }
            None => {
                log::debug!("BufferPool: ignoring release of unknown buffer {}", buffer.id);
            }
        }
    }

    /// Evict idle buffers unused for longer than `idle_timeout`
    ///
    /// Returns the number of buffers evicted.
    pub fn sweep(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|e| e.in_use || now.duration_since(e.last_used) <= idle_timeout);
        let evicted = before - entries.len();
        if evicted > 0 {
            log::debug!("BufferPool: swept {} idle buffers", evicted);
        }
        evicted
    }

    /// Drop every tracked buffer; outstanding checkouts become foreign
    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Number of tracked buffers (idle + in use)
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn in_use_count(&self) -> usize {
        self.entries().iter().filter(|e| e.in_use).count()
    }

    /// Bytes held by checked-out buffers
    pub fn in_use_bytes(&self) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.in_use)
            .map(|e| e.capacity * std::mem::size_of::<f32>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_returns_view_of_requested_size() {
        let pool = BufferPool::new();
        pool.preallocate(1, 1024);

        let buffer = pool.acquire(100);
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.capacity(), 1024);
        assert_eq!(pool.in_use_count(), 1);
    }

    #[test]
    fn test_checked_out_buffer_is_never_shared() {
        let pool = BufferPool::new();
        pool.preallocate(1, 256);

        let first = pool.acquire(128);
        let second = pool.acquire(128);

        assert_ne!(first.id(), second.id());
        assert_ne!(first.storage_ptr(), second.storage_ptr());
        assert_eq!(pool.in_use_count(), 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_release_then_acquire_reuses_storage() {
        let pool = BufferPool::new();

        let buffer = pool.acquire(512);
        let id = buffer.id();
        let ptr = buffer.storage_ptr();
        pool.release(buffer);

        let again = pool.acquire(256);
        assert_eq!(again.id(), id);
        assert_eq!(again.storage_ptr(), ptr);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_too_small_buffer_not_reused() {
        let pool = BufferPool::new();
        let small = pool.acquire(16);
        pool.release(small);

        let large = pool.acquire(64);
        assert_eq!(large.capacity(), 64);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_release_unknown_buffer_is_ignored() {
        let pool = BufferPool::new();
        let other = BufferPool::new();
        other.preallocate(3, 8);
        let foreign = other.acquire(8);

        pool.release(foreign);
        assert!(pool.is_empty());

        // Cleared pool forgets its checkouts
        let buffer = other.acquire(8);
        other.clear();
        other.release(buffer);
        assert!(other.is_empty());
    }

    #[test]
    fn test_in_use_bytes() {
        let pool = BufferPool::new();
        let a = pool.acquire(100);
        let _b = pool.acquire(50);
        assert_eq!(pool.in_use_bytes(), 150 * 4);

        pool.release(a);
        assert_eq!(pool.in_use_bytes(), 50 * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_idle_buffers() {
        let pool = BufferPool::new();
        let stale = pool.acquire(10);
        let fresh = pool.acquire(20);
        let held = pool.acquire(30);
        pool.release(stale);

        tokio::time::advance(Duration::from_secs(30)).await;
        pool.release(fresh);

        tokio::time::advance(Duration::from_secs(40)).await;
        let evicted = pool.sweep(Duration::from_secs(60));

        // stale: idle 70s → evicted; fresh: idle 40s → kept; held: in use → kept
        assert_eq!(evicted, 1);
        assert_eq!(pool.len(), 2);
        let reused = pool.acquire(20);
        assert_eq!(reused.capacity(), 20);
        drop(held);
    }
}
