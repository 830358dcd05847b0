//! Outbound audio pipeline
//!
//! Splits captured audio into fixed-duration slices, queues them, and drains
//! the queue to the transport from a background task.
//!
//! # Architecture
//!
//! ```text
//! Producer                         Tokio Runtime
//! ┌──────────────────┐             ┌───────────────────────┐
//! │ stream_audio()   │──slices──▶  │ ChunkQueue (bounded)  │
//! │ stream_samples() │             │   └─ drain_loop()     │
//! └──────────────────┘             │        ├─ send_audio  │
//!                                  │        └─ yield       │
//!                                  └───────────────────────┘
//! ```
//!
//! The pipeline holds an `AudioTransport`, never the socket itself. The drain
//! task is started lazily on enqueue and exits once the queue is empty.

use futures_util::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use super::audio_chunk::{
    downsample_into, downsampled_len, encode_pcm16, split_into_slices, ChunkQueue,
};
use crate::connection::{ConnectionError, ConnectionManager};
use crate::performance::PerformanceMonitor;

/// Pipeline tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Duration of each outbound slice
    pub chunk_size_ms: u32,
    /// Audio retained in the queue before the oldest slices are dropped
    pub buffer_size_ms: u32,
    /// Open the connection ahead of the first slice
    pub preconnect_enabled: bool,
    /// Queue and pace slices; when false, audio is sent directly
    pub streaming_enabled: bool,
    /// Run `call_function_async` work on a spawned task
    pub async_enabled: bool,
    /// Output sample rate (Hz)
    pub sample_rate: u32,
    pub bytes_per_sample: u32,
    /// Queue depth above which the drain loop yields between slices
    pub backpressure_threshold: usize,
    /// Yield duration under backpressure; zero yields to the scheduler only
    pub yield_interval_ms: u64,
    pub preconnect_timeout_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size_ms: 100,
            buffer_size_ms: 5000,
            preconnect_enabled: true,
            streaming_enabled: true,
            async_enabled: true,
            sample_rate: 24000,
            bytes_per_sample: 2,
            backpressure_threshold: 10,
            yield_interval_ms: 1,
            preconnect_timeout_ms: 5000,
        }
    }
}

impl StreamingConfig {
    /// Bytes per outbound slice
    pub fn slice_bytes(&self) -> usize {
        self.sample_rate as usize * self.bytes_per_sample as usize * self.chunk_size_ms as usize
            / 1000
    }
}

/// Where the pipeline sends audio
///
/// Implemented by `ConnectionManager`; tests substitute recorders.
pub trait AudioTransport: Send + Sync + 'static {
    fn send_audio(&self, bytes: Vec<u8>) -> BoxFuture<'_, Result<(), ConnectionError>>;
    fn connect(&self) -> BoxFuture<'_, Result<(), ConnectionError>>;
}

impl AudioTransport for ConnectionManager {
    fn send_audio(&self, bytes: Vec<u8>) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move { ConnectionManager::send_audio(self, &bytes).await })
    }

    fn connect(&self) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(ConnectionManager::connect(self))
    }
}

/// Counters reported by `StreamingPipeline::stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub streaming: bool,
    pub paused: bool,
    pub queued: usize,
    /// Bytes waiting in the queue
    pub queued_bytes: usize,
    /// Slices ever enqueued
    pub slices_enqueued: u64,
    pub slices_sent: u64,
    pub send_failures: u64,
    pub slices_dropped: u64,
    /// Input chunks discarded because the pipeline was paused
    pub paused_discards: u64,
    /// Audio delivered by the drain loop
    pub audio_ms_sent: u64,
    /// Longest time a slice waited in the queue
    pub max_queue_wait_ms: u64,
}

struct PipelineInner {
    config: StreamingConfig,
    transport: Arc<dyn AudioTransport>,
    monitor: Option<PerformanceMonitor>,
    queue: Mutex<ChunkQueue>,
    enabled: AtomicBool,
    paused: AtomicBool,
    /// Set while a drain task owns the queue
    draining: AtomicBool,
    slices_sent: AtomicU64,
    send_failures: AtomicU64,
    slices_dropped: AtomicU64,
    paused_discards: AtomicU64,
    audio_ms_sent: AtomicU64,
    max_queue_wait_ms: AtomicU64,
    /// Signalled when a drain task exits
    idle: Notify,
}

/// Handle to the outbound audio pipeline
#[derive(Clone)]
pub struct StreamingPipeline {
    inner: Arc<PipelineInner>,
}

/// Non-owning pipeline handle for callbacks held by other components
#[derive(Clone)]
pub struct WeakPipeline {
    inner: Weak<PipelineInner>,
}

impl WeakPipeline {
    pub fn upgrade(&self) -> Option<StreamingPipeline> {
        self.inner.upgrade().map(|inner| StreamingPipeline { inner })
    }
}

impl StreamingPipeline {
    pub fn new(
        config: StreamingConfig,
        transport: Arc<dyn AudioTransport>,
        monitor: Option<PerformanceMonitor>,
    ) -> Self {
        let queue = ChunkQueue::new(config.buffer_size_ms, config.chunk_size_ms);
        log::info!(
            "Pipeline: initialized ({}Hz, {}ms slices = {} bytes, queue holds {} slices)",
            config.sample_rate,
            config.chunk_size_ms,
            config.slice_bytes(),
            queue.capacity()
        );

        Self {
            inner: Arc::new(PipelineInner {
                enabled: AtomicBool::new(config.streaming_enabled),
                paused: AtomicBool::new(false),
                config,
                transport,
                monitor,
                queue: Mutex::new(queue),
                draining: AtomicBool::new(false),
                slices_sent: AtomicU64::new(0),
                send_failures: AtomicU64::new(0),
                slices_dropped: AtomicU64::new(0),
                paused_discards: AtomicU64::new(0),
                audio_ms_sent: AtomicU64::new(0),
                max_queue_wait_ms: AtomicU64::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakPipeline {
        WeakPipeline {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn queue(&self) -> MutexGuard<'_, ChunkQueue> {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue PCM16 bytes for sending
    ///
    /// With streaming disabled the bytes are sent directly; failures are
    /// logged and counted, never returned. While paused the bytes are
    /// discarded in either mode.
    pub async fn stream_audio(&self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }

        if self.is_paused() {
            self.inner.paused_discards.fetch_add(1, Ordering::Relaxed);
            log::debug!("Pipeline: paused, discarding {} bytes", data.len());
            return;
        }

        if !self.is_streaming() {
            self.send_slice(data).await;
            return;
        }

        let slices = split_into_slices(&data, self.inner.config.slice_bytes());
        let dropped = {
            let mut queue = self.queue();
            slices.into_iter().map(|slice| queue.push(slice)).sum::<usize>()
        };
        if dropped > 0 {
            self.inner
                .slices_dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
            log::warn!("Pipeline: queue full, dropped {} oldest slices", dropped);
        }

        self.ensure_draining();
    }

    /// Downsample float samples to the output rate, encode PCM16, and queue them
    pub async fn stream_samples(&self, samples: &[f32], source_rate: u32) {
        if samples.is_empty() {
            return;
        }

        let started = Instant::now();
        let target_rate = self.inner.config.sample_rate;
        let out_len = downsampled_len(samples.len(), source_rate, target_rate);

        let bytes = match &self.inner.monitor {
            Some(monitor) => {
                let mut buffer = monitor.pool().acquire(out_len);
                let written = downsample_into(samples, source_rate, target_rate, &mut buffer);
                let bytes = encode_pcm16(&buffer[..written]);
                monitor.pool().release(buffer);
                bytes
            }
            None => {
                let mut buffer = vec![0.0f32; out_len];
                let written = downsample_into(samples, source_rate, target_rate, &mut buffer);
                encode_pcm16(&buffer[..written])
            }
        };

        if let Some(monitor) = &self.inner.monitor {
            monitor.record_processing_time(started.elapsed().as_secs_f64() * 1000.0);
        }

        self.stream_audio(bytes).await;
    }

    /// Enable queued streaming
    pub fn start_streaming(&self) {
        if !self.inner.enabled.swap(true, Ordering::AcqRel) {
            log::info!("Pipeline: streaming started");
        }
        if !self.queue().is_empty() {
            self.ensure_draining();
        }
    }

    /// Disable streaming and discard any queued slices
    pub fn stop_streaming(&self) {
        self.inner.enabled.store(false, Ordering::Release);
        let discarded = {
            let mut queue = self.queue();
            let n = queue.len();
            queue.clear();
            n
        };
        log::info!("Pipeline: streaming stopped ({} queued slices discarded)", discarded);
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Discard incoming audio and anything queued until `resume()`
    ///
    /// Independent of `stop_streaming()`, which switches to direct sends.
    pub fn pause(&self) {
        if self.inner.paused.swap(true, Ordering::AcqRel) {
            return;
        }
        let discarded = {
            let mut queue = self.queue();
            let n = queue.len();
            queue.clear();
            n
        };
        log::info!("Pipeline: paused ({} queued slices discarded)", discarded);
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::AcqRel) {
            log::info!("Pipeline: resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue().len()
    }

    pub fn stats(&self) -> PipelineStats {
        let (queued, queued_bytes, slices_enqueued) = {
            let queue = self.queue();
            (queue.len(), queue.memory_bytes(), queue.next_sequence())
        };
        PipelineStats {
            streaming: self.is_streaming(),
            paused: self.is_paused(),
            queued,
            queued_bytes,
            slices_enqueued,
            slices_sent: self.inner.slices_sent.load(Ordering::Relaxed),
            send_failures: self.inner.send_failures.load(Ordering::Relaxed),
            slices_dropped: self.inner.slices_dropped.load(Ordering::Relaxed),
            paused_discards: self.inner.paused_discards.load(Ordering::Relaxed),
            audio_ms_sent: self.inner.audio_ms_sent.load(Ordering::Relaxed),
            max_queue_wait_ms: self.inner.max_queue_wait_ms.load(Ordering::Relaxed),
        }
    }

    /// Wait until the drain task has emptied the queue and exited
    pub async fn flush(&self) {
        loop {
            let notified = self.inner.idle.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();

            let busy = self.inner.draining.load(Ordering::Acquire)
                || (self.is_streaming() && !self.queue().is_empty());
            if !busy {
                return;
            }
            notified.await;
        }
    }

    /// Open the transport ahead of the first slice
    ///
    /// Returns whether the transport connected within the preconnect timeout.
    pub async fn preconnect_websocket(&self) -> bool {
        let config = &self.inner.config;
        if !config.preconnect_enabled {
            return false;
        }

        let limit = Duration::from_millis(config.preconnect_timeout_ms);
        match timeout(limit, self.inner.transport.connect()).await {
            Ok(Ok(())) => {
                log::info!("Pipeline: preconnected");
                true
            }
            Ok(Err(e)) => {
                log::warn!("Pipeline: preconnect failed: {}", e);
                false
            }
            Err(_) => {
                log::warn!("Pipeline: preconnect timed out after {:?}", limit);
                false
            }
        }
    }

    /// Run `work` and route its outcome to one of the callbacks
    ///
    /// When async execution is enabled the work runs on a spawned task and
    /// its handle is returned; otherwise it is awaited inline.
    pub async fn call_function_async<T, E, Fut, S, F>(
        &self,
        work: Fut,
        on_success: S,
        on_error: F,
    ) -> Option<JoinHandle<()>>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
        S: FnOnce(T) + Send + 'static,
        F: FnOnce(E) + Send + 'static,
    {
        let run = async move {
            match work.await {
                Ok(value) => on_success(value),
                Err(e) => on_error(e),
            }
        };

        if self.inner.config.async_enabled {
            Some(tokio::spawn(run))
        } else {
            run.await;
            None
        }
    }

    /// Process `items` in sequential batches, concurrently within each batch
    ///
    /// Results are returned in input order.
    pub async fn batch_process<I, T, P, Fut>(
        &self,
        items: Vec<I>,
        processor: P,
        batch_size: usize,
    ) -> Vec<T>
    where
        P: Fn(I) -> Fut,
        Fut: Future<Output = T>,
    {
        let batch_size = batch_size.max(1);
        let mut results = Vec::with_capacity(items.len());
        let mut items = items.into_iter().peekable();

        while items.peek().is_some() {
            let batch: Vec<Fut> = items.by_ref().take(batch_size).map(&processor).collect();
            results.extend(join_all(batch).await);
            tokio::task::yield_now().await;
        }
        results
    }

    /// Await `work` and report how long it took
    pub async fn measure_latency<T, Fut>(&self, work: Fut) -> (T, Duration)
    where
        Fut: Future<Output = T>,
    {
        let started = Instant::now();
        let output = work.await;
        let elapsed = started.elapsed();
        log::debug!("Pipeline: operation took {:?}", elapsed);
        (output, elapsed)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Send one slice, returning whether it was delivered
    async fn send_slice(&self, bytes: Vec<u8>) -> bool {
        let len = bytes.len();
        match self.inner.transport.send_audio(bytes).await {
            Ok(()) => {
                self.inner.slices_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.inner.send_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Pipeline: failed to send {} byte slice: {}", len, e);
                false
            }
        }
    }

    fn ensure_draining(&self) {
        if self.inner.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(self.clone().drain_loop());
    }

    async fn drain_loop(self) {
        let config = &self.inner.config;
        loop {
            while self.is_streaming() && !self.is_paused() {
                let (chunk, remaining) = {
                    let mut queue = self.queue();
                    let chunk = queue.pop_front();
                    (chunk, queue.len())
                };
                let Some(chunk) = chunk else {
                    break;
                };

                let waited_ms = chunk.captured_at().elapsed().as_millis() as u64;
                self.inner
                    .max_queue_wait_ms
                    .fetch_max(waited_ms, Ordering::Relaxed);
                let audio_ms = chunk.duration_ms(config.sample_rate, config.bytes_per_sample);
                log::trace!(
                    "Pipeline: slice #{} ({}ms audio, queued {}ms)",
                    chunk.sequence(),
                    audio_ms,
                    waited_ms
                );

                if self.send_slice(chunk.into_data()).await {
                    self.inner.audio_ms_sent.fetch_add(audio_ms, Ordering::Relaxed);
                }

                if remaining > config.backpressure_threshold {
                    if config.yield_interval_ms == 0 {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(Duration::from_millis(config.yield_interval_ms)).await;
                    }
                }
            }

            self.inner.draining.store(false, Ordering::Release);

            // A producer may have enqueued after the last pop
            let pending = self.is_streaming() && !self.is_paused() && !self.queue().is_empty();
            if pending && !self.inner.draining.swap(true, Ordering::AcqRel) {
                continue;
            }
            break;
        }

        self.inner.idle.notify_waiters();
    }
}
