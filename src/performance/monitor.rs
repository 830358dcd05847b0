//! Performance sampling for the streaming pipeline
//!
//! Tracks processing time, frame rate, memory, and pooled buffer usage.
//! Owned explicitly: construct one `PerformanceMonitor`, `init()` it, pass
//! clones to whoever records into it, and `stop()` it on shutdown.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::pool::BufferPool;

/// Number of processing-time samples averaged
const MAX_PROCESSING_SAMPLES: usize = 100;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Thresholds and timer intervals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Memory ceiling before a warning is logged
    pub max_memory_mb: u64,
    /// CPU estimate ceiling (percent)
    pub max_cpu_percent: f64,
    /// Ceiling for bytes held by checked-out buffers
    pub max_buffer_bytes: u64,
    /// Pool sweep interval
    pub gc_interval_ms: u64,
    /// Idle time after which a pooled buffer is evicted
    pub idle_timeout_ms: u64,
    /// Metrics sampling interval
    pub metrics_interval_ms: u64,
    /// Buffers preallocated on `init()`
    pub pool_size: usize,
    /// Length (samples) of each preallocated buffer
    pub pool_buffer_len: usize,
    /// Snapshots retained in the history ring
    pub history_len: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 100,
            max_cpu_percent: 80.0,
            max_buffer_bytes: 10 * BYTES_PER_MB,
            gc_interval_ms: 30_000,
            idle_timeout_ms: 60_000,
            metrics_interval_ms: 1_000,
            pool_size: 10,
            pool_buffer_len: 4800,
            history_len: 60,
        }
    }
}

/// Point-in-time performance snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Unix timestamp when sampled (milliseconds)
    pub sampled_at: u64,
    pub memory_bytes: u64,
    pub cpu_percent: f64,
    /// Bytes held by checked-out pool buffers
    pub buffer_bytes: u64,
    /// Pool sweeps performed so far
    pub sweep_count: u64,
    pub avg_processing_ms: f64,
    /// Processing units per second since the previous sample
    pub frame_rate: f64,
}

struct MonitorState {
    processing_times: VecDeque<f64>,
    frames_since_sample: u64,
    last_sample_at: Instant,
    sweep_count: u64,
    history: VecDeque<PerformanceMetrics>,
}

/// Resident memory lookup for this process
struct ProcessMemory {
    system: System,
    pid: Option<Pid>,
}

impl ProcessMemory {
    fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                log::warn!("Performance: process memory unavailable: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }

    fn resident_bytes(&mut self) -> Option<u64> {
        let pid = self.pid?;
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            ProcessRefreshKind::new().with_memory(),
        );
        self.system.process(pid).map(|process| process.memory())
    }
}

struct MonitorInner {
    config: PerformanceConfig,
    pool: Arc<BufferPool>,
    state: Mutex<MonitorState>,
    memory: Mutex<ProcessMemory>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Buffer pool owner and metrics sampler
#[derive(Clone)]
pub struct PerformanceMonitor {
    inner: Arc<MonitorInner>,
}

impl PerformanceMonitor {
    pub fn new(config: PerformanceConfig) -> Self {
        let history_len = config.history_len.max(1);
        Self {
            inner: Arc::new(MonitorInner {
                config,
                pool: Arc::new(BufferPool::new()),
                state: Mutex::new(MonitorState {
                    processing_times: VecDeque::with_capacity(MAX_PROCESSING_SAMPLES),
                    frames_since_sample: 0,
                    last_sample_at: Instant::now(),
                    sweep_count: 0,
                    history: VecDeque::with_capacity(history_len),
                }),
                memory: Mutex::new(ProcessMemory::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &PerformanceConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.inner.pool
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        !self.tasks().is_empty()
    }

    /// Preallocate the pool and start the sweep and sampling timers
    ///
    /// Calling `init()` on a running monitor does nothing.
    pub fn init(&self) {
        let mut tasks = self.tasks();
        if !tasks.is_empty() {
            log::debug!("Performance: monitor already running");
            return;
        }

        let config = &self.inner.config;
        self.inner
            .pool
            .preallocate(config.pool_size, config.pool_buffer_len);
        self.state().last_sample_at = Instant::now();

        let gc_period = Duration::from_millis(config.gc_interval_ms.max(1));
        tasks.push(self.spawn_timer(gc_period, |monitor| {
            monitor.sweep();
        }));

        let metrics_period = Duration::from_millis(config.metrics_interval_ms.max(1));
        tasks.push(self.spawn_timer(metrics_period, |monitor| {
            monitor.sample_now();
        }));

        log::info!(
            "Performance: monitor started (pool {}×{} samples, sweep every {}ms, sample every {}ms)",
            config.pool_size,
            config.pool_buffer_len,
            config.gc_interval_ms,
            config.metrics_interval_ms
        );
    }

    /// Run `tick` every `period` until stopped or the monitor is dropped
    fn spawn_timer<F>(&self, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(&PerformanceMonitor) + Send + 'static,
    {
        let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                tick(&PerformanceMonitor { inner });
            }
        })
    }

    /// Stop the timers and drop the pool
    pub fn stop(&self) {
        let tasks: Vec<_> = self.tasks().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.inner.pool.clear();
        log::info!("Performance: monitor stopped");
    }

    /// Run one pool sweep now
    pub fn sweep(&self) -> usize {
        let idle = Duration::from_millis(self.inner.config.idle_timeout_ms);
        let evicted = self.inner.pool.sweep(idle);
        self.state().sweep_count += 1;
        evicted
    }

    /// Record the duration of one audio-processing unit of work
    pub fn record_processing_time(&self, ms: f64) {
        let mut state = self.state();
        state.processing_times.push_back(ms);
        while state.processing_times.len() > MAX_PROCESSING_SAMPLES {
            state.processing_times.pop_front();
        }
        state.frames_since_sample += 1;
    }

    /// Take a snapshot, append it to the history, and warn on ceiling breaches
    pub fn sample_now(&self) -> PerformanceMetrics {
        let config = &self.inner.config;
        let buffer_bytes = self.inner.pool.in_use_bytes() as u64;
        let memory_bytes = self
            .inner
            .memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resident_bytes()
            .unwrap_or(buffer_bytes);
        let now = Instant::now();

        let metrics = {
            let mut state = self.state();

            let avg_processing_ms = if state.processing_times.is_empty() {
                0.0
            } else {
                state.processing_times.iter().sum::<f64>() / state.processing_times.len() as f64
            };
            let cpu_percent = if config.metrics_interval_ms == 0 {
                0.0
            } else {
                (avg_processing_ms / config.metrics_interval_ms as f64 * 100.0).min(100.0)
            };

            let elapsed = now.duration_since(state.last_sample_at).as_secs_f64();
            let frame_rate = if elapsed > 0.0 {
                state.frames_since_sample as f64 / elapsed
            } else {
                0.0
            };
            state.frames_since_sample = 0;
            state.last_sample_at = now;

            let metrics = PerformanceMetrics {
                sampled_at: unix_millis(),
                memory_bytes,
                cpu_percent,
                buffer_bytes,
                sweep_count: state.sweep_count,
                avg_processing_ms,
                frame_rate,
            };

            state.history.push_back(metrics.clone());
            while state.history.len() > config.history_len.max(1) {
                state.history.pop_front();
            }
            metrics
        };

        if metrics.memory_bytes > self.memory_ceiling_bytes() {
            log::warn!(
                "Performance: memory {:.1}MB above ceiling {}MB",
                metrics.memory_bytes as f64 / BYTES_PER_MB as f64,
                config.max_memory_mb
            );
        }
        if metrics.cpu_percent > config.max_cpu_percent {
            log::warn!(
                "Performance: CPU estimate {:.1}% above ceiling {:.1}%",
                metrics.cpu_percent,
                config.max_cpu_percent
            );
        }
        if metrics.buffer_bytes > config.max_buffer_bytes {
            log::warn!(
                "Performance: {} bytes in checked-out buffers, ceiling {}",
                metrics.buffer_bytes,
                config.max_buffer_bytes
            );
        }

        metrics
    }

    fn memory_ceiling_bytes(&self) -> u64 {
        self.inner.config.max_memory_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn latest_metrics(&self) -> Option<PerformanceMetrics> {
        self.state().history.back().cloned()
    }

    /// Retained snapshots, oldest first
    pub fn metrics_history(&self) -> Vec<PerformanceMetrics> {
        self.state().history.iter().cloned().collect()
    }

    /// Whether the latest snapshot is within every configured ceiling
    ///
    /// True when nothing has been sampled yet.
    pub fn is_performance_optimal(&self) -> bool {
        let config = &self.inner.config;
        match self.latest_metrics() {
            Some(m) => {
                m.memory_bytes <= self.memory_ceiling_bytes()
                    && m.cpu_percent <= config.max_cpu_percent
                    && m.buffer_bytes <= config.max_buffer_bytes
            }
            None => true,
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generous() -> PerformanceConfig {
        PerformanceConfig {
            max_memory_mb: u64::MAX,
            ..Default::default()
        }
    }

    #[test]
    fn test_average_uses_last_hundred_samples() {
        let monitor = PerformanceMonitor::new(generous());

        for _ in 0..50 {
            monitor.record_processing_time(100.0);
        }
        for _ in 0..100 {
            monitor.record_processing_time(10.0);
        }

        let metrics = monitor.sample_now();
        assert!((metrics.avg_processing_ms - 10.0).abs() < 1e-9);
        // 10ms of work per 1000ms interval
        assert!((metrics.cpu_percent - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_memory_reports_this_process() {
        let monitor = PerformanceMonitor::new(generous());

        let metrics = monitor.sample_now();
        // At least the resident test binary, far above the empty pool
        assert!(metrics.memory_bytes > BYTES_PER_MB);
        assert!(monitor.is_performance_optimal());
    }

    #[test]
    fn test_memory_ceiling_breach_is_not_optimal() {
        let monitor = PerformanceMonitor::new(PerformanceConfig {
            max_memory_mb: 0,
            ..generous()
        });

        monitor.sample_now();
        assert!(!monitor.is_performance_optimal());
    }

    #[test]
    fn test_history_is_bounded() {
        let monitor = PerformanceMonitor::new(PerformanceConfig {
            history_len: 3,
            ..generous()
        });

        for _ in 0..5 {
            monitor.sample_now();
        }

        assert_eq!(monitor.metrics_history().len(), 3);
    }

    #[test]
    fn test_optimal_reflects_ceilings() {
        let monitor = PerformanceMonitor::new(PerformanceConfig {
            max_cpu_percent: 5.0,
            ..generous()
        });
        assert!(monitor.is_performance_optimal());

        monitor.record_processing_time(10.0);
        monitor.sample_now();
        assert!(monitor.is_performance_optimal());

        monitor.record_processing_time(500.0);
        monitor.sample_now();
        assert!(!monitor.is_performance_optimal());
    }

    #[test]
    fn test_buffer_bytes_tracks_checkouts() {
        let monitor = PerformanceMonitor::new(PerformanceConfig {
            max_buffer_bytes: 100,
            ..generous()
        });

        let buffer = monitor.pool().acquire(64);
        let metrics = monitor.sample_now();
        assert_eq!(metrics.buffer_bytes, 256);
        assert!(!monitor.is_performance_optimal());

        monitor.pool().release(buffer);
        monitor.sample_now();
        assert!(monitor.is_performance_optimal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_rate() {
        let monitor = PerformanceMonitor::new(generous());
        monitor.sample_now();

        for _ in 0..20 {
            monitor.record_processing_time(1.0);
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        let metrics = monitor.sample_now();
        assert!((metrics.frame_rate - 10.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_runs_timers_and_stop_clears_pool() {
        let monitor = PerformanceMonitor::new(PerformanceConfig {
            gc_interval_ms: 1_000,
            metrics_interval_ms: 500,
            pool_size: 4,
            ..generous()
        });

        monitor.init();
        assert!(monitor.is_running());
        assert_eq!(monitor.pool().len(), 4);

        tokio::time::sleep(Duration::from_millis(2_100)).await;

        assert_eq!(monitor.metrics_history().len(), 4);
        assert_eq!(monitor.latest_metrics().unwrap().sweep_count, 2);

        monitor.stop();
        assert!(!monitor.is_running());
        assert!(monitor.pool().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(monitor.metrics_history().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_monitor_releases_timers_and_pool() {
        let monitor = PerformanceMonitor::new(PerformanceConfig {
            gc_interval_ms: 100,
            metrics_interval_ms: 100,
            ..generous()
        });
        monitor.init();
        let pool = Arc::downgrade(monitor.pool());
        let inner = Arc::downgrade(&monitor.inner);

        tokio::time::sleep(Duration::from_millis(250)).await;
        drop(monitor);
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(inner.upgrade().is_none());
        assert!(pool.upgrade().is_none());
    }
}
