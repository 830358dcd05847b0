//! Buffer pooling and performance sampling
//!
//! `BufferPool` hands out reusable `f32` buffers for sample conversion;
//! `PerformanceMonitor` owns the pool, sweeps idle buffers, and samples
//! memory, CPU estimate, and processing time on fixed intervals.

mod monitor;
mod pool;

pub use monitor::{PerformanceConfig, PerformanceMetrics, PerformanceMonitor};
pub use pool::{BufferPool, PooledBuffer};
