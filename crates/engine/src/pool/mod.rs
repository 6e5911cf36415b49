//! Adaptive thread pool
//!
//! OS threads for blocking and CPU-bound handler work (source parsing,
//! coverage report processing) that must stay off the async runtime.
//!
//! - [`AdaptiveThreadPool`] - elastic pool resized from CPU and queue signals
//! - [`plan_resize`] - the pure resize rule used by the adjustment loop
//! - [`CpuSampler`] - load source, `sysinfo`-backed by default
//! - [`BackpressureConfig`] - submission limits

mod adaptive;
mod backpressure;
mod config;
mod cpu;
mod handle;
mod metrics;
mod scaling;

pub use adaptive::AdaptiveThreadPool;
pub use backpressure::{BackpressureConfig, BackpressureGate};
pub use config::AdaptivePoolConfig;
pub use cpu::{optimal_thread_count, CpuSampler, FixedCpuSampler, SystemCpuSampler};
pub use handle::{ScheduledBatch, TaskHandle};
pub use metrics::{DurationWindow, PoolMetrics, DURATION_WINDOW};
pub use scaling::{plan_resize, ResizeDecision};

use crate::config::ConfigError;

/// Adaptive pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Pool no longer accepts work
    #[error("thread pool is shut down")]
    ShutDown,

    /// Job panicked while running
    #[error("pool task panicked: {0}")]
    TaskPanicked(String),

    /// Job was dropped without producing a result
    #[error("pool task was dropped before completing")]
    Abandoned,

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Worker thread could not be started
    #[error("failed to spawn pool thread: {0}")]
    Spawn(String),
}
