//! # Task Execution Engine
//!
//! The scheduling core of the unit-test generation agent: a priority task
//! queue, supervised workers, an adaptive thread pool for blocking work, and
//! recovery policies for failing dependencies.
//!
//! ## Features
//!
//! - **Priority queue**: four priority tiers, FIFO within a tier, retries with a per-task budget
//! - **Timeout reclamation**: stuck tasks return to the queue on the monitor tick
//! - **Supervised workers**: dead workers are replaced; stop is graceful or immediate
//! - **Adaptive thread pool**: grows and shrinks from CPU and queue-depth signals
//! - **Recovery and circuit breakers**: retry, fallback, skip or abort by error category
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Executor                             │
//! │  (worker loops consume tasks, monitor replaces dead workers) │
//! └─────────────────────────────────────────────────────────────┘
//!          │ consume / complete / fail          │ execute
//!          ▼                                    ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │     TaskQueueBackend     │   │   Worker + HandlerRegistry   │
//! │ (InMemoryTaskQueue: heap │   │ (bounded concurrency, panic  │
//! │  by priority, then FIFO) │   │  isolation, cancellation)    │
//! └──────────────────────────┘   └──────────────────────────────┘
//!                                               │ blocking work
//!                                               ▼
//!                                ┌──────────────────────────────┐
//!                                │     AdaptiveThreadPool       │
//!                                │ (resized by CPU and backlog) │
//!                                └──────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use utagent_engine::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let queue = Arc::new(InMemoryTaskQueue::new());
//! let executor = Executor::new(
//!     queue.clone(),
//!     ExecutorConfig::default().with_poll_interval(Duration::from_millis(10)),
//! );
//!
//! executor
//!     .registry()
//!     .register_fn("generate_tests", |task, _ctx| async move {
//!         let file = task.payload["file"].as_str().unwrap_or_default().to_string();
//!         Ok(serde_json::json!({ "file": file, "tests": 3 }))
//!     })
//!     .unwrap();
//!
//! executor.start(2).await.unwrap();
//! let id = executor
//!     .submit(
//!         "generate_tests",
//!         serde_json::json!({ "file": "src/parser.rs" }),
//!         SubmitOptions::default().with_priority(TaskPriority::High),
//!     )
//!     .await
//!     .unwrap();
//!
//! loop {
//!     let task = executor.get_task(id).await.unwrap().unwrap();
//!     if task.status.is_terminal() {
//!         assert_eq!(task.status, TaskStatus::Completed);
//!         break;
//!     }
//!     tokio::time::sleep(Duration::from_millis(5)).await;
//! }
//!
//! executor.stop(true, Duration::from_secs(5)).await.unwrap();
//! # });
//! ```

pub mod config;
pub mod error;
pub mod pool;
pub mod queue;
pub mod reliability;
pub mod task;
pub mod worker;

mod serde_duration;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, EngineConfig};
    pub use crate::error::{ErrorCategory, TaskError};
    pub use crate::pool::{AdaptivePoolConfig, AdaptiveThreadPool, PoolError, TaskHandle};
    pub use crate::queue::{InMemoryTaskQueue, QueueError, QueueStats, TaskQueueBackend};
    pub use crate::reliability::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, RecoveryManager,
        RecoveryOutcome, RecoveryStrategy, RetryPolicy,
    };
    pub use crate::task::{NewTask, SubmitOptions, TaskClaim, TaskId, TaskPriority, TaskRecord, TaskStatus};
    pub use crate::worker::{
        Executor, ExecutorConfig, ExecutorError, HandlerRegistry, TaskContext, TaskHandler, Worker,
    };
}

// Re-export key types at crate root
pub use config::{ConfigError, EngineConfig};
pub use error::{ErrorCategory, TaskError};
pub use pool::{AdaptivePoolConfig, AdaptiveThreadPool, PoolError};
pub use queue::{FailureOutcome, InMemoryTaskQueue, QueueError, QueueStats, TaskQueueBackend};
pub use reliability::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, RecoveryManager,
    RecoveryOutcome, RecoveryStrategy, RetryPolicy,
};
pub use task::{NewTask, SubmitOptions, TaskClaim, TaskId, TaskPriority, TaskRecord, TaskStatus};
pub use worker::{Executor, ExecutorConfig, ExecutorError, HandlerRegistry, TaskHandler, Worker};
