//! Task workers and the executor supervising them
//!
//! This module provides:
//! - [`HandlerRegistry`] - task type to [`TaskHandler`] map shared by workers
//! - [`Worker`] - runs handlers with bounded concurrency
//! - [`Executor`] - consumption and monitor loops over a [`TaskQueueBackend`](crate::queue::TaskQueueBackend)
//! - [`BlockingHandler`], [`CircuitBreakerHandler`], [`RecoveringHandler`] - handler adapters
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Executor                             │
//! │  ┌──────────────┐ ┌──────────────┐        ┌────────────────┐  │
//! │  │ worker loop  │ │ worker loop  │  ...   │  monitor (5s)  │  │
//! │  │  worker-1    │ │  worker-2    │        │ replace dead,  │  │
//! │  └──────┬───────┘ └──────┬───────┘        │ reclaim stuck  │  │
//! │         │ consume        │                └────────────────┘  │
//! │         ▼                ▼                                    │
//! │  ┌─────────────────────────────────────────────────────────┐  │
//! │  │  Worker::execute (Semaphore-limited, max_concurrent)    │  │
//! │  │  HandlerRegistry -> TaskHandler -> complete / fail      │  │
//! │  └─────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod executor;
mod guard;
mod handler;
#[allow(clippy::module_inception)]
mod worker;

pub use executor::{Executor, ExecutorConfig, ExecutorError, ExecutorStats};
pub use guard::{BlockingHandler, CircuitBreakerHandler, RecoveringHandler};
pub use handler::{
    FnHandler, HandlerRegistry, RegistryError, TaskContext, TaskHandler, TaskType, TypedHandler,
};
pub use worker::{ExecutionResult, Worker, WorkerHealth};
