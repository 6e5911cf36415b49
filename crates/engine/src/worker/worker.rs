//! Bounded-concurrency task worker

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::handler::{HandlerRegistry, RegistryError, TaskContext, TaskHandler};
use crate::error::{panic_message, TaskError};
use crate::task::{TaskId, TaskRecord};

/// Outcome of running one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    #[serde(with = "crate::serde_duration::millis")]
    pub execution_time: Duration,
}

impl ExecutionResult {
    fn succeeded(task_id: TaskId, output: serde_json::Value, execution_time: Duration) -> Self {
        Self {
            task_id,
            success: true,
            output: Some(output),
            error: None,
            execution_time,
        }
    }

    fn failed(task_id: TaskId, error: TaskError, execution_time: Duration) -> Self {
        Self {
            task_id,
            success: false,
            output: None,
            error: Some(error),
            execution_time,
        }
    }

    /// Failure message suitable for the queue's error field
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

/// Worker health snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub worker_id: String,
    pub running: bool,
    pub current_load: usize,
    pub max_concurrent: usize,
    pub available_slots: usize,
    pub handlers: Vec<String>,
}

/// Decrements the load counter however execution ends
struct LoadGuard {
    load: Arc<AtomicUsize>,
}

impl LoadGuard {
    fn acquire(load: &Arc<AtomicUsize>) -> Self {
        load.fetch_add(1, Ordering::SeqCst);
        Self {
            load: Arc::clone(load),
        }
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.load.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs registered handlers, at most `max_concurrent` at a time
pub struct Worker {
    id: String,
    max_concurrent: usize,
    registry: HandlerRegistry,
    running: AtomicBool,
    current_load: Arc<AtomicUsize>,
    slots: Arc<Semaphore>,
    cancel: Mutex<CancellationToken>,
}

impl Worker {
    /// Create a stopped worker with its own handler registry
    pub fn new(id: impl Into<String>, max_concurrent: usize) -> Self {
        Self::with_registry(id, max_concurrent, HandlerRegistry::new())
    }

    /// Create a stopped worker sharing an existing registry
    pub fn with_registry(
        id: impl Into<String>,
        max_concurrent: usize,
        registry: HandlerRegistry,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            id: id.into(),
            max_concurrent,
            registry,
            running: AtomicBool::new(false),
            current_load: Arc::new(AtomicUsize::new(0)),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn current_load(&self) -> usize {
        self.current_load.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Register a handler; a later registration for the same type wins
    pub fn register_handler<H: TaskHandler>(
        &self,
        task_type: &str,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.registry.register(task_type, handler)
    }

    pub fn start(&self) {
        let mut cancel = self.cancel.lock();
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
        self.running.store(true, Ordering::SeqCst);
        info!(worker_id = %self.id, max_concurrent = self.max_concurrent, "Worker started");
    }

    /// Stop accepting tasks; running handlers continue
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(worker_id = %self.id, "Worker stopped");
        }
    }

    /// Stop and signal running handlers to abandon their work
    pub fn cancel(&self) {
        self.stop();
        self.cancel.lock().cancel();
    }

    /// Run a task's handler
    ///
    /// Never returns an error: every failure (not running, unknown type,
    /// handler error or panic) is reported as a failed result.
    #[instrument(skip(self, task), fields(worker_id = %self.id, task_id = %task.id, task_type = %task.task_type))]
    pub async fn execute(&self, task: &TaskRecord) -> ExecutionResult {
        let started = Instant::now();

        if !self.is_running() {
            return ExecutionResult::failed(
                task.id,
                TaskError::other(format!("worker {} is not running", self.id)),
                started.elapsed(),
            );
        }

        let Some(handler) = self.registry.get(&task.task_type) else {
            warn!("No handler registered");
            return ExecutionResult::failed(
                task.id,
                TaskError::permanent(format!(
                    "no handler registered for task type '{}'",
                    task.task_type
                )),
                started.elapsed(),
            );
        };

        let _permit = match Arc::clone(&self.slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return ExecutionResult::failed(
                    task.id,
                    TaskError::other("worker slots closed"),
                    started.elapsed(),
                )
            }
        };
        let _load = LoadGuard::acquire(&self.current_load);

        let ctx = TaskContext::new(self.id.clone(), self.cancel.lock().child_token());
        let outcome = AssertUnwindSafe(handler.handle(task, &ctx))
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(output)) => {
                debug!(elapsed_ms = elapsed.as_millis() as u64, "Handler succeeded");
                ExecutionResult::succeeded(task.id, output, elapsed)
            }
            Ok(Err(error)) => {
                debug!(category = %error.category(), "Handler failed: {}", error);
                ExecutionResult::failed(task.id, error, elapsed)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!("Handler panicked: {}", message);
                ExecutionResult::failed(task.id, TaskError::Panicked(message), elapsed)
            }
        }
    }

    pub fn health_check(&self) -> WorkerHealth {
        WorkerHealth {
            worker_id: self.id.clone(),
            running: self.is_running(),
            current_load: self.current_load(),
            max_concurrent: self.max_concurrent,
            available_slots: self.slots.available_permits(),
            handlers: self.registry.task_types(),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .field("current_load", &self.current_load())
            .field("max_concurrent", &self.max_concurrent)
            .finish()
    }
}
