//! TaskQueueBackend trait definition

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::task::{NewTask, TaskClaim, TaskId, TaskRecord, TaskStatus};

/// Error type for queue operations
///
/// These are programmer errors (unknown id, invalid transition) or backend
/// faults. Task-level failures never surface here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Task not found
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// Operation not valid for the task's current status
    #[error("cannot {operation} task {task_id} in status {status}")]
    InvalidState {
        task_id: TaskId,
        status: TaskStatus,
        operation: &'static str,
    },

    /// Outcome reported under a claim the task no longer holds
    #[error("stale claim on task {task_id}: worker {worker_id} attempt {attempt} no longer holds it")]
    StaleClaim {
        task_id: TaskId,
        worker_id: String,
        attempt: u32,
    },

    /// Backend failure (connection, serialization)
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl QueueError {
    pub(crate) fn invalid_state(task: &TaskRecord, operation: &'static str) -> Self {
        Self::InvalidState {
            task_id: task.id,
            status: task.status,
            operation,
        }
    }

    pub(crate) fn stale_claim(claim: &TaskClaim) -> Self {
        Self::StaleClaim {
            task_id: claim.task_id,
            worker_id: claim.worker_id.clone(),
            attempt: claim.attempt,
        }
    }

    /// Whether the task moved on without the caller (reclaimed, cancelled or
    /// already resolved)
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleClaim { .. } | Self::InvalidState { .. })
    }
}

/// Outcome of failing a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Task went back to pending with the new retry count
    WillRetry { retry_count: u32 },

    /// Task is terminally failed
    Failed,
}

/// Aggregate queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

impl QueueStats {
    /// Count a task under its status
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Processing => self.processing += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
        self.total += 1;
    }

    /// Completed share of finished (completed + failed) tasks
    ///
    /// Returns 0.0 when nothing has finished yet.
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.completed as f64 / finished as f64
        }
    }
}

/// Queue owning task lifecycle state
///
/// Any backend (in-memory, or a shared remote store coordinating several
/// executor processes) must honor the same state machine. `consume` must
/// hand a given task to exactly one caller even under concurrent callers,
/// and must only accept an outcome from the claim currently held on it.
#[async_trait]
pub trait TaskQueueBackend: Send + Sync + 'static {
    /// Enqueue a task as pending
    async fn submit(&self, task: NewTask) -> Result<TaskId, QueueError>;

    /// Claim the highest-priority pending task for `worker_id`
    ///
    /// Waits at most `timeout` for a task to become available. The returned
    /// snapshot carries the new claim (see [`TaskRecord::claim`]).
    async fn consume(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<TaskRecord>, QueueError>;

    /// Mark a processing task completed
    ///
    /// Fails with `StaleClaim` when `claim` is not the current claim.
    async fn complete(&self, claim: &TaskClaim, result: serde_json::Value)
        -> Result<(), QueueError>;

    /// Mark a processing task failed, requeueing it when `retry` is set and
    /// budget remains
    ///
    /// Fails with `StaleClaim` when `claim` is not the current claim.
    async fn fail(
        &self,
        claim: &TaskClaim,
        error: &str,
        retry: bool,
    ) -> Result<FailureOutcome, QueueError>;

    /// Cancel a non-terminal task
    async fn cancel(&self, task_id: TaskId) -> Result<(), QueueError>;

    /// Get a snapshot of a task
    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, QueueError>;

    /// List tasks, optionally filtered by status
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, QueueError>;

    /// List pending tasks in dequeue order
    async fn list_pending_tasks(&self) -> Result<Vec<TaskRecord>, QueueError>;

    /// Fail (with retry) every processing task that outlived its timeout
    ///
    /// Returns the ids of reclaimed tasks.
    async fn check_timeouts(&self) -> Result<Vec<TaskId>, QueueError>;

    /// Aggregate counters
    async fn get_stats(&self) -> Result<QueueStats, QueueError>;

    /// Drop terminal tasks finished at least `age` ago (all terminal tasks
    /// when `None`). Returns how many were removed.
    async fn clear_completed(&self, age: Option<Duration>) -> Result<usize, QueueError>;
}
