//! In-memory implementation of TaskQueueBackend

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use super::backend::*;
use crate::task::{NewTask, TaskClaim, TaskId, TaskPriority, TaskRecord, TaskStatus};

/// Heap entry for a pending task
///
/// Orders by priority, then by enqueue sequence (older first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEntry {
    priority: TaskPriority,
    seq: u64,
    task_id: TaskId,
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Internal queue state, guarded by a single mutex
#[derive(Default)]
struct QueueState {
    tasks: HashMap<TaskId, TaskRecord>,
    /// May hold entries for tasks that were cancelled or pruned; those are
    /// skipped on pop.
    pending: BinaryHeap<PendingEntry>,
    next_seq: u64,
}

impl QueueState {
    fn enqueue(&mut self, task_id: TaskId, priority: TaskPriority) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(PendingEntry {
            priority,
            seq,
            task_id,
        });
    }

    fn claim_next(&mut self, worker_id: &str, now: DateTime<Utc>) -> Option<TaskRecord> {
        while let Some(entry) = self.pending.pop() {
            let Some(task) = self.tasks.get_mut(&entry.task_id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }

            task.status = TaskStatus::Processing;
            task.started_at = Some(now);
            task.worker_id = Some(worker_id.to_string());
            task.attempt += 1;
            return Some(task.clone());
        }
        None
    }

    /// Task held under `claim`, or why the claim cannot report on it
    fn held_task(
        &mut self,
        claim: &TaskClaim,
        operation: &'static str,
    ) -> Result<&mut TaskRecord, QueueError> {
        let task = self
            .tasks
            .get_mut(&claim.task_id)
            .ok_or(QueueError::NotFound(claim.task_id))?;

        if task.status != TaskStatus::Processing {
            return Err(QueueError::invalid_state(task, operation));
        }
        if !task.is_claimed_by(claim) {
            return Err(QueueError::stale_claim(claim));
        }
        Ok(task)
    }

    fn complete(
        &mut self,
        claim: &TaskClaim,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<u32, QueueError> {
        let task = self.held_task(claim, "complete")?;

        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        task.result = Some(result);
        task.error = None;
        Ok(task.retry_count)
    }

    fn fail(
        &mut self,
        claim: &TaskClaim,
        error: &str,
        retry: bool,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, QueueError> {
        let task = self.held_task(claim, "fail")?;

        task.error = Some(error.to_string());
        task.error_history.push(error.to_string());

        if retry && task.can_retry() {
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            task.started_at = None;
            task.worker_id = None;

            let retry_count = task.retry_count;
            let priority = task.priority;
            self.enqueue(claim.task_id, priority);

            Ok(FailureOutcome::WillRetry { retry_count })
        } else {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(now);
            task.result = None;
            Ok(FailureOutcome::Failed)
        }
    }
}

/// In-memory implementation of TaskQueueBackend
///
/// All transitions run under one mutex, so concurrent consumers never claim
/// the same task. Waiting consumers are woken through a [`Notify`] whenever
/// a task becomes pending.
///
/// # Example
///
/// ```
/// use utagent_engine::InMemoryTaskQueue;
///
/// let queue = InMemoryTaskQueue::new();
/// assert_eq!(queue.pending_task_count(), 0);
/// ```
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    task_available: Notify,
}

impl InMemoryTaskQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            task_available: Notify::new(),
        }
    }

    /// Number of pending tasks
    pub fn pending_task_count(&self) -> usize {
        self.state
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Number of tracked tasks in any status
    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim the next pending task for `worker_id` without waiting
    pub fn try_consume(&self, worker_id: &str) -> Option<TaskRecord> {
        let task = self.state.lock().claim_next(worker_id, Utc::now());
        if let Some(task) = &task {
            debug!(
                task_id = %task.id,
                task_type = %task.task_type,
                worker_id,
                attempt = task.attempt,
                "Task claimed"
            );
        }
        task
    }

    /// Reclaim processing tasks whose timeout elapsed before `now`
    pub fn check_timeouts_at(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut state = self.state.lock();

        let expired: Vec<TaskClaim> = state
            .tasks
            .values()
            .filter(|t| t.is_timed_out(now))
            .filter_map(TaskRecord::claim)
            .collect();

        let mut requeued = false;
        for claim in &expired {
            let task_id = claim.task_id;
            let worker_id = claim.worker_id.as_str();
            match state.fail(claim, "task timed out", true, now) {
                Ok(FailureOutcome::WillRetry { retry_count }) => {
                    requeued = true;
                    warn!(%task_id, worker_id, retry_count, "Reclaimed timed out task");
                }
                Ok(FailureOutcome::Failed) => {
                    warn!(%task_id, worker_id, "Timed out task exhausted its retries");
                }
                Err(e) => warn!(%task_id, "Timeout reclamation failed: {}", e),
            }
        }
        drop(state);

        if requeued {
            self.task_available.notify_waiters();
        }
        expired.into_iter().map(|claim| claim.task_id).collect()
    }

    /// Drop terminal tasks finished before `now - age`
    pub fn clear_completed_at(&self, age: Option<Duration>, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let before = state.tasks.len();

        state.tasks.retain(|_, task| {
            if !task.status.is_terminal() {
                return true;
            }
            let Some(age) = age else {
                return false;
            };
            let finished_for = task
                .completed_at
                .map(|at| now.signed_duration_since(at).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::ZERO);
            finished_for < age
        });

        before - state.tasks.len()
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueueBackend for InMemoryTaskQueue {
    async fn submit(&self, task: NewTask) -> Result<TaskId, QueueError> {
        let task_id = Uuid::now_v7();
        let record = TaskRecord::from_definition(task_id, task, Utc::now());
        let priority = record.priority;

        debug!(%task_id, task_type = %record.task_type, %priority, "Task submitted");

        {
            let mut state = self.state.lock();
            state.tasks.insert(task_id, record);
            state.enqueue(task_id, priority);
        }
        self.task_available.notify_waiters();

        Ok(task_id)
    }

    async fn consume(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<TaskRecord>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking, so a submit between the
            // check and the wait still wakes us.
            let notified = self.task_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_consume(worker_id) {
                return Ok(Some(task));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn complete(
        &self,
        claim: &TaskClaim,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        let retry_count = self.state.lock().complete(claim, result, Utc::now())?;

        debug!(task_id = %claim.task_id, worker_id = %claim.worker_id, retry_count, "Task completed");
        Ok(())
    }

    async fn fail(
        &self,
        claim: &TaskClaim,
        error: &str,
        retry: bool,
    ) -> Result<FailureOutcome, QueueError> {
        let outcome = self.state.lock().fail(claim, error, retry, Utc::now())?;
        let task_id = claim.task_id;

        match outcome {
            FailureOutcome::WillRetry { retry_count } => {
                debug!(%task_id, retry_count, "Task requeued for retry");
                self.task_available.notify_waiters();
            }
            FailureOutcome::Failed => {
                debug!(%task_id, error, "Task failed");
            }
        }

        Ok(outcome)
    }

    async fn cancel(&self, task_id: TaskId) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(QueueError::NotFound(task_id))?;

        if task.status.is_terminal() {
            return Err(QueueError::invalid_state(task, "cancel"));
        }

        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        task.result = None;
        task.error = Some("cancelled".to_string());

        debug!(%task_id, "Task cancelled");
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, QueueError> {
        Ok(self.state.lock().tasks.get(&task_id).cloned())
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, QueueError> {
        let state = self.state.lock();
        let mut tasks: Vec<_> = state
            .tasks
            .values()
            .filter(|t| status.map_or(true, |wanted| wanted == t.status))
            .cloned()
            .collect();

        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn list_pending_tasks(&self) -> Result<Vec<TaskRecord>, QueueError> {
        let state = self.state.lock();
        let mut entries = state.pending.clone().into_sorted_vec();
        entries.reverse();

        Ok(entries
            .into_iter()
            .filter_map(|entry| state.tasks.get(&entry.task_id))
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect())
    }

    async fn check_timeouts(&self) -> Result<Vec<TaskId>, QueueError> {
        Ok(self.check_timeouts_at(Utc::now()))
    }

    async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock();
        let mut stats = QueueStats::default();
        for task in state.tasks.values() {
            stats.record(task.status);
        }
        Ok(stats)
    }

    async fn clear_completed(&self, age: Option<Duration>) -> Result<usize, QueueError> {
        let cleared = self.clear_completed_at(age, Utc::now());
        if cleared > 0 {
            debug!(cleared, "Pruned terminal tasks");
        }
        Ok(cleared)
    }
}
