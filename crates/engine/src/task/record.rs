//! Task record and its lifecycle types

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task identifier (UUID v7, sortable by submission time)
pub type TaskId = Uuid;

/// Task priority
///
/// Higher priorities always dequeue first. Ordering follows declaration order,
/// so `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// All tiers, lowest first
    pub const ALL: [TaskPriority; 4] = [Self::Low, Self::Normal, Self::High, Self::Critical];
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Task status
///
/// ```text
/// ┌─────────┐  consume   ┌────────────┐  complete  ┌───────────┐
/// │ Pending │ ─────────► │ Processing │ ─────────► │ Completed │
/// └─────────┘            └────────────┘            └───────────┘
///      ▲                    │      │
///      │   fail (retry)     │      │ fail (no retry / exhausted)
///      └────────────────────┘      ▼
///                              ┌────────┐
///                              │ Failed │
///                              └────────┘
/// any non-terminal ──cancel──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed
    Pending,

    /// Claimed by a worker
    Processing,

    /// Finished successfully
    Completed,

    /// Finished with an error and no retry budget left
    Failed,

    /// Cancelled before finishing
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Definition of a task to be submitted
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Task type name, resolves to a registered handler
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub max_retries: u32,
    pub timeout: Option<Duration>,
}

impl NewTask {
    /// Create a task definition with default options
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::with_options(task_type, payload, SubmitOptions::default())
    }

    /// Create a task definition from explicit submit options
    pub fn with_options(
        task_type: impl Into<String>,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: options.priority,
            max_retries: options.max_retries,
            timeout: options.timeout,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Options accepted by `submit`
///
/// # Example
///
/// ```
/// use utagent_engine::task::{SubmitOptions, TaskPriority};
/// use std::time::Duration;
///
/// let options = SubmitOptions::default()
///     .with_priority(TaskPriority::High)
///     .with_timeout(Duration::from_secs(30));
///
/// assert_eq!(options.max_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    pub priority: TaskPriority,
    pub max_retries: u32,
    #[serde(with = "crate::serde_duration::option_millis")]
    pub timeout: Option<Duration>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            priority: TaskPriority::Normal,
            max_retries: 3,
            timeout: None,
        }
    }
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Proof of holding a task, handed out by `consume`
///
/// Outcomes must be reported under the claim the task was consumed with.
/// Once a task is reclaimed and consumed again, the older claim is stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskClaim {
    pub task_id: TaskId,
    pub worker_id: String,
    pub attempt: u32,
}

/// A unit of work tracked by the queue
///
/// Only the queue mutates records. Workers receive a snapshot when they
/// consume a task and report the outcome back through the queue API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    /// Worker holding the current claim; cleared when the task is requeued
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Number of times the task has been claimed
    #[serde(default)]
    pub attempt: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(with = "crate::serde_duration::option_millis")]
    pub timeout: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    /// Most recent failure message
    pub error: Option<String>,
    /// Every failure message, oldest first
    #[serde(default)]
    pub error_history: Vec<String>,
}

impl TaskRecord {
    /// Build a fresh pending record from a definition
    pub fn from_definition(id: TaskId, task: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_type: task.task_type,
            payload: task.payload,
            priority: task.priority,
            status: TaskStatus::Pending,
            worker_id: None,
            attempt: 0,
            retry_count: 0,
            max_retries: task.max_retries,
            timeout: task.timeout,
            created_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            error_history: vec![],
        }
    }

    /// Claim held on a processing task
    pub fn claim(&self) -> Option<TaskClaim> {
        if self.status != TaskStatus::Processing {
            return None;
        }
        self.worker_id.as_ref().map(|worker_id| TaskClaim {
            task_id: self.id,
            worker_id: worker_id.clone(),
            attempt: self.attempt,
        })
    }

    /// Whether `claim` is the claim currently held on this task
    pub fn is_claimed_by(&self, claim: &TaskClaim) -> bool {
        self.id == claim.task_id
            && self.attempt == claim.attempt
            && self.worker_id.as_deref() == Some(claim.worker_id.as_str())
    }

    /// Whether another retry fits in the budget
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether a processing task has run longer than its timeout at `now`
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Processing {
            return false;
        }

        match (self.timeout, self.started_at) {
            (Some(timeout), Some(started_at)) => {
                let elapsed = now
                    .signed_duration_since(started_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                elapsed > timeout
            }
            _ => false,
        }
    }
}
