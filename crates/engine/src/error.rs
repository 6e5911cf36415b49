//! Task error taxonomy
//!
//! Handlers report failures as [`TaskError`]. Each variant belongs to an
//! [`ErrorCategory`], which drives both the executor's retry decision and the
//! [`RecoveryManager`](crate::reliability::RecoveryManager) strategy lookup.

use serde::{Deserialize, Serialize};

/// Error category used for recovery and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Rate limits, flaky network, temporarily unavailable dependency
    TransientInfrastructure,

    /// Malformed payload, unknown task type; retrying cannot help
    PermanentInput,

    /// Non-critical enrichment step that may be skipped
    BestEffortStep,

    /// Downstream dependency failing consistently
    DependencyDegraded,

    /// Anything not classified by the handler
    Unclassified,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransientInfrastructure => write!(f, "transient_infrastructure"),
            Self::PermanentInput => write!(f, "permanent_input"),
            Self::BestEffortStep => write!(f, "best_effort_step"),
            Self::DependencyDegraded => write!(f, "dependency_degraded"),
            Self::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Failure reported by a task handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum TaskError {
    #[error("transient infrastructure error: {0}")]
    TransientInfrastructure(String),

    #[error("permanent input error: {0}")]
    PermanentInput(String),

    #[error("best-effort step failed: {0}")]
    BestEffortStep(String),

    #[error("dependency degraded: {0}")]
    DependencyDegraded(String),

    /// Call rejected by an open circuit breaker
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// Handler observed cancellation and stopped early
    #[error("task cancelled: {0}")]
    Cancelled(String),

    /// Handler panicked; the panic was contained by the worker
    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

impl TaskError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientInfrastructure(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::PermanentInput(message.into())
    }

    pub fn best_effort(message: impl Into<String>) -> Self {
        Self::BestEffortStep(message.into())
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::DependencyDegraded(message.into())
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::TransientInfrastructure(_) => ErrorCategory::TransientInfrastructure,
            Self::PermanentInput(_) => ErrorCategory::PermanentInput,
            Self::BestEffortStep(_) => ErrorCategory::BestEffortStep,
            Self::DependencyDegraded(_) | Self::CircuitOpen(_) => {
                ErrorCategory::DependencyDegraded
            }
            Self::Cancelled(_) | Self::Panicked(_) | Self::Other(_) => ErrorCategory::Unclassified,
        }
    }

    /// Whether the queue may spend retry budget on this error
    pub fn is_retryable(&self) -> bool {
        self.category() != ErrorCategory::PermanentInput
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::PermanentInput(err.to_string())
    }
}

/// Readable message from a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
