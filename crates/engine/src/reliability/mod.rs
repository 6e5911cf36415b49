//! Reliability patterns for task execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Fixed or exponential backoff with jitter
//! - [`RecoveryManager`] - Maps error categories to retry, fallback, skip or abort
//! - [`CircuitBreaker`] - Stops calling a failing dependency for a cooldown

mod circuit_breaker;
mod recovery;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerSnapshot,
    CircuitPermit, CircuitState,
};
pub use recovery::{
    FallbackFn, RecoveryAction, RecoveryEvent, RecoveryHistory, RecoveryManager, RecoveryOutcome,
    RecoveryStrategy,
};
pub use retry::RetryPolicy;
