//! Circuit breaker for degraded dependencies

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::ConfigError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold reached - all calls rejected
    Open,

    /// Probing whether the dependency recovered - limited trial calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure_threshold  ┌─────────┐  recovery_timeout  ┌──────────┐
/// │ Closed  │ ──────────────────► │  Open   │ ─────────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘ ◄───── failure ─── └──────────┘
///      ▲                                                              │
///      │                half_open_requests successes                 │
///      └──────────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use utagent_engine::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(3)
///     .with_recovery_timeout(Duration::from_secs(30));
///
/// assert_eq!(config.half_open_requests, 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Time after the last failure before trial calls are let through
    #[serde(with = "crate::serde_duration::millis")]
    pub recovery_timeout: Duration,

    /// Concurrent trial calls in half-open, and the successes needed to close
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_requests: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_half_open_requests(mut self, requests: u32) -> Self {
        self.half_open_requests = requests;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "failure_threshold",
                "must be at least 1",
            ));
        }
        if self.half_open_requests == 0 {
            return Err(ConfigError::invalid(
                "half_open_requests",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Error returned by [`CircuitBreaker::call`] and [`CircuitBreaker::allow`]
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E = std::convert::Infallible> {
    /// Circuit is open, the call was not made
    #[error("circuit breaker is open")]
    Open,

    /// Circuit is half-open and every trial slot is taken
    #[error("circuit breaker half-open, no permits available")]
    HalfOpenExhausted,

    /// The call was made and failed
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the breaker rejected the call without making it
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open | Self::HalfOpenExhausted)
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_successes: u32,
    half_open_in_flight: u32,
    /// Bumped on every state transition so permits from an earlier state
    /// cannot move the current one.
    epoch: u64,
}

impl BreakerState {
    fn closed(epoch: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            half_open_successes: 0,
            half_open_in_flight: 0,
            epoch,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.half_open_successes = 0;
        self.half_open_in_flight = 0;
        self.epoch += 1;
    }
}

/// In-process circuit breaker guarding one dependency
///
/// Open transitions to half-open lazily, on the first observation after
/// `recovery_timeout` has elapsed since the last failure.
///
/// # Example
///
/// ```
/// use utagent_engine::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
///
/// # tokio_test::block_on(async {
/// let breaker = CircuitBreaker::new("llm", CircuitBreakerConfig::default());
///
/// let result: Result<u32, CircuitBreakerError<String>> =
///     breaker.call(|| async { Ok(42) }).await;
/// assert_eq!(result.unwrap(), 42);
///
/// // Manual protocol for calls that cannot be wrapped in a closure
/// match breaker.allow() {
///     Ok(permit) => permit.success(),
///     Err(rejection) => panic!("unexpected rejection: {rejection}"),
/// };
/// # });
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            state: Mutex::new(BreakerState::closed(0)),
        }
    }

    /// Name of the guarded dependency
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying a pending open -> half-open transition
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        state.state
    }

    /// Whether a call would currently be let through
    pub fn is_available(&self) -> bool {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => state.half_open_in_flight < self.config.half_open_requests,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        CircuitBreakerSnapshot {
            key: self.key.clone(),
            state: state.state,
            failure_count: state.failure_count,
            half_open_successes: state.half_open_successes,
        }
    }

    /// Ask to make a call
    ///
    /// The returned permit must be resolved with `success()` or `failure()`.
    /// Dropping it unresolved releases its half-open trial slot without
    /// counting an outcome.
    pub fn allow(&self) -> Result<CircuitPermit<'_>, CircuitBreakerError> {
        let mut state = self.state.lock();
        self.refresh(&mut state);

        match state.state {
            CircuitState::Closed => Ok(CircuitPermit::new(self, state.epoch, false)),
            CircuitState::Open => Err(CircuitBreakerError::Open),
            CircuitState::HalfOpen => {
                if state.half_open_in_flight >= self.config.half_open_requests {
                    return Err(CircuitBreakerError::HalfOpenExhausted);
                }
                state.half_open_in_flight += 1;
                Ok(CircuitPermit::new(self, state.epoch, true))
            }
        }
    }

    /// Run `f` under the breaker
    ///
    /// Rejected calls never invoke `f`.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = match self.allow() {
            Ok(permit) => permit,
            Err(CircuitBreakerError::Open) => return Err(CircuitBreakerError::Open),
            Err(CircuitBreakerError::HalfOpenExhausted) => {
                return Err(CircuitBreakerError::HalfOpenExhausted)
            }
            Err(CircuitBreakerError::Inner(never)) => match never {},
        };

        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let epoch = state.epoch + 1;
        *state = BreakerState::closed(epoch);
        info!(breaker = %self.key, "Circuit breaker reset");
    }

    fn refresh(&self, state: &mut BreakerState) {
        if state.state != CircuitState::Open {
            return;
        }

        let cooled_down = state
            .last_failure
            .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout);

        if cooled_down {
            state.transition(CircuitState::HalfOpen);
            info!(breaker = %self.key, "Circuit breaker half-open, allowing trial calls");
        }
    }

    fn record_success(&self, epoch: u64, trial: bool) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return;
        }

        match state.state {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {
                if trial {
                    state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                }
                state.half_open_successes += 1;
                if state.half_open_successes >= self.config.half_open_requests {
                    state.transition(CircuitState::Closed);
                    state.failure_count = 0;
                    state.last_failure = None;
                    info!(breaker = %self.key, "Circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return;
        }

        state.failure_count += 1;
        state.last_failure = Some(Instant::now());

        match state.state {
            CircuitState::HalfOpen => {
                state.transition(CircuitState::Open);
                warn!(breaker = %self.key, "Trial call failed, circuit breaker reopened");
            }
            CircuitState::Closed if state.failure_count >= self.config.failure_threshold => {
                state.transition(CircuitState::Open);
                warn!(
                    breaker = %self.key,
                    failure_count = state.failure_count,
                    "Circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    fn release(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch == epoch && state.state == CircuitState::HalfOpen {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// Permit for one call through a [`CircuitBreaker`]
#[must_use = "resolve the permit with success() or failure()"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    trial: bool,
    resolved: bool,
}

impl<'a> CircuitPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, epoch: u64, trial: bool) -> Self {
        Self {
            breaker,
            epoch,
            trial,
            resolved: false,
        }
    }

    /// Report the call succeeded
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success(self.epoch, self.trial);
    }

    /// Report the call failed
    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure(self.epoch);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release(self.epoch);
        }
    }
}
