//! Error recovery strategies
//!
//! A [`RecoveryManager`] maps each [`ErrorCategory`] to a
//! [`RecoveryStrategy`] and turns a failure into a [`RecoveryOutcome`]:
//!
//! | category | default strategy |
//! |---|---|
//! | transient infrastructure | retry with backoff |
//! | dependency degraded | fallback producer |
//! | best-effort step | skip |
//! | permanent input, unclassified | abort |

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::RetryPolicy;
use crate::error::{ErrorCategory, TaskError};

/// What to do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    Skip,
    Abort,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Fallback => write!(f, "fallback"),
            Self::Skip => write!(f, "skip"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Result of applying recovery to an operation
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome<T> {
    /// Operation succeeded
    Success(T),

    /// Operation should be attempted again after `delay`
    Retry { attempt: u32, delay: Duration },

    /// A fallback producer supplied the value
    Fallback(T),

    /// Failure swallowed
    Skipped,

    /// Unrecoverable; carries the error to surface
    Failed(TaskError),
}

impl<T> RecoveryOutcome<T> {
    /// Whether the caller ends up with a usable result
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Fallback(_) | Self::Skipped)
    }

    /// Collapse into a result; `Skipped` becomes `Ok(None)`
    pub fn into_result(self) -> Result<Option<T>, TaskError> {
        match self {
            Self::Success(value) | Self::Fallback(value) => Ok(Some(value)),
            Self::Skipped => Ok(None),
            Self::Failed(error) => Err(error),
            Self::Retry { attempt, delay } => Err(TaskError::transient(format!(
                "retry {} pending in {}ms",
                attempt,
                delay.as_millis()
            ))),
        }
    }
}

/// One step taken while recovering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    StrategySelected {
        category: ErrorCategory,
        strategy: RecoveryStrategy,
    },
    RetryScheduled {
        attempt: u32,
        #[serde(with = "crate::serde_duration::millis")]
        delay: Duration,
    },
    RetriesExhausted {
        attempts: u32,
    },
    FallbackExecuted,
    FallbackFailed {
        error: String,
    },
    NoFallbackRegistered,
    Skipped,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub action: RecoveryAction,
    /// Error being recovered from
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Ordered log of recovery steps for one call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryHistory {
    pub events: Vec<RecoveryEvent>,
}

impl RecoveryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, action: RecoveryAction, error: &TaskError) {
        self.events.push(RecoveryEvent {
            action,
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    /// Number of retries scheduled
    pub fn retries(&self) -> u32 {
        self.events
            .iter()
            .filter(|e| matches!(e.action, RecoveryAction::RetryScheduled { .. }))
            .count() as u32
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Producer of a substitute value for a failed operation
pub type FallbackFn<T> = Arc<dyn Fn(&TaskError) -> Result<T, TaskError> + Send + Sync>;

/// Category-driven recovery policy
///
/// # Example
///
/// ```
/// use utagent_engine::{ErrorCategory, RecoveryManager, RecoveryOutcome, TaskError};
///
/// # tokio_test::block_on(async {
/// let manager = RecoveryManager::new()
///     .with_fallback(ErrorCategory::DependencyDegraded, |_err| Ok("cached".to_string()));
///
/// let outcome = manager
///     .run(|| async { Err(TaskError::degraded("llm provider down")) })
///     .await;
///
/// assert_eq!(outcome, RecoveryOutcome::Fallback("cached".to_string()));
/// # });
/// ```
pub struct RecoveryManager<T> {
    policy: RetryPolicy,
    strategies: HashMap<ErrorCategory, RecoveryStrategy>,
    fallbacks: HashMap<ErrorCategory, FallbackFn<T>>,
}

impl<T> RecoveryManager<T> {
    /// Manager with the default strategy table and exponential backoff
    pub fn new() -> Self {
        let strategies = HashMap::from([
            (
                ErrorCategory::TransientInfrastructure,
                RecoveryStrategy::Retry,
            ),
            (ErrorCategory::DependencyDegraded, RecoveryStrategy::Fallback),
            (ErrorCategory::BestEffortStep, RecoveryStrategy::Skip),
            (ErrorCategory::PermanentInput, RecoveryStrategy::Abort),
            (ErrorCategory::Unclassified, RecoveryStrategy::Abort),
        ]);

        Self {
            policy: RetryPolicy::exponential(),
            strategies,
            fallbacks: HashMap::new(),
        }
    }

    /// Manager with no strategies; every error aborts until registered
    pub fn empty() -> Self {
        Self {
            policy: RetryPolicy::exponential(),
            strategies: HashMap::new(),
            fallbacks: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_strategy(mut self, category: ErrorCategory, strategy: RecoveryStrategy) -> Self {
        self.register_strategy(category, strategy);
        self
    }

    pub fn with_fallback<F>(mut self, category: ErrorCategory, fallback: F) -> Self
    where
        F: Fn(&TaskError) -> Result<T, TaskError> + Send + Sync + 'static,
    {
        self.register_fallback(category, fallback);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn register_strategy(&mut self, category: ErrorCategory, strategy: RecoveryStrategy) {
        self.strategies.insert(category, strategy);
    }

    pub fn register_fallback<F>(&mut self, category: ErrorCategory, fallback: F)
    where
        F: Fn(&TaskError) -> Result<T, TaskError> + Send + Sync + 'static,
    {
        self.fallbacks.insert(category, Arc::new(fallback));
    }

    /// Strategy for an error; unmapped categories abort
    pub fn strategy_for(&self, error: &TaskError) -> RecoveryStrategy {
        self.strategies
            .get(&error.category())
            .copied()
            .unwrap_or(RecoveryStrategy::Abort)
    }

    /// Decide what to do about `error`
    ///
    /// `retries_done` is how many retries were already made for this call.
    pub fn recover(
        &self,
        error: TaskError,
        retries_done: u32,
        history: &mut RecoveryHistory,
    ) -> RecoveryOutcome<T> {
        let category = error.category();
        let strategy = self.strategy_for(&error);
        history.push(
            RecoveryAction::StrategySelected { category, strategy },
            &error,
        );
        debug!(%category, %strategy, retries_done, "Recovery strategy selected");

        match strategy {
            RecoveryStrategy::Retry => {
                if retries_done >= self.policy.max_retries() || !self.policy.should_retry(&error) {
                    warn!(%category, attempts = retries_done + 1, "Retries exhausted: {}", error);
                    history.push(
                        RecoveryAction::RetriesExhausted {
                            attempts: retries_done + 1,
                        },
                        &error,
                    );
                    return RecoveryOutcome::Failed(error);
                }

                let attempt = retries_done + 1;
                let delay = self.policy.delay_for_retry(attempt);
                history.push(RecoveryAction::RetryScheduled { attempt, delay }, &error);
                info!(attempt, delay_ms = delay.as_millis() as u64, "Retrying after error: {}", error);
                RecoveryOutcome::Retry { attempt, delay }
            }
            RecoveryStrategy::Fallback => match self.fallbacks.get(&category) {
                Some(fallback) => match fallback(&error) {
                    Ok(value) => {
                        history.push(RecoveryAction::FallbackExecuted, &error);
                        info!(%category, "Fallback produced a result");
                        RecoveryOutcome::Fallback(value)
                    }
                    Err(fallback_error) => {
                        warn!(%category, "Fallback failed: {}", fallback_error);
                        history.push(
                            RecoveryAction::FallbackFailed {
                                error: fallback_error.to_string(),
                            },
                            &error,
                        );
                        RecoveryOutcome::Failed(fallback_error)
                    }
                },
                None => {
                    history.push(RecoveryAction::NoFallbackRegistered, &error);
                    RecoveryOutcome::Failed(error)
                }
            },
            RecoveryStrategy::Skip => {
                warn!(%category, "Skipping failed step: {}", error);
                history.push(RecoveryAction::Skipped, &error);
                RecoveryOutcome::Skipped
            }
            RecoveryStrategy::Abort => {
                history.push(RecoveryAction::Aborted, &error);
                RecoveryOutcome::Failed(error)
            }
        }
    }

    /// Run `op`, retrying and recovering until a final outcome
    ///
    /// Never returns [`RecoveryOutcome::Retry`].
    pub async fn run<F, Fut>(&self, op: F) -> RecoveryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        self.run_traced(op).await.0
    }

    /// [`run`](Self::run), also returning every recovery step taken
    pub async fn run_traced<F, Fut>(&self, mut op: F) -> (RecoveryOutcome<T>, RecoveryHistory)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let mut history = RecoveryHistory::new();
        let mut retries_done = 0;

        loop {
            let error = match op().await {
                Ok(value) => return (RecoveryOutcome::Success(value), history),
                Err(error) => error,
            };

            match self.recover(error, retries_done, &mut history) {
                RecoveryOutcome::Retry { attempt, delay } => {
                    tokio::time::sleep(delay).await;
                    retries_done = attempt;
                }
                outcome => return (outcome, history),
            }
        }
    }
}

impl<T> Default for RecoveryManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for RecoveryManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut fallbacks: Vec<_> = self.fallbacks.keys().collect();
        fallbacks.sort_by_key(|c| c.to_string());
        f.debug_struct("RecoveryManager")
            .field("policy", &self.policy)
            .field("strategies", &self.strategies)
            .field("fallbacks", &fallbacks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manager() -> RecoveryManager<String> {
        RecoveryManager::new().with_policy(
            RetryPolicy::exponential()
                .with_max_retries(3)
                .with_jitter(0.0),
        )
    }

    #[test]
    fn test_default_strategies() {
        let manager = manager();
        assert_eq!(
            manager.strategy_for(&TaskError::transient("x")),
            RecoveryStrategy::Retry
        );
        assert_eq!(
            manager.strategy_for(&TaskError::degraded("x")),
            RecoveryStrategy::Fallback
        );
        assert_eq!(
            manager.strategy_for(&TaskError::best_effort("x")),
            RecoveryStrategy::Skip
        );
        assert_eq!(
            manager.strategy_for(&TaskError::permanent("x")),
            RecoveryStrategy::Abort
        );
        assert_eq!(
            manager.strategy_for(&TaskError::other("x")),
            RecoveryStrategy::Abort
        );
    }

    #[test]
    fn test_unmapped_category_aborts() {
        let manager = RecoveryManager::<String>::empty();
        let mut history = RecoveryHistory::new();
        let outcome = manager.recover(TaskError::transient("429"), 0, &mut history);
        assert_eq!(outcome, RecoveryOutcome::Failed(TaskError::transient("429")));
    }

    #[test]
    fn test_retry_delays_double() {
        let manager = manager();
        let mut history = RecoveryHistory::new();

        let delays: Vec<_> = (0..3)
            .map(|done| match manager.recover(TaskError::transient("429"), done, &mut history) {
                RecoveryOutcome::Retry { delay, .. } => delay,
                other => panic!("expected retry, got {:?}", other),
            })
            .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(history.retries(), 3);
    }

    #[test]
    fn test_retry_exhaustion_surfaces_original_error() {
        let manager = manager();
        let mut history = RecoveryHistory::new();
        let outcome = manager.recover(TaskError::transient("still 429"), 3, &mut history);
        assert_eq!(
            outcome,
            RecoveryOutcome::Failed(TaskError::transient("still 429"))
        );
        assert!(matches!(
            history.events.last().map(|e| &e.action),
            Some(RecoveryAction::RetriesExhausted { attempts: 4 })
        ));
    }

    #[test]
    fn test_fallback_failure_becomes_outcome() {
        let manager = manager().with_fallback(ErrorCategory::DependencyDegraded, |_| {
            Err(TaskError::other("cache empty"))
        });
        let mut history = RecoveryHistory::new();
        let outcome = manager.recover(TaskError::degraded("llm down"), 0, &mut history);
        assert_eq!(outcome, RecoveryOutcome::Failed(TaskError::other("cache empty")));
    }

    #[test]
    fn test_fallback_without_producer_fails_with_original() {
        let manager = manager();
        let mut history = RecoveryHistory::new();
        let outcome = manager.recover(TaskError::degraded("llm down"), 0, &mut history);
        assert_eq!(outcome, RecoveryOutcome::Failed(TaskError::degraded("llm down")));
    }

    #[test]
    fn test_skip() {
        let manager = manager();
        let mut history = RecoveryHistory::new();
        let outcome = manager.recover(TaskError::best_effort("lint failed"), 0, &mut history);
        assert_eq!(outcome, RecoveryOutcome::Skipped);
        assert_eq!(outcome.into_result(), Ok(None));
    }

    #[test]
    fn test_custom_strategy_overrides_default() {
        let manager = manager().with_strategy(ErrorCategory::BestEffortStep, RecoveryStrategy::Abort);
        let mut history = RecoveryHistory::new();
        let outcome = manager.recover(TaskError::best_effort("x"), 0, &mut history);
        assert!(matches!(outcome, RecoveryOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_until_success() {
        let manager = manager();
        let calls = AtomicU32::new(0);

        let (outcome, history) = manager
            .run_traced(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TaskError::transient("rate limited"))
                } else {
                    Ok("generated".to_string())
                }
            })
            .await;

        assert_eq!(outcome, RecoveryOutcome::Success("generated".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(history.retries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_budget() {
        let manager = manager();
        let calls = AtomicU32::new(0);

        let outcome = manager
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(TaskError::transient("down"))
            })
            .await;

        assert!(matches!(outcome, RecoveryOutcome::Failed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_run_aborts_permanent_errors_immediately() {
        let manager = manager();
        let calls = AtomicU32::new(0);

        let outcome = manager
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(TaskError::permanent("bad source file"))
            })
            .await;

        assert_eq!(
            outcome,
            RecoveryOutcome::Failed(TaskError::permanent("bad source file"))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
