//! Handler adapters
//!
//! Wrap a [`TaskHandler`] to offload it to the adaptive thread pool, guard
//! it with a circuit breaker, or drive it through a recovery manager.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::handler::{TaskContext, TaskHandler};
use crate::error::{ErrorCategory, TaskError};
use crate::pool::{AdaptiveThreadPool, PoolError};
use crate::reliability::{CircuitBreaker, RecoveryManager, RecoveryOutcome};
use crate::task::TaskRecord;

/// Runs a blocking closure on the adaptive thread pool
///
/// Pool rejections and shutdown surface as transient errors so the queue
/// retries the task later.
pub struct BlockingHandler<F> {
    pool: Arc<AdaptiveThreadPool>,
    f: Arc<F>,
}

impl<F> BlockingHandler<F>
where
    F: Fn(TaskRecord) -> Result<Value, TaskError> + Send + Sync + 'static,
{
    pub fn new(pool: Arc<AdaptiveThreadPool>, f: F) -> Self {
        Self {
            pool,
            f: Arc::new(f),
        }
    }
}

#[async_trait]
impl<F> TaskHandler for BlockingHandler<F>
where
    F: Fn(TaskRecord) -> Result<Value, TaskError> + Send + Sync + 'static,
{
    async fn handle(&self, task: &TaskRecord, _ctx: &TaskContext) -> Result<Value, TaskError> {
        let f = Arc::clone(&self.f);
        let owned = task.clone();

        let handle = match self.pool.submit(move || f(owned)) {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                return Err(TaskError::transient("thread pool queue is full"));
            }
            Err(e) => return Err(TaskError::transient(e.to_string())),
        };

        match handle.await {
            Ok(result) => result,
            Err(PoolError::TaskPanicked(message)) => Err(TaskError::Panicked(message)),
            Err(e) => Err(TaskError::transient(e.to_string())),
        }
    }
}

/// Guards a handler with a circuit breaker
///
/// Rejected calls fail with [`TaskError::CircuitOpen`] without running the
/// handler. Permanent input errors say nothing about the dependency and are
/// not counted as failures.
pub struct CircuitBreakerHandler<H> {
    inner: H,
    breaker: Arc<CircuitBreaker>,
}

impl<H: TaskHandler> CircuitBreakerHandler<H> {
    pub fn new(inner: H, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl<H: TaskHandler> TaskHandler for CircuitBreakerHandler<H> {
    async fn handle(&self, task: &TaskRecord, ctx: &TaskContext) -> Result<Value, TaskError> {
        let permit = match self.breaker.allow() {
            Ok(permit) => permit,
            Err(e) => {
                debug!(breaker = %self.breaker.key(), task_id = %task.id, "Call rejected: {}", e);
                return Err(TaskError::CircuitOpen(self.breaker.key().to_string()));
            }
        };

        match self.inner.handle(task, ctx).await {
            Ok(output) => {
                permit.success();
                Ok(output)
            }
            Err(error) if error.category() == ErrorCategory::PermanentInput => {
                drop(permit);
                Err(error)
            }
            Err(error) => {
                permit.failure();
                Err(error)
            }
        }
    }
}

/// Drives a handler through a [`RecoveryManager`]
///
/// Retries happen in place, inside one task execution. Skipped failures
/// complete the task with `null`.
pub struct RecoveringHandler<H> {
    inner: H,
    manager: Arc<RecoveryManager<Value>>,
}

impl<H: TaskHandler> RecoveringHandler<H> {
    pub fn new(inner: H, manager: Arc<RecoveryManager<Value>>) -> Self {
        Self { inner, manager }
    }
}

#[async_trait]
impl<H: TaskHandler> TaskHandler for RecoveringHandler<H> {
    async fn handle(&self, task: &TaskRecord, ctx: &TaskContext) -> Result<Value, TaskError> {
        let inner = &self.inner;
        let (outcome, history) = self
            .manager
            .run_traced(move || inner.handle(task, ctx))
            .await;

        if history.retries() > 0 {
            debug!(task_id = %task.id, retries = history.retries(), "Recovered in place");
        }

        match outcome {
            RecoveryOutcome::Success(value) | RecoveryOutcome::Fallback(value) => Ok(value),
            RecoveryOutcome::Skipped => {
                warn!(task_id = %task.id, task_type = %task.task_type, "Failure skipped");
                Ok(Value::Null)
            }
            other => other.into_result().map(|value| value.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::AdaptivePoolConfig;
    use crate::reliability::{CircuitBreakerConfig, CircuitState, RetryPolicy};
    use crate::task::NewTask;
    use crate::worker::FnHandler;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn record(payload: Value) -> TaskRecord {
        TaskRecord::from_definition(
            Uuid::now_v7(),
            NewTask::new("guarded", payload),
            Utc::now(),
        )
    }

    fn ctx() -> TaskContext {
        TaskContext::new("worker-test", CancellationToken::new())
    }

    #[tokio::test]
    async fn test_blocking_handler_runs_on_pool() {
        let pool = Arc::new(AdaptiveThreadPool::new(AdaptivePoolConfig::default()).unwrap());
        let handler = BlockingHandler::new(Arc::clone(&pool), |task: TaskRecord| {
            let thread = std::thread::current();
            Ok(serde_json::json!({
                "lines": task.payload["source"].as_str().map(|s| s.lines().count()),
                "pool_thread": thread.name().map(|n| n.starts_with("utagent-pool")),
            }))
        });

        let output = handler
            .handle(&record(serde_json::json!({"source": "fn a() {}\nfn b() {}"})), &ctx())
            .await
            .unwrap();
        assert_eq!(output["lines"], 2);
        assert_eq!(output["pool_thread"], true);

        pool.shutdown(false);
    }

    #[tokio::test]
    async fn test_blocking_handler_panic_is_reported() {
        let pool = Arc::new(AdaptiveThreadPool::new(AdaptivePoolConfig::default()).unwrap());
        let handler = BlockingHandler::new(Arc::clone(&pool), |_task: TaskRecord| {
            if true {
                panic!("stack overflow in parser");
            }
            Ok(Value::Null)
        });

        let err = handler
            .handle(&record(Value::Null), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::Panicked("stack overflow in parser".into()));

        pool.shutdown(false);
    }

    #[tokio::test]
    async fn test_blocking_handler_after_shutdown_is_transient() {
        let pool = Arc::new(AdaptiveThreadPool::new(AdaptivePoolConfig::default()).unwrap());
        pool.shutdown(false);

        let handler = BlockingHandler::new(Arc::clone(&pool), |_task: TaskRecord| Ok(Value::Null));
        let err = handler
            .handle(&record(Value::Null), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::TransientInfrastructure);
    }

    #[tokio::test]
    async fn test_circuit_breaker_handler_opens_and_rejects() {
        let calls = Arc::new(AtomicU32::new(0));
        let breaker = Arc::new(CircuitBreaker::new(
            "llm",
            CircuitBreakerConfig::default().with_failure_threshold(2),
        ));
        let handler = {
            let calls = Arc::clone(&calls);
            CircuitBreakerHandler::new(
                FnHandler::new(move |_, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TaskError::degraded("provider 503")) }
                }),
                Arc::clone(&breaker),
            )
        };

        for _ in 0..2 {
            let err = handler.handle(&record(Value::Null), &ctx()).await.unwrap_err();
            assert_eq!(err, TaskError::degraded("provider 503"));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = handler.handle(&record(Value::Null), &ctx()).await.unwrap_err();
        assert_eq!(err, TaskError::CircuitOpen("llm".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_circuit_breaker_ignores_permanent_errors() {
        let breaker = Arc::new(CircuitBreaker::new(
            "parser",
            CircuitBreakerConfig::default().with_failure_threshold(1),
        ));
        let handler = CircuitBreakerHandler::new(
            FnHandler::new(|_, _| async { Err(TaskError::permanent("bad payload")) }),
            Arc::clone(&breaker),
        );

        for _ in 0..3 {
            handler.handle(&record(Value::Null), &ctx()).await.unwrap_err();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovering_handler_retries_in_place() {
        let attempts = Arc::new(AtomicU32::new(0));
        let handler = {
            let attempts = Arc::clone(&attempts);
            RecoveringHandler::new(
                FnHandler::new(move |_, _| {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(TaskError::transient("rate limited"))
                        } else {
                            Ok(serde_json::json!("generated"))
                        }
                    }
                }),
                Arc::new(RecoveryManager::new().with_policy(RetryPolicy::fixed(
                    Duration::from_millis(10),
                    3,
                ))),
            )
        };

        let output = handler.handle(&record(Value::Null), &ctx()).await.unwrap();
        assert_eq!(output, serde_json::json!("generated"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recovering_handler_skips_best_effort() {
        let handler = RecoveringHandler::new(
            FnHandler::new(|_, _| async { Err(TaskError::best_effort("lint step failed")) }),
            Arc::new(RecoveryManager::new()),
        );

        let output = handler.handle(&record(Value::Null), &ctx()).await.unwrap();
        assert_eq!(output, Value::Null);
    }

    #[tokio::test]
    async fn test_recovering_handler_aborts_permanent() {
        let handler = RecoveringHandler::new(
            FnHandler::new(|_, _| async { Err(TaskError::permanent("unsupported language")) }),
            Arc::new(RecoveryManager::new()),
        );

        let err = handler.handle(&record(Value::Null), &ctx()).await.unwrap_err();
        assert_eq!(err, TaskError::permanent("unsupported language"));
    }
}
