//! Built-in handlers registered in every worker process
//!
//! Analyzers, LLM calls and reporters register their own handlers; these
//! cover liveness checks and cheap source statistics.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use utagent_engine::pool::AdaptiveThreadPool;
use utagent_engine::reliability::{CircuitBreaker, RecoveryManager};
use utagent_engine::worker::{
    BlockingHandler, CircuitBreakerHandler, Executor, ExecutorError, RecoveringHandler,
};
use utagent_engine::{EngineConfig, TaskError, TaskRecord};

pub const PING: &str = "ping";
pub const SOURCE_STATS: &str = "source_stats";

#[derive(Debug, Deserialize)]
struct SourceStatsInput {
    #[serde(default)]
    path: Option<String>,
    source: String,
}

/// Line-level statistics for one source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub path: Option<String>,
    pub lines: usize,
    pub blank_lines: usize,
    pub functions: usize,
    pub test_functions: usize,
}

pub fn source_stats(path: Option<String>, source: &str) -> SourceStats {
    let mut stats = SourceStats {
        path,
        lines: 0,
        blank_lines: 0,
        functions: 0,
        test_functions: 0,
    };
    let mut pending_test_attr = false;

    for line in source.lines() {
        stats.lines += 1;
        let line = line.trim();
        if line.is_empty() {
            stats.blank_lines += 1;
            continue;
        }

        if line.starts_with("#[test]") || line.starts_with("#[tokio::test") {
            pending_test_attr = true;
            continue;
        }

        if is_fn_item(line) {
            stats.functions += 1;
            if pending_test_attr {
                stats.test_functions += 1;
            }
        }
        if !line.starts_with("#[") {
            pending_test_attr = false;
        }
    }

    stats
}

fn is_fn_item(line: &str) -> bool {
    let mut rest = line;
    for prefix in ["pub(crate) ", "pub ", "const ", "async ", "unsafe "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
        }
    }
    rest.starts_with("fn ")
}

/// Shared state of the registered built-in handlers
#[derive(Debug, Clone)]
pub struct Builtins {
    /// Guards `source_stats` offloading to the thread pool
    pub pool_breaker: Arc<CircuitBreaker>,
}

/// Register the built-in handlers
///
/// `source_stats` runs on the thread pool behind a circuit breaker.
/// Transient failures such as a saturated pool are retried in place per
/// `config.retry`; an open breaker fails the attempt at once.
pub fn register_builtin(
    executor: &Executor,
    pool: Arc<AdaptiveThreadPool>,
    config: &EngineConfig,
) -> Result<Builtins, ExecutorError> {
    executor.registry().register_fn(PING, |task, ctx| async move {
        Ok(serde_json::json!({
            "task_id": task.id,
            "worker_id": ctx.worker_id,
        }))
    })?;

    let pool_breaker = Arc::new(CircuitBreaker::new(
        SOURCE_STATS,
        config.circuit_breaker.clone(),
    ));
    let recovery = Arc::new(RecoveryManager::new().with_policy(config.retry.clone()));

    let stats_handler = BlockingHandler::new(pool, |task: TaskRecord| {
        let input: SourceStatsInput = serde_json::from_value(task.payload)?;
        let stats = source_stats(input.path, &input.source);
        serde_json::to_value(stats).map_err(|e| TaskError::other(e.to_string()))
    });
    executor.register_handler(
        SOURCE_STATS,
        RecoveringHandler::new(
            CircuitBreakerHandler::new(stats_handler, Arc::clone(&pool_breaker)),
            recovery,
        ),
    )?;

    Ok(Builtins { pool_breaker })
}
