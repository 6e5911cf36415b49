//! End-to-end tests: executor, queue, workers and handler adapters together
//!
//! Run with: cargo test -p utagent-engine --test executor_integration

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;

use utagent_engine::pool::{AdaptivePoolConfig, AdaptiveThreadPool, FixedCpuSampler};
use utagent_engine::queue::{InMemoryTaskQueue, TaskQueueBackend};
use utagent_engine::reliability::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use utagent_engine::task::{SubmitOptions, TaskId, TaskPriority, TaskRecord, TaskStatus};
use utagent_engine::worker::{BlockingHandler, CircuitBreakerHandler, Executor, ExecutorConfig};
use utagent_engine::TaskError;

fn test_executor(queue: Arc<InMemoryTaskQueue>) -> Executor {
    Executor::new(
        queue,
        ExecutorConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_monitor_interval(Duration::from_millis(50))
            .with_max_concurrent_per_worker(1),
    )
}

async fn wait_for_terminal(executor: &Executor, id: TaskId) -> TaskRecord {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let task = executor.get_task(id).await.unwrap().unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task did not finish in time")
}

#[test_log::test(tokio::test)]
async fn test_priority_order_high_normal_low() {
    let queue = Arc::new(InMemoryTaskQueue::new());
    let executor = test_executor(queue.clone());
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        executor
            .registry()
            .register_fn("record", move |task, _ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(task.priority);
                    Ok(json!(null))
                }
            })
            .unwrap();
    }

    let mut ids = vec![];
    for priority in [TaskPriority::High, TaskPriority::Low, TaskPriority::Normal] {
        ids.push(
            executor
                .submit(
                    "record",
                    json!({}),
                    SubmitOptions::default().with_priority(priority),
                )
                .await
                .unwrap(),
        );
    }

    executor.start(1).await.unwrap();
    for id in ids {
        assert_eq!(
            wait_for_terminal(&executor, id).await.status,
            TaskStatus::Completed
        );
    }
    executor.stop(true, Duration::from_secs(5)).await.unwrap();

    assert_eq!(
        *seen.lock(),
        vec![TaskPriority::High, TaskPriority::Normal, TaskPriority::Low]
    );
}

#[test_log::test(tokio::test)]
async fn test_fails_twice_then_succeeds() {
    let queue = Arc::new(InMemoryTaskQueue::new());
    let executor = test_executor(queue.clone());
    let attempts = Arc::new(AtomicU32::new(0));
    {
        let attempts = Arc::clone(&attempts);
        executor
            .registry()
            .register_fn("flaky_llm_call", move |_, _| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(TaskError::transient(format!("429 on attempt {}", attempt + 1)))
                    } else {
                        Ok(json!({"tests_generated": 4}))
                    }
                }
            })
            .unwrap();
    }
    executor.start(2).await.unwrap();

    let id = executor
        .submit(
            "flaky_llm_call",
            json!({"file": "src/lexer.rs"}),
            SubmitOptions::default().with_max_retries(3),
        )
        .await
        .unwrap();
    let task = wait_for_terminal(&executor, id).await;
    executor.stop(true, Duration::from_secs(5)).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.result, Some(json!({"tests_generated": 4})));
    assert_eq!(task.error, None);
    assert_eq!(task.error_history.len(), 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[test_log::test(tokio::test)]
async fn test_permanent_error_fails_without_retry() {
    let queue = Arc::new(InMemoryTaskQueue::new());
    let executor = test_executor(queue.clone());
    executor
        .registry()
        .register_typed("analyze_file", |input: AnalyzeInput, _ctx| async move {
            Ok(json!({ "path": input.path }))
        })
        .unwrap();
    executor.start(1).await.unwrap();

    let id = executor
        .submit(
            "analyze_file",
            json!({"wrong_field": true}),
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    let task = wait_for_terminal(&executor, id).await;
    executor.stop(true, Duration::from_secs(5)).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
    assert!(task.error.unwrap().contains("invalid payload"));

    let stats = queue.get_stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.success_rate(), 0.0);
}

#[derive(Debug, serde::Deserialize)]
struct AnalyzeInput {
    path: String,
}

#[test_log::test(tokio::test)]
async fn test_monitor_replaces_stopped_worker() {
    let queue = Arc::new(InMemoryTaskQueue::new());
    let executor = test_executor(queue.clone());
    executor.start(2).await.unwrap();

    executor.workers()[0].stop();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = executor.get_stats().await.unwrap();
            let replaced = stats.workers.iter().any(|w| w.worker_id == "worker-3");
            if replaced && stats.active_workers == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("monitor did not replace the stopped worker");

    let stats = executor.get_stats().await.unwrap();
    assert_eq!(stats.total_workers, 2);
    executor.stop(true, Duration::from_secs(5)).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_monitor_reclaims_timed_out_task() {
    let queue = Arc::new(InMemoryTaskQueue::new());
    let executor = test_executor(queue.clone());
    let attempts = Arc::new(AtomicU32::new(0));
    {
        let attempts = Arc::clone(&attempts);
        executor
            .registry()
            .register_fn("hangs_once", move |_, _| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                    Ok(json!("done"))
                }
            })
            .unwrap();
    }
    executor.start(2).await.unwrap();

    let id = executor
        .submit(
            "hangs_once",
            json!({}),
            SubmitOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();
    let task = wait_for_terminal(&executor, id).await;
    executor.stop(false, Duration::from_secs(1)).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test_log::test(tokio::test)]
async fn test_late_outcome_from_reclaimed_run_is_discarded() {
    let queue = Arc::new(InMemoryTaskQueue::new());
    // Monitor effectively off; reclamation is driven by hand below
    let executor = Executor::new(
        queue.clone(),
        ExecutorConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_monitor_interval(Duration::from_secs(3600))
            .with_max_concurrent_per_worker(1),
    );
    let attempts = Arc::new(AtomicU32::new(0));
    let release_first = Arc::new(Notify::new());
    let release_second = Arc::new(Notify::new());
    let first_returned = Arc::new(Notify::new());
    {
        let attempts = Arc::clone(&attempts);
        let release_first = Arc::clone(&release_first);
        let release_second = Arc::clone(&release_second);
        let first_returned = Arc::clone(&first_returned);
        executor
            .registry()
            .register_fn("generate_tests", move |_, ctx| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let release_first = Arc::clone(&release_first);
                let release_second = Arc::clone(&release_second);
                let first_returned = Arc::clone(&first_returned);
                async move {
                    if attempt == 0 {
                        release_first.notified().await;
                        first_returned.notify_one();
                        Err(TaskError::transient("llm connection reset"))
                    } else {
                        release_second.notified().await;
                        Ok(json!({ "tests_generated": 3, "worker": ctx.worker_id }))
                    }
                }
            })
            .unwrap();
    }
    executor.start(2).await.unwrap();

    let id = executor
        .submit(
            "generate_tests",
            json!({"file": "src/parser.rs"}),
            SubmitOptions::default()
                .with_timeout(Duration::from_secs(30))
                .with_max_retries(3),
        )
        .await
        .unwrap();

    let first_holder = wait_for_attempt(&executor, id, 1).await;
    assert_eq!(
        queue.check_timeouts_at(Utc::now() + ChronoDuration::seconds(60)),
        vec![id]
    );
    let second_holder = wait_for_attempt(&executor, id, 2).await;
    assert_ne!(first_holder, second_holder);

    // The first run reports after losing its claim
    release_first.notify_one();
    first_returned.notified().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let task = executor.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Processing);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.worker_id.as_deref(), Some(second_holder.as_str()));

    release_second.notify_one();
    let task = wait_for_terminal(&executor, id).await;
    executor.stop(true, Duration::from_secs(5)).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(
        task.result,
        Some(json!({ "tests_generated": 3, "worker": second_holder }))
    );
    assert_eq!(task.error_history, vec!["task timed out".to_string()]);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

/// Wait until the task is processing under claim `attempt`; returns the holder
async fn wait_for_attempt(executor: &Executor, id: TaskId, attempt: u32) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let task = executor.get_task(id).await.unwrap().unwrap();
            if task.status == TaskStatus::Processing && task.attempt == attempt {
                if let Some(worker_id) = task.worker_id {
                    return worker_id;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task was not claimed in time")
}

#[test_log::test(tokio::test)]
async fn test_stop_rejects_nothing_and_leaves_queue_intact() {
    let queue = Arc::new(InMemoryTaskQueue::new());
    let executor = test_executor(queue.clone());
    executor.start(1).await.unwrap();
    executor.stop(true, Duration::from_secs(5)).await.unwrap();

    let id = executor
        .submit("later", json!({}), SubmitOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let task = executor.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(!executor.is_running());
}

#[test_log::test(tokio::test)]
async fn test_blocking_handler_behind_circuit_breaker() {
    let queue = Arc::new(InMemoryTaskQueue::new());
    let executor = test_executor(queue.clone());
    let pool = Arc::new(
        AdaptiveThreadPool::with_sampler(
            AdaptivePoolConfig::default().with_workers(2, 4),
            Arc::new(FixedCpuSampler::new(10.0)),
        )
        .unwrap(),
    );
    let breaker = Arc::new(CircuitBreaker::new(
        "coverage_tool",
        CircuitBreakerConfig::default().with_failure_threshold(2),
    ));

    executor
        .register_handler(
            "parse_coverage",
            CircuitBreakerHandler::new(
                BlockingHandler::new(Arc::clone(&pool), |task: TaskRecord| {
                    match task.payload["report"].as_str() {
                        Some(report) => Ok(json!({ "lines": report.lines().count() })),
                        None => Err(TaskError::degraded("coverage tool crashed")),
                    }
                }),
                Arc::clone(&breaker),
            ),
        )
        .unwrap();
    executor.start(1).await.unwrap();

    let ok = executor
        .submit(
            "parse_coverage",
            json!({"report": "a\nb\nc"}),
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    let task = wait_for_terminal(&executor, ok).await;
    assert_eq!(task.result, Some(json!({"lines": 3})));

    let broken = executor
        .submit(
            "parse_coverage",
            json!({}),
            SubmitOptions::default().with_max_retries(3),
        )
        .await
        .unwrap();
    let task = wait_for_terminal(&executor, broken).await;
    executor.stop(true, Duration::from_secs(5)).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 3);
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(task
        .error_history
        .iter()
        .any(|e| e.contains("circuit breaker 'coverage_tool' is open")));

    tokio::task::spawn_blocking(move || pool.shutdown(true))
        .await
        .unwrap();
}

#[test_log::test]
fn test_pool_stays_within_bounds_under_fast_tasks() {
    let sampler = Arc::new(FixedCpuSampler::new(5.0));
    let pool = AdaptiveThreadPool::with_sampler(
        AdaptivePoolConfig::default()
            .with_workers(2, 4)
            .with_backpressure(false),
        sampler.clone(),
    )
    .unwrap();

    let batch = pool.map(|n: u64| n + 1, 0..20u64).unwrap();
    for _ in 0..5 {
        pool.adjust_now();
        let workers = pool.current_workers();
        assert!((2..=4).contains(&workers), "workers = {}", workers);
    }

    sampler.set(95.0);
    for _ in 0..5 {
        pool.adjust_now();
        let workers = pool.current_workers();
        assert!((2..=4).contains(&workers), "workers = {}", workers);
    }

    let results: Vec<u64> = batch.join_all().into_iter().map(Result::unwrap).collect();
    assert_eq!(results, (1..=20).collect::<Vec<u64>>());

    pool.shutdown(true);
    let metrics = pool.metrics();
    assert_eq!(metrics.completed_tasks, 20);
    assert_eq!((metrics.min_workers, metrics.max_workers), (2, 4));
}
