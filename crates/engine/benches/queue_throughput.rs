//! Queue throughput benchmark
//!
//! Benchmarks the critical path: submit → consume → complete, alone and
//! with several consumers contending for the queue lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use utagent_engine::queue::{InMemoryTaskQueue, TaskQueueBackend};
use utagent_engine::task::{NewTask, TaskPriority};

const PRIORITIES: [TaskPriority; 4] = TaskPriority::ALL;

async fn fill(queue: &InMemoryTaskQueue, count: u64) {
    for i in 0..count {
        queue
            .submit(
                NewTask::new("generate_tests", serde_json::json!({ "file": i }))
                    .with_priority(PRIORITIES[(i % 4) as usize]),
            )
            .await
            .unwrap();
    }
}

/// Single consumer draining a pre-filled queue (baseline)
fn bench_consume_single(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("queue/consume_single");
    group.throughput(Throughput::Elements(1));

    group.bench_function("mixed_priority", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let queue = InMemoryTaskQueue::new();
            fill(&queue, iters).await;

            let start = Instant::now();
            while let Some(task) = queue.consume("bench", Duration::ZERO).await.unwrap() {
                let claim = task.claim().unwrap();
                queue
                    .complete(&claim, serde_json::json!({"ok": true}))
                    .await
                    .unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Several consumers contending for the same queue
fn bench_consume_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("queue/consume_concurrent");
    group.sample_size(20);

    for consumers in [2, 4, 8] {
        let task_count = 5000u64;
        group.throughput(Throughput::Elements(task_count));
        group.bench_with_input(
            BenchmarkId::new("consumers", consumers),
            &consumers,
            |b, &consumers| {
                b.to_async(&rt).iter(|| async {
                    let queue = Arc::new(InMemoryTaskQueue::new());
                    fill(&queue, task_count).await;

                    let mut handles = Vec::new();
                    for n in 0..consumers {
                        let queue = Arc::clone(&queue);
                        let worker_id = format!("bench-{}", n);
                        handles.push(tokio::spawn(async move {
                            while let Some(task) = queue
                                .consume(&worker_id, Duration::from_millis(1))
                                .await
                                .unwrap()
                            {
                                let claim = task.claim().unwrap();
                                queue.complete(&claim, serde_json::json!({})).await.unwrap();
                            }
                        }));
                    }

                    for handle in handles {
                        handle.await.unwrap();
                    }
                    assert_eq!(queue.get_stats().await.unwrap().completed as u64, task_count);
                });
            },
        );
    }

    group.finish();
}

/// Submit latency
fn bench_submit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("queue/submit");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let queue = InMemoryTaskQueue::new();
            let start = Instant::now();
            fill(&queue, iters).await;
            start.elapsed()
        });
    });

    group.finish();
}

/// Retry path: fail with retry, re-consume, complete
fn bench_retry_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("queue/retry_cycle");
    group.throughput(Throughput::Elements(1));

    group.bench_function("fail_then_complete", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let queue = InMemoryTaskQueue::new();
            fill(&queue, iters).await;

            let start = Instant::now();
            while let Some(task) = queue.consume("bench", Duration::ZERO).await.unwrap() {
                let claim = task.claim().unwrap();
                if task.retry_count == 0 {
                    queue.fail(&claim, "rate limited", true).await.unwrap();
                } else {
                    queue.complete(&claim, serde_json::json!({})).await.unwrap();
                }
            }
            start.elapsed()
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_consume_single,
    bench_consume_concurrent,
    bench_submit,
    bench_retry_cycle,
);
criterion_main!(benches);
