use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utagent_engine::pool::AdaptiveThreadPool;
use utagent_engine::queue::InMemoryTaskQueue;
use utagent_engine::worker::Executor;
use utagent_engine::EngineConfig;

mod handlers;

const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // RUST_LOG overrides the default filter
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("utagent_worker=info,utagent_engine=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("utagent-worker starting...");

    let config = EngineConfig::from_env();
    config.validate().context("Invalid engine configuration")?;

    info!(
        workers = config.executor.workers,
        max_concurrent = config.executor.max_concurrent_per_worker,
        pool_min = config.pool.min_workers,
        pool_max = config.pool.max_workers,
        breaker_threshold = config.circuit_breaker.failure_threshold,
        retry_attempts = config.retry.max_attempts,
        "Starting task executor"
    );

    // Explicit pool handle, shared with every blocking handler
    let pool = Arc::new(
        AdaptiveThreadPool::new(config.pool.clone()).context("Failed to start thread pool")?,
    );
    let executor = Executor::new(Arc::new(InMemoryTaskQueue::new()), config.executor.clone());
    let builtins = handlers::register_builtin(&executor, Arc::clone(&pool), &config)
        .context("Failed to register built-in handlers")?;

    executor
        .start_default()
        .await
        .context("Failed to start executor")?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut stats_ticker = tokio::time::interval(STATS_INTERVAL);

    loop {
        tokio::select! {
            _ = stats_ticker.tick() => {
                match executor.get_stats().await {
                    Ok(stats) => {
                        let pool_metrics = pool.metrics();
                        info!(
                            pending = stats.queue.pending,
                            processing = stats.queue.processing,
                            completed = stats.queue.completed,
                            failed = stats.queue.failed,
                            success_rate = stats.queue.success_rate(),
                            active_workers = stats.active_workers,
                            total_load = stats.total_load,
                            pool_workers = pool_metrics.current_workers,
                            pool_queue = pool_metrics.queue_size,
                            pool_breaker = %builtins.pool_breaker.state(),
                            "Executor stats"
                        );
                    }
                    Err(e) => warn!(error = %e, "Failed to collect stats"),
                }
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Received shutdown signal");
                break;
            }
        }
    }

    if let Err(e) = executor
        .stop(true, config.executor.shutdown_timeout)
        .await
    {
        warn!(error = %e, "Executor did not stop cleanly");
    }

    tokio::task::spawn_blocking(move || pool.shutdown(true))
        .await
        .context("Thread pool shutdown panicked")?;

    info!("Worker shutdown complete");
    Ok(())
}
