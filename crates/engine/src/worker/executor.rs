//! Executor supervising workers that consume from a task queue
//!
//! Runs one consumption loop per [`Worker`] and a monitor loop that replaces
//! dead workers and reclaims timed-out tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::handler::{HandlerRegistry, RegistryError, TaskHandler};
use super::worker::{Worker, WorkerHealth};
use crate::config::ConfigError;
use crate::error::TaskError;
use crate::queue::{FailureOutcome, QueueError, QueueStats, TaskQueueBackend};
use crate::task::{NewTask, SubmitOptions, TaskId, TaskRecord};

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Workers started by [`Executor::start_default`] and kept alive by the
    /// monitor
    pub workers: usize,

    /// Concurrent handler executions per worker
    pub max_concurrent_per_worker: usize,

    /// How long one `consume` call waits for a task
    #[serde(with = "crate::serde_duration::millis")]
    pub poll_interval: Duration,

    /// Worker health and timeout check interval
    #[serde(with = "crate::serde_duration::millis")]
    pub monitor_interval: Duration,

    /// Pause after a failed queue call
    #[serde(with = "crate::serde_duration::millis")]
    pub error_backoff: Duration,

    /// Default graceful shutdown bound
    #[serde(with = "crate::serde_duration::millis")]
    pub shutdown_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_concurrent_per_worker: 5,
            poll_interval: Duration::from_secs(1),
            monitor_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_concurrent_per_worker(mut self, max: usize) -> Self {
        self.max_concurrent_per_worker = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        if self.max_concurrent_per_worker == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_per_worker",
                "must be at least 1",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("poll_interval", "must be non-zero"));
        }
        if self.monitor_interval.is_zero() {
            return Err(ConfigError::invalid("monitor_interval", "must be non-zero"));
        }
        Ok(())
    }
}

/// Executor errors
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("executor is already running")]
    AlreadyRunning,

    /// Graceful stop ran out of time; the remaining loops were aborted and
    /// their claimed tasks are left for timeout reclamation
    #[error("graceful shutdown timed out, aborted {aborted} worker loop(s)")]
    ShutdownTimeout { aborted: usize },

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Executor statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub running: bool,
    pub queue: QueueStats,
    pub workers: Vec<WorkerHealth>,
    pub total_workers: usize,
    pub active_workers: usize,
    pub total_load: usize,
}

struct WorkerSlot {
    worker: Arc<Worker>,
    loop_handle: JoinHandle<()>,
}

impl WorkerSlot {
    fn is_healthy(&self) -> bool {
        self.worker.is_running() && !self.loop_handle.is_finished()
    }
}

#[derive(Default)]
struct ExecutorState {
    running: bool,
    target_workers: usize,
    workers: Vec<WorkerSlot>,
    /// Stopped workers whose loop may still be finishing a task
    detached: Vec<WorkerSlot>,
    monitor: Option<JoinHandle<()>>,
}

struct ExecutorInner {
    queue: Arc<dyn TaskQueueBackend>,
    config: ExecutorConfig,
    registry: HandlerRegistry,
    state: Mutex<ExecutorState>,
    shutdown_tx: watch::Sender<bool>,
    worker_seq: AtomicUsize,
}

impl ExecutorInner {
    /// Create, start and spawn the loop for a new worker
    ///
    /// Must be called within a Tokio runtime.
    fn spawn_worker(&self) -> WorkerSlot {
        let seq = self.worker_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let worker = Arc::new(Worker::with_registry(
            format!("worker-{}", seq),
            self.config.max_concurrent_per_worker,
            self.registry.clone(),
        ));
        worker.start();

        let loop_handle = tokio::spawn(worker_loop(
            Arc::clone(&worker),
            Arc::clone(&self.queue),
            self.config.clone(),
            self.shutdown_tx.subscribe(),
        ));

        WorkerSlot {
            worker,
            loop_handle,
        }
    }

    fn check_workers(&self) -> usize {
        let mut state = self.state.lock();
        if !state.running {
            return 0;
        }

        // Removed loops are detached, not aborted, so an in-flight task
        // still reaches the queue. `stop` joins them.
        let (healthy, unhealthy): (Vec<_>, Vec<_>) = std::mem::take(&mut state.workers)
            .into_iter()
            .partition(WorkerSlot::is_healthy);
        state.workers = healthy;
        for slot in unhealthy {
            warn!(
                worker_id = %slot.worker.id(),
                loop_finished = slot.loop_handle.is_finished(),
                "Removing unhealthy worker"
            );
            slot.worker.stop();
            state.detached.push(slot);
        }
        state.detached.retain(|slot| !slot.loop_handle.is_finished());

        let missing = state.target_workers.saturating_sub(state.workers.len());
        for _ in 0..missing {
            let slot = self.spawn_worker();
            info!(worker_id = %slot.worker.id(), "Started replacement worker");
            state.workers.push(slot);
        }
        missing
    }
}

/// Supervises a fixed-size set of workers draining a task queue
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use utagent_engine::queue::InMemoryTaskQueue;
/// use utagent_engine::task::SubmitOptions;
/// use utagent_engine::worker::{Executor, ExecutorConfig};
///
/// # tokio_test::block_on(async {
/// let executor = Executor::new(
///     Arc::new(InMemoryTaskQueue::new()),
///     ExecutorConfig::default().with_poll_interval(Duration::from_millis(10)),
/// );
/// executor
///     .registry()
///     .register_fn("analyze_file", |task, _ctx| async move { Ok(task.payload) })
///     .unwrap();
///
/// executor.start(2).await.unwrap();
/// let id = executor
///     .submit("analyze_file", serde_json::json!({"path": "src/lib.rs"}), SubmitOptions::default())
///     .await
///     .unwrap();
/// # let _ = id;
/// executor.stop(true, Duration::from_secs(5)).await.unwrap();
/// # });
/// ```
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    pub fn new(queue: Arc<dyn TaskQueueBackend>, config: ExecutorConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ExecutorInner {
                queue,
                config,
                registry: HandlerRegistry::new(),
                state: Mutex::new(ExecutorState::default()),
                shutdown_tx,
                worker_seq: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueueBackend> {
        &self.inner.queue
    }

    /// Registry shared by every worker, replacements included
    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn register_handler<H: TaskHandler>(
        &self,
        task_type: &str,
        handler: H,
    ) -> Result<(), ExecutorError> {
        self.inner.registry.register(task_type, handler)?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Start `workers` workers plus the monitor loop
    #[instrument(skip(self))]
    pub async fn start(&self, workers: usize) -> Result<(), ExecutorError> {
        self.inner.config.validate()?;
        if workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1").into());
        }

        let mut state = self.inner.state.lock();
        if state.running {
            return Err(ExecutorError::AlreadyRunning);
        }

        info!(
            workers,
            max_concurrent = self.inner.config.max_concurrent_per_worker,
            handlers = ?self.inner.registry.task_types(),
            "Starting executor"
        );

        self.inner.shutdown_tx.send_replace(false);
        self.inner.worker_seq.store(0, Ordering::SeqCst);
        state.running = true;
        state.target_workers = workers;
        for _ in 0..workers {
            let slot = self.inner.spawn_worker();
            state.workers.push(slot);
        }
        state.monitor = Some(tokio::spawn(monitor_loop(
            Arc::clone(&self.inner),
            self.inner.shutdown_tx.subscribe(),
        )));

        Ok(())
    }

    /// Start with the configured worker count
    pub async fn start_default(&self) -> Result<(), ExecutorError> {
        self.start(self.inner.config.workers).await
    }

    /// Replace stopped or crashed workers so the configured count is
    /// running again; returns how many were replaced
    ///
    /// Must be called within a Tokio runtime.
    pub fn check_workers(&self) -> usize {
        self.inner.check_workers()
    }

    /// Stop all loops and workers
    ///
    /// Graceful stops let each loop finish the task it holds, up to
    /// `timeout`; loops still busy after that are cancelled and aborted.
    /// Loops of workers replaced by the monitor are joined the same way.
    /// A non-graceful stop cancels handlers and aborts loops immediately.
    /// Stopping a stopped executor is a no-op.
    #[instrument(skip(self))]
    pub async fn stop(&self, graceful: bool, timeout: Duration) -> Result<(), ExecutorError> {
        let (mut workers, monitor, active) = {
            let mut state = self.inner.state.lock();
            if !state.running {
                return Ok(());
            }
            state.running = false;
            state.target_workers = 0;
            let mut workers = std::mem::take(&mut state.workers);
            let active = workers.len();
            workers.append(&mut state.detached);
            (workers, state.monitor.take(), active)
        };

        info!(
            workers = active,
            detached = workers.len() - active,
            "Stopping executor"
        );
        self.inner.shutdown_tx.send_replace(true);
        if let Some(monitor) = monitor {
            monitor.abort();
        }

        let mut aborted = 0;
        if graceful {
            let deadline = tokio::time::Instant::now() + timeout;
            for slot in &mut workers {
                if tokio::time::timeout_at(deadline, &mut slot.loop_handle)
                    .await
                    .is_err()
                {
                    slot.worker.cancel();
                    slot.loop_handle.abort();
                    aborted += 1;
                }
            }
        } else {
            for slot in &workers {
                slot.worker.cancel();
                slot.loop_handle.abort();
            }
        }

        for slot in &workers {
            slot.worker.stop();
        }

        if aborted > 0 {
            warn!(aborted, "Shutdown timeout reached");
            return Err(ExecutorError::ShutdownTimeout { aborted });
        }

        info!("Executor stopped");
        Ok(())
    }

    /// Submit a task to the queue
    pub async fn submit(
        &self,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<TaskId, ExecutorError> {
        let task = NewTask::with_options(task_type, payload, options);
        let task_type = task.task_type.clone();
        let priority = task.priority;

        let id = self.inner.queue.submit(task).await?;
        debug!(task_id = %id, %task_type, ?priority, "Task submitted");
        Ok(id)
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, ExecutorError> {
        Ok(self.inner.queue.get_task(task_id).await?)
    }

    /// Current workers, in start order
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.inner
            .state
            .lock()
            .workers
            .iter()
            .map(|slot| Arc::clone(&slot.worker))
            .collect()
    }

    pub async fn get_stats(&self) -> Result<ExecutorStats, ExecutorError> {
        let queue = self.inner.queue.get_stats().await?;
        let (running, workers) = {
            let state = self.inner.state.lock();
            let health: Vec<WorkerHealth> = state
                .workers
                .iter()
                .map(|slot| slot.worker.health_check())
                .collect();
            (state.running, health)
        };

        Ok(ExecutorStats {
            running,
            queue,
            total_workers: workers.len(),
            active_workers: workers.iter().filter(|w| w.running).count(),
            total_load: workers.iter().map(|w| w.current_load).sum(),
            workers,
        })
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.inner.shutdown_tx.send_replace(true);
        if let Some(monitor) = self.inner.state.lock().monitor.take() {
            monitor.abort();
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Executor")
            .field("running", &state.running)
            .field("workers", &state.workers.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[instrument(skip_all, fields(worker_id = %worker.id()))]
async fn worker_loop(
    worker: Arc<Worker>,
    queue: Arc<dyn TaskQueueBackend>,
    config: ExecutorConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() || !worker.is_running() {
            break;
        }

        let claimed = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            claimed = queue.consume(worker.id(), config.poll_interval) => claimed,
        };

        match claimed {
            Ok(Some(task)) => process_task(&worker, queue.as_ref(), task).await,
            Ok(None) => {}
            Err(e) => {
                error!("Failed to consume task: {}", e);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(config.error_backoff) => {}
                }
            }
        }
    }

    debug!("Worker loop exited");
}

/// Run a claimed task and report the outcome under its claim
///
/// An outcome for a task that was reclaimed meanwhile is dropped; the
/// current holder reports instead.
async fn process_task(worker: &Worker, queue: &dyn TaskQueueBackend, task: TaskRecord) {
    let task_id = task.id;
    let Some(claim) = task.claim() else {
        error!(%task_id, status = %task.status, "Consumed task carries no claim");
        return;
    };
    let result = worker.execute(&task).await;

    if result.success {
        let output = result.output.unwrap_or(serde_json::Value::Null);
        match queue.complete(&claim, output).await {
            Ok(()) => debug!(
                %task_id,
                elapsed_ms = result.execution_time.as_millis() as u64,
                "Task completed"
            ),
            Err(e) if e.is_stale() => {
                warn!(%task_id, attempt = claim.attempt, "Discarding stale result: {}", e)
            }
            Err(e) => warn!(%task_id, "Failed to complete task: {}", e),
        }
        return;
    }

    let error = result
        .error
        .unwrap_or_else(|| TaskError::other("task failed without an error"));
    let retry = error.is_retryable() && task.retry_count < task.max_retries;

    match queue.fail(&claim, &error.to_string(), retry).await {
        Ok(FailureOutcome::WillRetry { retry_count }) => {
            debug!(%task_id, retry_count, category = %error.category(), "Task will retry: {}", error);
        }
        Ok(FailureOutcome::Failed) => {
            warn!(%task_id, retry_count = task.retry_count, category = %error.category(), "Task failed: {}", error);
        }
        Err(e) if e.is_stale() => {
            warn!(%task_id, attempt = claim.attempt, "Discarding stale failure: {}", e)
        }
        Err(e) => warn!(%task_id, "Failed to record task failure: {}", e),
    }
}

async fn monitor_loop(inner: Arc<ExecutorInner>, mut shutdown: watch::Receiver<bool>) {
    let interval = inner.config.monitor_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                inner.check_workers();
                match inner.queue.check_timeouts().await {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        warn!(count = reclaimed.len(), "Reclaimed timed out tasks");
                    }
                    Ok(_) => {}
                    Err(e) => error!("Timeout check failed: {}", e),
                }
            }
            _ = shutdown.changed() => {
                debug!("Monitor loop: shutdown requested");
                break;
            }
        }
    }
}
