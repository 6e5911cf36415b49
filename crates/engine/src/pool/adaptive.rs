//! Elastic OS-thread pool for blocking and CPU-bound work

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::backpressure::BackpressureGate;
use super::config::AdaptivePoolConfig;
use super::cpu::{CpuSampler, SystemCpuSampler};
use super::handle::{ScheduledBatch, TaskHandle};
use super::metrics::{DurationWindow, PoolMetrics};
use super::scaling::{plan_resize, ResizeDecision};
use super::PoolError;
use crate::error::panic_message;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    jobs: VecDeque<Job>,
    /// Threads from an older generation exit before taking another job
    generation: u64,
    current_workers: usize,
    live_threads: usize,
    shutdown: bool,
    gate: BackpressureGate,
    active: usize,
    completed: u64,
    rejected: u64,
    durations: DurationWindow,
    cpu_usage: f64,
    adjustment_count: u64,
    last_adjustment_at: Option<DateTime<Utc>>,
}

struct Shared {
    config: AdaptivePoolConfig,
    state: Mutex<PoolState>,
    job_ready: Condvar,
    adjust_wakeup: Condvar,
    threads_exited: Condvar,
    sampler: Arc<dyn CpuSampler>,
}

/// Thread pool that resizes itself from CPU usage and queue depth
///
/// Jobs wait in one shared FIFO queue. A resize starts a fresh generation of
/// threads; threads of the previous generation finish the job they are
/// running and exit, so queued work is never lost or run twice.
///
/// The pool is an explicit handle: construct it once and share it as
/// `Arc<AdaptiveThreadPool>`.
///
/// # Example
///
/// ```
/// use utagent_engine::pool::{AdaptivePoolConfig, AdaptiveThreadPool};
///
/// let pool = AdaptiveThreadPool::new(AdaptivePoolConfig::default().with_workers(2, 4)).unwrap();
///
/// let handle = pool.submit(|| 6 * 7).unwrap().expect("accepted");
/// assert_eq!(handle.join().unwrap(), 42);
///
/// pool.shutdown(true);
/// ```
pub struct AdaptiveThreadPool {
    shared: Arc<Shared>,
    adjuster: Mutex<Option<JoinHandle<()>>>,
}

impl AdaptiveThreadPool {
    /// Create a pool sampling CPU usage from the operating system
    pub fn new(config: AdaptivePoolConfig) -> Result<Self, PoolError> {
        Self::with_sampler(config, Arc::new(SystemCpuSampler::new()))
    }

    /// Create a pool with a custom CPU load source
    pub fn with_sampler(
        config: AdaptivePoolConfig,
        sampler: Arc<dyn CpuSampler>,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        let state = PoolState {
            jobs: VecDeque::new(),
            generation: 0,
            current_workers: 0,
            live_threads: 0,
            shutdown: false,
            gate: BackpressureGate::new(config.backpressure.clone()),
            active: 0,
            completed: 0,
            rejected: 0,
            durations: DurationWindow::default(),
            cpu_usage: 0.0,
            adjustment_count: 0,
            last_adjustment_at: None,
        };

        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(state),
            job_ready: Condvar::new(),
            adjust_wakeup: Condvar::new(),
            threads_exited: Condvar::new(),
            sampler,
        });

        {
            let mut state = shared.state.lock();
            let min = shared.config.min_workers;
            if spawn_generation(&shared, &mut state, min) == 0 {
                return Err(PoolError::Spawn("no worker thread could be started".into()));
            }
        }

        let adjuster = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{}-adjuster", shared.config.thread_name_prefix))
                .spawn(move || adjustment_loop(shared))
        };
        let adjuster = match adjuster {
            Ok(handle) => handle,
            Err(e) => {
                shutdown_shared(&shared);
                return Err(PoolError::Spawn(e.to_string()));
            }
        };

        info!(
            min_workers = shared.config.min_workers,
            max_workers = shared.config.max_workers,
            max_queue_size = shared.config.backpressure.max_queue_size,
            "Adaptive thread pool started"
        );

        Ok(Self {
            shared,
            adjuster: Mutex::new(Some(adjuster)),
        })
    }

    pub fn config(&self) -> &AdaptivePoolConfig {
        &self.shared.config
    }

    /// Queue a job without blocking
    ///
    /// Returns `Ok(None)` when backpressure rejects the job and
    /// `Err(PoolError::ShutDown)` once the pool is shut down.
    pub fn submit<F, T>(&self, job: F) -> Result<Option<TaskHandle<T>>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(PoolError::ShutDown);
        }

        let depth = state.jobs.len();
        if !state.gate.should_accept(depth) {
            state.rejected += 1;
            warn!(
                queue_size = depth,
                reason = state.gate.reason().unwrap_or_default(),
                "Pool submission rejected"
            );
            return Ok(None);
        }

        let (handle, job) = wrap_job(job);
        state.jobs.push_back(job);
        drop(state);

        self.shared.job_ready.notify_one();
        Ok(Some(handle))
    }

    /// Run `f` over every item, results in input order
    ///
    /// Items are queued in one step and bypass backpressure.
    pub fn map<F, I, T, R>(&self, f: F, items: I) -> Result<ScheduledBatch<R>, PoolError>
    where
        F: Fn(T) -> R + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        T: Send + 'static,
        R: Send + 'static,
    {
        let f = Arc::new(f);
        let mut batch = ScheduledBatch::new();

        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(PoolError::ShutDown);
        }
        for item in items {
            let f = Arc::clone(&f);
            let (handle, job) = wrap_job(move || f(item));
            state.jobs.push_back(job);
            batch.push(handle);
        }
        drop(state);

        self.shared.job_ready.notify_all();
        Ok(batch)
    }

    /// Run one adjustment cycle now and return what it decided
    pub fn adjust_now(&self) -> ResizeDecision {
        adjust_once(&self.shared)
    }

    /// Stop accepting jobs and let threads drain the queue
    ///
    /// With `wait`, blocks until every thread has exited. Must not be called
    /// with `wait` from a pool job.
    pub fn shutdown(&self, wait: bool) {
        shutdown_shared(&self.shared);

        if wait {
            if let Some(adjuster) = self.adjuster.lock().take() {
                if adjuster.join().is_err() {
                    error!("Pool adjustment thread panicked");
                }
            }

            let mut state = self.shared.state.lock();
            while state.live_threads > 0 {
                self.shared.threads_exited.wait(&mut state);
            }
            debug!("All pool threads exited");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    pub fn current_workers(&self) -> usize {
        self.shared.state.lock().current_workers
    }

    /// Jobs waiting for a thread
    pub fn queue_size(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.shared.state.lock();
        PoolMetrics {
            current_workers: state.current_workers,
            min_workers: self.shared.config.min_workers,
            max_workers: self.shared.config.max_workers,
            queue_size: state.jobs.len(),
            active_tasks: state.active,
            completed_tasks: state.completed,
            rejected_tasks: state.rejected,
            avg_task_duration: state.durations.average(),
            cpu_usage: state.cpu_usage,
            adjustment_count: state.adjustment_count,
            last_adjustment_at: state.last_adjustment_at,
        }
    }
}

impl Drop for AdaptiveThreadPool {
    fn drop(&mut self) {
        shutdown_shared(&self.shared);
    }
}

impl std::fmt::Debug for AdaptiveThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveThreadPool")
            .field("config", &self.shared.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

fn wrap_job<F, T>(job: F) -> (TaskHandle<T>, Job)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let job: Job = Box::new(move || {
        let result = std::panic::catch_unwind(AssertUnwindSafe(job))
            .map_err(|payload| PoolError::TaskPanicked(panic_message(payload.as_ref())));
        // Receiver may have been dropped; the job still counts as completed
        let _ = tx.send(result);
    });
    (TaskHandle::new(rx), job)
}

fn shutdown_shared(shared: &Shared) {
    {
        let mut state = shared.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        info!(queued = state.jobs.len(), "Adaptive thread pool shutting down");
    }
    shared.job_ready.notify_all();
    shared.adjust_wakeup.notify_all();
}

/// Start `count` threads of a new generation
///
/// Returns how many started. On total failure the previous generation stays
/// in charge; its threads cannot have observed the bump while we hold the
/// lock.
fn spawn_generation(shared: &Arc<Shared>, state: &mut PoolState, count: usize) -> usize {
    let previous = state.generation;
    state.generation += 1;
    let generation = state.generation;

    let mut spawned = 0;
    for index in 0..count {
        let worker_shared = Arc::clone(shared);
        let result = thread::Builder::new()
            .name(format!(
                "{}-{}-{}",
                shared.config.thread_name_prefix, generation, index
            ))
            .spawn(move || worker_loop(worker_shared, generation));

        match result {
            Ok(_) => spawned += 1,
            Err(e) => {
                error!(generation, "Failed to spawn pool thread: {}", e);
                break;
            }
        }
    }

    if spawned == 0 {
        state.generation = previous;
        return 0;
    }
    if spawned < count {
        // Below min_workers the next adjustment scales back up
        warn!(
            generation,
            spawned,
            requested = count,
            "Pool generation started short of its target"
        );
    }

    state.live_threads += spawned;
    state.current_workers = spawned;
    shared.job_ready.notify_all();
    spawned
}

fn worker_loop(shared: Arc<Shared>, generation: u64) {
    let mut state = shared.state.lock();

    loop {
        if state.generation != generation {
            break;
        }

        if let Some(job) = state.jobs.pop_front() {
            state.active += 1;
            drop(state);

            let started = Instant::now();
            job();
            let elapsed = started.elapsed();

            state = shared.state.lock();
            state.active -= 1;
            state.completed += 1;
            state.durations.record(elapsed);
            continue;
        }

        if state.shutdown {
            break;
        }
        shared.job_ready.wait(&mut state);
    }

    state.live_threads -= 1;
    if state.live_threads == 0 {
        shared.threads_exited.notify_all();
    }
}

fn adjustment_loop(shared: Arc<Shared>) {
    loop {
        {
            let mut state = shared.state.lock();
            if state.shutdown {
                break;
            }
            shared
                .adjust_wakeup
                .wait_for(&mut state, shared.config.adjustment_interval);
            if state.shutdown {
                break;
            }
        }
        adjust_once(&shared);
    }
    debug!("Pool adjustment loop exited");
}

fn adjust_once(shared: &Arc<Shared>) -> ResizeDecision {
    // Sampling can take a while; keep it outside the lock
    let cpu_usage = shared.sampler.sample();

    let mut state = shared.state.lock();
    let current = state.current_workers;
    if state.shutdown {
        return ResizeDecision::Hold { workers: current };
    }

    let queue_size = state.jobs.len();
    state.cpu_usage = cpu_usage;

    let decision = plan_resize(current, cpu_usage, queue_size, &shared.config);
    if !decision.is_change() {
        return decision;
    }

    let started = spawn_generation(shared, &mut state, decision.target());
    if started == 0 {
        return ResizeDecision::Hold { workers: current };
    }

    state.adjustment_count += 1;
    state.last_adjustment_at = Some(Utc::now());
    info!(
        from = current,
        to = started,
        cpu_usage,
        queue_size,
        "Resized adaptive thread pool"
    );

    match decision {
        ResizeDecision::ScaleUp { .. } => ResizeDecision::ScaleUp {
            from: current,
            to: started,
        },
        _ => ResizeDecision::ScaleDown {
            from: current,
            to: started,
        },
    }
}
