//! Handles for jobs running on the adaptive pool

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::{AdaptiveThreadPool, PoolError};

/// Result of a pool job, awaitable or joinable from a plain thread
#[must_use = "dropping a TaskHandle discards the job's result"]
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, PoolError>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T, PoolError>>) -> Self {
        Self { rx }
    }

    /// Block the current thread until the job finishes
    ///
    /// # Panics
    ///
    /// Panics when called from inside an async runtime; `.await` the handle
    /// there instead.
    pub fn join(self) -> Result<T, PoolError> {
        self.rx.blocking_recv().unwrap_or(Err(PoolError::Abandoned))
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A group of pool jobs collected to be waited on together
///
/// # Example
///
/// ```
/// use utagent_engine::pool::{AdaptivePoolConfig, AdaptiveThreadPool, ScheduledBatch};
///
/// let pool = AdaptiveThreadPool::new(AdaptivePoolConfig::default()).unwrap();
/// let mut batch = ScheduledBatch::new();
/// for n in 0..4u64 {
///     batch.schedule(&pool, move || n * n).unwrap();
/// }
///
/// let squares: Vec<u64> = batch.join_all().into_iter().map(Result::unwrap).collect();
/// assert_eq!(squares, vec![0, 1, 4, 9]);
/// pool.shutdown(true);
/// ```
#[derive(Debug)]
pub struct ScheduledBatch<T> {
    handles: Vec<TaskHandle<T>>,
    rejected: usize,
}

impl<T: Send + 'static> ScheduledBatch<T> {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
            rejected: 0,
        }
    }

    /// Submit a job and track its handle
    ///
    /// Returns `false` when backpressure rejected the job.
    pub fn schedule<F>(&mut self, pool: &AdaptiveThreadPool, job: F) -> Result<bool, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        match pool.submit(job)? {
            Some(handle) => {
                self.handles.push(handle);
                Ok(true)
            }
            None => {
                self.rejected += 1;
                Ok(false)
            }
        }
    }

    pub fn push(&mut self, handle: TaskHandle<T>) {
        self.handles.push(handle);
    }

    /// Jobs accepted into the batch
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Jobs turned away by backpressure
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Wait for every job, results in scheduling order
    pub async fn wait_all(self) -> Vec<Result<T, PoolError>> {
        futures::future::join_all(self.handles).await
    }

    /// Blocking variant of [`wait_all`](Self::wait_all) for plain threads
    pub fn join_all(self) -> Vec<Result<T, PoolError>> {
        self.handles.into_iter().map(TaskHandle::join).collect()
    }
}

impl<T: Send + 'static> Default for ScheduledBatch<T> {
    fn default() -> Self {
        Self::new()
    }
}
