//! Task handlers and their registry

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::task::TaskRecord;

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Task type name is empty or contains characters outside `[A-Za-z0-9_.:-]`
    #[error("invalid task type '{0}': expected non-empty [A-Za-z0-9_.:-]")]
    InvalidTaskType(String),
}

/// Validated task type name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(name: impl Into<String>) -> Result<Self, RegistryError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'));

        if valid {
            Ok(Self(name))
        } else {
            Err(RegistryError::InvalidTaskType(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for TaskType {
    type Error = RegistryError;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

/// Execution context passed to a handler
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Worker running the task
    pub worker_id: String,

    /// Cancelled when the executor stops without waiting; long-running
    /// handlers should check it and return early
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(worker_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            worker_id: worker_id.into(),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Code run for tasks of one type
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        task: &TaskRecord,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError>;
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(TaskRecord, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskRecord, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
{
    async fn handle(
        &self,
        task: &TaskRecord,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        (self.f)(task.clone(), ctx.clone()).await
    }
}

/// Handler with a typed payload and output
///
/// Payloads that do not deserialize into `I` fail with a permanent input
/// error and are never retried.
pub struct TypedHandler<I, O, F> {
    f: F,
    _types: std::marker::PhantomData<fn(I) -> O>,
}

impl<I, O, F> TypedHandler<I, O, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _types: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<I, O, F, Fut> TaskHandler for TypedHandler<I, O, F>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(I, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, TaskError>> + Send + 'static,
{
    async fn handle(
        &self,
        task: &TaskRecord,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        let input: I = serde_json::from_value(task.payload.clone()).map_err(|e| {
            TaskError::permanent(format!("invalid payload for '{}': {}", task.task_type, e))
        })?;

        let output = (self.f)(input, ctx.clone()).await?;
        serde_json::to_value(output).map_err(|e| {
            TaskError::other(format!("cannot serialize output of '{}': {}", task.task_type, e))
        })
    }
}

/// Shared map from task type to handler
///
/// Clones share the same map, so a handler registered through any clone is
/// visible to every worker holding one. Registering a type twice replaces
/// the earlier handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<TaskType, Arc<dyn TaskHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the type
    pub fn register<H>(&self, task_type: &str, handler: H) -> Result<(), RegistryError>
    where
        H: TaskHandler,
    {
        self.register_arc(task_type, Arc::new(handler))
    }

    pub fn register_arc(
        &self,
        task_type: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        let task_type = TaskType::new(task_type)?;
        self.handlers.write().insert(task_type, handler);
        Ok(())
    }

    /// Register an async closure
    pub fn register_fn<F, Fut>(&self, task_type: &str, f: F) -> Result<(), RegistryError>
    where
        F: Fn(TaskRecord, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
    {
        self.register(task_type, FnHandler::new(f))
    }

    /// Register an async closure over a typed payload
    ///
    /// ```
    /// use serde::{Deserialize, Serialize};
    /// use utagent_engine::worker::HandlerRegistry;
    ///
    /// #[derive(Deserialize)]
    /// struct AnalyzeFile { path: String }
    ///
    /// #[derive(Serialize)]
    /// struct Analysis { functions: usize }
    ///
    /// let registry = HandlerRegistry::new();
    /// registry
    ///     .register_typed("analyze_file", |input: AnalyzeFile, _ctx| async move {
    ///         Ok(Analysis { functions: input.path.len() })
    ///     })
    ///     .unwrap();
    ///
    /// assert!(registry.contains("analyze_file"));
    /// ```
    pub fn register_typed<I, O, F, Fut>(&self, task_type: &str, f: F) -> Result<(), RegistryError>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, TaskError>> + Send + 'static,
    {
        self.register(task_type, TypedHandler::<I, O, F>::new(f))
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        let task_type = TaskType::new(task_type).ok()?;
        self.handlers.read().get(&task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.get(task_type).is_some()
    }

    /// Registered task types, sorted
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .keys()
            .map(|t| t.as_str().to_string())
            .collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}
