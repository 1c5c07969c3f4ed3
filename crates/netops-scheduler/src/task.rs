//! Task references: the only way the scheduler reaches application code.
//!
//! Hosts register an implementation of [`Task`] under a string key at
//! startup; job definitions carry that key as their `task_ref`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Error returned by task implementations.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        TaskError::Failed(msg.into())
    }
}

/// Per-attempt invocation context handed to a task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_id: String,
    /// 0 for the first attempt.
    pub attempt: u32,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// The attempt is abandoned at this instant.
    pub deadline: Instant,
    /// Cancelled on timeout or scheduler shutdown; long-running tasks should
    /// select on it at their await points.
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(Value::as_str)
    }

    pub fn kwarg_str(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).and_then(Value::as_str)
    }
}

/// Application logic invoked by the executor.
///
/// `Ok(Some(text))` becomes the run's `output`.
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> Result<Option<String>, TaskError>;
}

type BoxedTaskFuture = Pin<Box<dyn Future<Output = Result<Option<String>, TaskError>> + Send>>;

/// Adapts an async closure into a [`Task`].
pub struct FnTask {
    f: Box<dyn Fn(TaskContext) -> BoxedTaskFuture + Send + Sync>,
}

impl FnTask {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>, TaskError>> + Send + 'static,
    {
        Self {
            f: Box::new(move |ctx| Box::pin(f(ctx))),
        }
    }
}

#[async_trait]
impl Task for FnTask {
    async fn run(&self, ctx: TaskContext) -> Result<Option<String>, TaskError> {
        (self.f)(ctx).await
    }
}

/// Maps `task_ref` strings to task implementations.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<dyn Task>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the implementation behind `task_ref`.
    pub fn register(&self, task_ref: impl Into<String>, task: Arc<dyn Task>) {
        let task_ref = task_ref.into();
        debug!(%task_ref, "task registered");
        self.tasks
            .write()
            .expect("task registry poisoned")
            .insert(task_ref, task);
    }

    /// Shorthand for registering an async closure.
    pub fn register_fn<F, Fut>(&self, task_ref: impl Into<String>, f: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>, TaskError>> + Send + 'static,
    {
        self.register(task_ref, Arc::new(FnTask::new(f)));
    }

    pub fn resolve(&self, task_ref: &str) -> Option<Arc<dyn Task>> {
        self.tasks
            .read()
            .expect("task registry poisoned")
            .get(task_ref)
            .cloned()
    }

    pub fn contains(&self, task_ref: &str) -> bool {
        self.tasks
            .read()
            .expect("task registry poisoned")
            .contains_key(task_ref)
    }

    /// Registered keys, sorted.
    pub fn task_refs(&self) -> Vec<String> {
        let mut refs: Vec<String> = self
            .tasks
            .read()
            .expect("task registry poisoned")
            .keys()
            .cloned()
            .collect();
        refs.sort();
        refs
    }
}
