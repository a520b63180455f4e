//! Task trait and error types.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::context::TaskContext;
use crate::retry::RetryPolicy;
use crate::runtime::{Interrupt, RuntimeError};

/// Error returned by a task handler.
#[derive(Error, Debug)]
pub enum TaskError {
    /// Transient failure - worth retrying.
    #[error("retryable: {0}")]
    Retryable(#[source] anyhow::Error),

    /// Permanent failure - won't succeed on retry.
    #[error("permanent: {0}")]
    Permanent(#[source] anyhow::Error),

    /// The input payload did not match the task's input type.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The handler was unwound by the runtime (suspension or cancellation).
    #[error(transparent)]
    Interrupted(Interrupt),
}

impl TaskError {
    /// Create a retryable error.
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    /// Create a permanent error.
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retryable(err)
    }
}

impl From<Interrupt> for TaskError {
    fn from(interrupt: Interrupt) -> Self {
        Self::Interrupted(interrupt)
    }
}

impl From<RuntimeError> for TaskError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Interrupted(interrupt) => Self::Interrupted(interrupt),
            RuntimeError::Checkpoint(reason) => {
                Self::Retryable(anyhow::anyhow!("checkpoint failed: {reason}"))
            }
        }
    }
}

/// Static configuration of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Machine/resource class the task asks for.
    #[serde(default)]
    pub machine: Option<String>,
    /// Usage budget; falls back to the worker default when unset.
    #[serde(default)]
    pub max_duration: Option<Duration>,
}

impl TaskConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_machine(mut self, machine: impl Into<String>) -> Self {
        self.machine = Some(machine.into());
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }
}

/// A unit of work the worker can execute.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// The input payload type.
    type Input: DeserializeOwned + Send;

    /// The output payload type.
    type Output: Serialize + Send;

    /// Unique identifier the task is registered and dispatched under.
    fn id(&self) -> &str;

    fn config(&self) -> TaskConfig {
        TaskConfig::default()
    }

    async fn run(&self, input: Self::Input, ctx: &TaskContext) -> Result<Self::Output, TaskError>;
}

/// Task backed by an async closure over JSON values.
pub struct FnTask<F> {
    id: String,
    config: TaskConfig,
    f: F,
}

/// Build a task from a closure.
///
/// ```ignore
/// let task = task_fn("send-email", |input, _ctx| async move {
///     Ok(serde_json::json!({ "sent": true, "to": input["to"] }))
/// });
/// ```
pub fn task_fn<F, Fut>(id: impl Into<String>, f: F) -> FnTask<F>
where
    F: Fn(serde_json::Value, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
{
    FnTask {
        id: id.into(),
        config: TaskConfig::default(),
        f,
    }
}

impl<F> FnTask<F> {
    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: Fn(serde_json::Value, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
{
    type Input = serde_json::Value;
    type Output = serde_json::Value;

    fn id(&self) -> &str {
        &self.id
    }

    fn config(&self) -> TaskConfig {
        self.config.clone()
    }

    async fn run(&self, input: Self::Input, ctx: &TaskContext) -> Result<Self::Output, TaskError> {
        (self.f)(input, ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelReason;

    #[test]
    fn test_anyhow_errors_are_retryable() {
        let err: TaskError = anyhow::anyhow!("smtp unavailable").into();
        assert!(err.is_retryable());
        assert!(!TaskError::permanent(anyhow::anyhow!("bad address")).is_retryable());
    }

    #[test]
    fn test_runtime_errors_convert() {
        let interrupted: TaskError = RuntimeError::Interrupted(Interrupt::Cancelled(
            CancelReason::Requested { reason: "stop".into() },
        ))
        .into();
        assert!(matches!(interrupted, TaskError::Interrupted(_)));

        let checkpoint: TaskError = RuntimeError::Checkpoint("disk full".into()).into();
        assert!(checkpoint.is_retryable());
    }

    #[test]
    fn test_config_builders() {
        let config = TaskConfig::default()
            .with_retry(RetryPolicy::fixed(3, Duration::from_secs(1)))
            .with_machine("small-1x")
            .with_max_duration(Duration::from_millis(100));
        assert_eq!(config.retry.max_attempts(), 3);
        assert_eq!(config.machine.as_deref(), Some("small-1x"));
        assert_eq!(config.max_duration, Some(Duration::from_millis(100)));
    }
}
