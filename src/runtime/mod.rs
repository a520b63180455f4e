//! How task code waits.
//!
//! A [`RuntimeManager`] is chosen once at startup from the [`ExecutionMode`]:
//! in development waits are simulated inside the process, in managed mode a
//! wait suspends the attempt so the process can be released and the attempt
//! resumed later from a checkpoint.

mod dev;
mod managed;

pub use dev::DevRuntimeManager;
pub use managed::ManagedRuntimeManager;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::cancel::{AttemptCancellation, CancelReason};
use crate::clock::DurableClock;
use crate::usage::UsageMeter;

/// Where the worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Local development; waits are simulated in process.
    #[default]
    Dev,
    /// Under the Run Engine; waits suspend and checkpoint the attempt.
    Managed,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Dev),
            "managed" | "deploy" | "production" => Ok(Self::Managed),
            other => Err(format!("unknown execution mode '{other}'")),
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dev => f.write_str("dev"),
            Self::Managed => f.write_str("managed"),
        }
    }
}

/// What a durable wait is waiting for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WaitRequest {
    Duration(Duration),
    Until(DateTime<Utc>),
    /// Completed externally with a JSON payload.
    Signal(String),
}

impl WaitRequest {
    /// Time left until a timed wait is due. `None` for signals.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Self::Duration(d) => Some(*d),
            Self::Until(at) => Some((*at - now).to_std().unwrap_or(Duration::ZERO)),
            Self::Signal(_) => None,
        }
    }
}

/// A wait the attempt is suspended on, persisted in its checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWait {
    /// Position of the wait in the attempt's sequence of durable waits.
    pub index: u32,
    pub request: WaitRequest,
    pub requested_at: DateTime<Utc>,
}

/// Unwinds task code out of its handler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Interrupt {
    #[error("attempt suspended on durable wait #{}", .0.index)]
    Suspend(PendingWait),

    #[error("attempt cancelled")]
    Cancelled(CancelReason),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error(transparent)]
    Interrupted(#[from] Interrupt),

    #[error("checkpoint failed: {0}")]
    Checkpoint(String),
}

/// Outcome of asking the runtime to wait.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitDecision {
    /// The wait finished in process with this result.
    Resolved(serde_json::Value),
    /// The attempt must suspend until the wait is completed externally.
    Suspend(PendingWait),
}

/// Sent by task code to the executor to persist a checkpoint now.
#[derive(Debug)]
pub struct CheckpointRequest {
    pub ack: oneshot::Sender<Result<(), String>>,
}

/// Per-attempt resources a wait needs.
#[derive(Debug, Clone)]
pub struct WaitScope {
    pub run_id: String,
    pub index: u32,
    pub clock: DurableClock,
    pub usage: UsageMeter,
    pub cancel: AttemptCancellation,
    pub checkpoints: Option<mpsc::Sender<CheckpointRequest>>,
}

impl WaitScope {
    fn cancelled(&self) -> Interrupt {
        Interrupt::Cancelled(self.cancel.reason().unwrap_or(CancelReason::Requested {
            reason: "cancelled".to_string(),
        }))
    }
}

/// Strategy for durable waits and checkpoints.
#[async_trait]
pub trait RuntimeManager: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    async fn wait_for(&self, scope: &WaitScope, request: WaitRequest) -> Result<WaitDecision, RuntimeError>;

    async fn request_checkpoint(&self, scope: &WaitScope) -> Result<(), RuntimeError>;

    /// Deliver the result of the signal wait `id` of run `run_id`. Returns
    /// false if the runtime cannot deliver signals in process.
    fn complete_signal(&self, _run_id: &str, _id: &str, _value: serde_json::Value) -> bool {
        false
    }

    /// Forget in-process state kept for `run_id` once its attempt ends.
    fn release(&self, _run_id: &str) {}
}

/// Runtime manager for `mode`.
pub fn for_mode(mode: ExecutionMode) -> Arc<dyn RuntimeManager> {
    match mode {
        ExecutionMode::Dev => Arc::new(DevRuntimeManager::new()),
        ExecutionMode::Managed => Arc::new(ManagedRuntimeManager::new()),
    }
}
