//! Client side of the Run Engine worker protocol.
//!
//! The Run Engine assigns attempts to workers and records their outcomes.
//! This module defines the messages a worker exchanges with it and the
//! [`RunEngine`] trait the executor reports through.

mod http;
mod memory;
mod reporter;

pub use http::HttpRunEngineClient;
pub use memory::InMemoryRunEngine;
pub use reporter::{ReportOutcome, StatusReporter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::ResumptionState;
use crate::timeline::TimelineMetric;

/// JSON object used for run metadata.
pub type MetadataMap = serde_json::Map<String, serde_json::Value>;

/// An attempt handed to this worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub run_id: String,
    pub attempt_number: u32,
    pub task_id: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub machine: Option<String>,
    /// Resumption state when re-invoking a suspended attempt.
    #[serde(default)]
    pub checkpoint: Option<ResumptionState>,
    /// Result delivered to the durable wait the attempt suspended on.
    #[serde(default)]
    pub resume_with: Option<serde_json::Value>,
}

impl Assignment {
    pub fn new(run_id: impl Into<String>, task_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            run_id: run_id.into(),
            attempt_number: 1,
            task_id: task_id.into(),
            input,
            machine: None,
            checkpoint: None,
            resume_with: None,
        }
    }

    pub fn with_attempt(mut self, attempt_number: u32) -> Self {
        self.attempt_number = attempt_number;
        self
    }
}

/// Attempt status as seen by the Run Engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Waiting,
    Completed,
    Failed,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Failure details attached to a `failed` report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedError {
    /// Stable classification, e.g. `UNKNOWN_TASK` or `USAGE_TIMEOUT_EXCEEDED`.
    pub code: String,
    pub message: String,
    pub retryable: bool,
    /// Suggested delay before the next attempt, when one is allowed.
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
}

/// One status transition of an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub run_id: String,
    pub attempt_number: u32,
    pub status: AttemptStatus,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<ReportedError>,
    pub usage_ms: u64,
    #[serde(default)]
    pub timeline: Vec<TimelineMetric>,
    #[serde(default)]
    pub checkpoint: Option<ResumptionState>,
}

impl StatusReport {
    pub fn new(run_id: impl Into<String>, attempt_number: u32, status: AttemptStatus) -> Self {
        Self {
            run_id: run_id.into(),
            attempt_number,
            status,
            output: None,
            error: None,
            usage_ms: 0,
            timeline: Vec::new(),
            checkpoint: None,
        }
    }
}

/// Periodic liveness signal, optionally carrying the current attempt's usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub usage_ms: Option<u64>,
    /// Set after a checkpoint: the process may be evicted without losing work.
    #[serde(default)]
    pub evictable: bool,
}

impl Heartbeat {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            run_id: None,
            usage_ms: None,
            evictable: false,
        }
    }
}

/// Error type for Run Engine calls.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("run engine rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl EngineError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Worker protocol operations.
#[async_trait]
pub trait RunEngine: Send + Sync {
    /// Ask for the next attempt to execute. `None` means nothing is queued.
    async fn dequeue(&self, worker_id: &str) -> Result<Option<Assignment>, EngineError>;

    /// Record a status transition. Duplicate terminal reports must be ignored.
    async fn report(&self, report: &StatusReport) -> Result<(), EngineError>;

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), EngineError>;

    /// Replace the stored metadata record of a run.
    async fn flush_metadata(&self, run_id: &str, metadata: &MetadataMap) -> Result<(), EngineError>;
}
