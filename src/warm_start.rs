//! Client for the warm-start pool.
//!
//! Asking for a warm process never fails the caller: any error degrades to a
//! cold start.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::WorkerConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WarmStartError {
    #[error("no warm worker available: {reason}")]
    NoWarmWorkerAvailable { reason: String },

    #[error("failed to build warm-start client: {0}")]
    Client(String),
}

impl WarmStartError {
    fn unavailable(reason: impl Into<String>) -> Self {
        Self::NoWarmWorkerAvailable {
            reason: reason.into(),
        }
    }
}

/// A pre-initialized worker process handed out by the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmWorkerHandle {
    pub worker_id: String,
    #[serde(default)]
    pub machine: Option<String>,
    /// Where the warm process accepts its assignment, if it is remote.
    #[serde(default)]
    pub connection_url: Option<String>,
}

/// How the next attempt's process was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerProcess {
    Warm(WarmWorkerHandle),
    Cold,
}

impl WorkerProcess {
    pub fn is_warm(&self) -> bool {
        matches!(self, Self::Warm(_))
    }
}

#[derive(Serialize)]
struct WarmStartRequest<'a> {
    task_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    machine: Option<&'a str>,
}

/// Timeouts of a [`WarmStartClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmStartOptions {
    pub connect_timeout: Duration,
    /// How long the pool may hold the request open waiting for a process.
    pub long_poll_timeout: Duration,
}

impl Default for WarmStartOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            long_poll_timeout: Duration::from_secs(20),
        }
    }
}

/// Requests pre-initialized processes from the pool at
/// `POST {base_url}/api/v1/warm-start`.
///
/// The pool answers `200` with a [`WarmWorkerHandle`] or `204` when it has
/// nothing to offer within the long-poll window.
#[derive(Clone)]
pub struct WarmStartClient {
    http: reqwest::Client,
    base_url: String,
    options: WarmStartOptions,
}

impl WarmStartClient {
    pub fn new(base_url: &str) -> Result<Self, WarmStartError> {
        Self::with_options(base_url, WarmStartOptions::default())
    }

    pub fn with_options(base_url: &str, options: WarmStartOptions) -> Result<Self, WarmStartError> {
        let http = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.connect_timeout + options.long_poll_timeout)
            .build()
            .map_err(|e| WarmStartError::Client(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            options,
        })
    }

    /// Client for the configured pool URL, `None` when none is set.
    pub fn from_config(config: &WorkerConfig) -> Result<Option<Self>, WarmStartError> {
        config.warm_start_url.as_deref().map(Self::new).transpose()
    }

    pub fn options(&self) -> WarmStartOptions {
        self.options
    }

    pub async fn request_warm_worker(
        &self,
        task_id: &str,
        machine: Option<&str>,
    ) -> Result<WarmWorkerHandle, WarmStartError> {
        let response = self
            .http
            .post(format!("{}/api/v1/warm-start", self.base_url))
            .json(&WarmStartRequest { task_id, machine })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WarmStartError::unavailable("timed out waiting for the pool")
                } else {
                    WarmStartError::unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Err(WarmStartError::unavailable("pool is empty"));
        }
        if !status.is_success() {
            return Err(WarmStartError::unavailable(format!("pool returned {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| WarmStartError::unavailable(e.to_string()))?;
        serde_json::from_slice(&body)
            .map_err(|e| WarmStartError::unavailable(format!("invalid pool response: {e}")))
    }

    /// A warm process when the pool has one, a cold start otherwise.
    pub async fn acquire_or_cold_start(&self, task_id: &str, machine: Option<&str>) -> WorkerProcess {
        match self.request_warm_worker(task_id, machine).await {
            Ok(handle) => {
                tracing::info!(task_id, worker_id = %handle.worker_id, "Acquired warm worker");
                WorkerProcess::Warm(handle)
            }
            Err(e) => {
                tracing::info!(task_id, reason = %e, "Falling back to cold start");
                WorkerProcess::Cold
            }
        }
    }
}
