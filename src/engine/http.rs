//! HTTP implementation of the worker protocol.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use super::{Assignment, EngineError, Heartbeat, MetadataMap, RunEngine, StatusReport};
use crate::config::WorkerConfig;

/// JSON-over-HTTP client for the Run Engine.
///
/// Routes, relative to the base URL:
/// - `POST /api/v1/worker/dequeue` → `200` with an [`Assignment`] or `204`
/// - `POST /api/v1/worker/report`
/// - `POST /api/v1/worker/heartbeat`
/// - `PUT /api/v1/runs/{run_id}/metadata`
#[derive(Clone)]
pub struct HttpRunEngineClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct DequeueRequest<'a> {
    worker_id: &'a str,
}

impl HttpRunEngineClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Client for the configured engine URL, `None` when none is set.
    pub fn from_config(config: &WorkerConfig) -> Result<Option<Self>, EngineError> {
        config
            .engine_url
            .as_deref()
            .map(|url| Self::new(url, config.engine_timeout))
            .transpose()
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, EngineError> {
        let mut request = self.http.request(method, self.url(path)).json(body);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(EngineError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, EngineError> {
        let body = response
            .bytes()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| EngineError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl RunEngine for HttpRunEngineClient {
    async fn dequeue(&self, worker_id: &str) -> Result<Option<Assignment>, EngineError> {
        let response = self
            .send(
                reqwest::Method::POST,
                "/api/v1/worker/dequeue",
                &DequeueRequest { worker_id },
            )
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Self::parse(response).await.map(Some)
    }

    async fn report(&self, report: &StatusReport) -> Result<(), EngineError> {
        self.send(reqwest::Method::POST, "/api/v1/worker/report", report)
            .await
            .map(|_| ())
    }

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), EngineError> {
        self.send(reqwest::Method::POST, "/api/v1/worker/heartbeat", heartbeat)
            .await
            .map(|_| ())
    }

    async fn flush_metadata(&self, run_id: &str, metadata: &MetadataMap) -> Result<(), EngineError> {
        let path = format!("/api/v1/runs/{run_id}/metadata");
        self.send(reqwest::Method::PUT, &path, metadata)
            .await
            .map(|_| ())
    }
}
