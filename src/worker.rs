//! Long-running worker loop: poll the Run Engine, execute, report.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalog::TaskCatalog;
use crate::config::WorkerConfig;
use crate::engine::{Assignment, EngineError, Heartbeat, HttpRunEngineClient, InMemoryRunEngine, RunEngine};
use crate::executor::{AttemptReport, ExecutorOptions, TaskExecutor};
use crate::warm_start::{WarmStartClient, WarmStartError, WorkerProcess};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("run engine client: {0}")]
    Engine(#[from] EngineError),

    #[error("warm start client: {0}")]
    WarmStart(#[from] WarmStartError),
}

/// One assignment taken from the Run Engine and run to its report.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub process: WorkerProcess,
    pub report: AttemptReport,
}

/// Polls for assignments and executes them one at a time.
pub struct Worker {
    executor: Arc<TaskExecutor>,
    engine: Arc<dyn RunEngine>,
    warm_start: Option<WarmStartClient>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
}

impl Worker {
    pub fn builder(executor: Arc<TaskExecutor>, engine: Arc<dyn RunEngine>) -> WorkerBuilder {
        WorkerBuilder::new(executor, engine)
    }

    /// Assemble a worker from its configuration: the HTTP Run Engine client
    /// at `engine_url` (an in-memory engine when unset, dev mode only), the
    /// executor for the configured mode and the warm-start client.
    pub fn from_config(catalog: TaskCatalog, config: &WorkerConfig) -> Result<Self, WorkerError> {
        let engine: Arc<dyn RunEngine> = match HttpRunEngineClient::from_config(config)? {
            Some(client) => Arc::new(client),
            None => {
                tracing::warn!("No Run Engine URL configured, using an in-memory engine");
                Arc::new(InMemoryRunEngine::new())
            }
        };
        let executor = TaskExecutor::builder(catalog, engine.clone())
            .mode(config.mode)
            .options(ExecutorOptions::from(config))
            .build();
        Ok(WorkerBuilder::new(Arc::new(executor), engine)
            .config(config)?
            .build())
    }

    pub fn engine(&self) -> &Arc<dyn RunEngine> {
        &self.engine
    }

    pub fn warm_start(&self) -> Option<&WarmStartClient> {
        self.warm_start.as_ref()
    }

    pub fn worker_id(&self) -> &str {
        &self.executor.options().worker_id
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    /// Run until `shutdown` is cancelled. An attempt in progress is finished
    /// and reported before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            worker_id = %self.worker_id(),
            tasks = ?self.executor.catalog().ids(),
            mode = %self.executor.runtime().mode(),
            "Worker started"
        );
        let heartbeats = self.spawn_heartbeats();

        while !shutdown.is_cancelled() {
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to dequeue");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        heartbeats.abort();
        let undelivered = self.executor.reporter().pending().len();
        if undelivered > 0 && self.executor.reporter().retry_pending().await < undelivered {
            tracing::error!(worker_id = %self.worker_id(), "Worker stopped with undelivered status reports");
        }
        tracing::info!(worker_id = %self.worker_id(), "Worker stopped");
    }

    /// Take at most one assignment and execute it.
    pub async fn run_once(&self) -> Result<Option<Dispatch>, EngineError> {
        let delivered = self.executor.reporter().retry_pending().await;
        if delivered > 0 {
            tracing::info!(delivered, "Delivered deferred status reports");
        }

        let Some(assignment) = self.engine.dequeue(self.worker_id()).await? else {
            return Ok(None);
        };
        tracing::info!(
            run_id = %assignment.run_id,
            task_id = %assignment.task_id,
            attempt = assignment.attempt_number,
            "Received assignment"
        );

        let process = self.acquire_process(&assignment).await;
        let assignment = self.attach_checkpoint(assignment).await;
        let report = self.executor.execute(assignment).await;
        Ok(Some(Dispatch { process, report }))
    }

    async fn acquire_process(&self, assignment: &Assignment) -> WorkerProcess {
        match self.warm_start {
            Some(ref client) => {
                client
                    .acquire_or_cold_start(&assignment.task_id, assignment.machine.as_deref())
                    .await
            }
            None => WorkerProcess::Cold,
        }
    }

    /// Use the locally stored checkpoint when the Run Engine did not send one.
    async fn attach_checkpoint(&self, mut assignment: Assignment) -> Assignment {
        if assignment.checkpoint.is_some() {
            return assignment;
        }
        match self.executor.checkpoints().load(&assignment.run_id).await {
            Ok(Some(state)) if state.attempt_number == assignment.attempt_number => {
                tracing::info!(run_id = %assignment.run_id, "Resuming from stored checkpoint");
                assignment.checkpoint = Some(state);
            }
            Ok(Some(state)) => {
                tracing::debug!(
                    run_id = %assignment.run_id,
                    stored_attempt = state.attempt_number,
                    "Ignoring checkpoint of another attempt"
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(run_id = %assignment.run_id, error = %e, "Failed to load checkpoint");
            }
        }
        assignment
    }

    fn spawn_heartbeats(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let worker_id = self.worker_id().to_string();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.heartbeat(&Heartbeat::new(worker_id.clone())).await {
                    tracing::warn!(worker_id = %worker_id, error = %e, "Heartbeat failed");
                }
            }
        })
    }
}

/// Builder for constructing a [`Worker`].
pub struct WorkerBuilder {
    executor: Arc<TaskExecutor>,
    engine: Arc<dyn RunEngine>,
    warm_start: Option<WarmStartClient>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
}

impl WorkerBuilder {
    pub fn new(executor: Arc<TaskExecutor>, engine: Arc<dyn RunEngine>) -> Self {
        Self {
            executor,
            engine,
            warm_start: None,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(20),
        }
    }

    /// Take the heartbeat interval and warm-start pool from the worker
    /// configuration.
    pub fn config(mut self, config: &WorkerConfig) -> Result<Self, WarmStartError> {
        self.heartbeat_interval = config.heartbeat_interval;
        if let Some(client) = WarmStartClient::from_config(config)? {
            self.warm_start = Some(client);
        }
        Ok(self)
    }

    /// Set how long to sleep when the Run Engine has nothing to hand out.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Ask the warm-start pool for a process before each attempt.
    pub fn warm_start(mut self, client: WarmStartClient) -> Self {
        self.warm_start = Some(client);
        self
    }

    pub fn build(self) -> Worker {
        Worker {
            executor: self.executor,
            engine: self.engine,
            warm_start: self.warm_start,
            poll_interval: self.poll_interval,
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}
