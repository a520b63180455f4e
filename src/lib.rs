//! # runworker
//!
//! Worker-side runtime for durable background tasks.
//!
//! A worker process receives attempt assignments from a Run Engine, runs the
//! registered task handler, and reports the outcome. While a handler runs the
//! worker meters its usage, enforces its usage limit, keeps run metadata in
//! sync, captures console output and logs as telemetry, and records timeline
//! metrics. Durable waits either block in process (dev mode) or checkpoint
//! and suspend the attempt so another process can resume it later (managed
//! mode).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use runworker::{task_fn, Assignment, InMemoryRunEngine, TaskCatalog, TaskExecutor};
//!
//! let catalog = TaskCatalog::builder()
//!     .register(task_fn("send-email", |input, ctx| async move {
//!         ctx.logger().info("sending");
//!         Ok(serde_json::json!({ "sent": true, "to": input["to"] }))
//!     }))?
//!     .build();
//!
//! let engine = Arc::new(InMemoryRunEngine::new());
//! let executor = TaskExecutor::builder(catalog, engine).build();
//! let report = executor
//!     .execute(Assignment::new("run_1", "send-email", json!({ "to": "a@b.c" })))
//!     .await;
//! ```
//!
//! ## Durable waits
//!
//! ```rust,ignore
//! task_fn("nightly-digest", |_input, ctx| async move {
//!     ctx.wait_for(Duration::from_secs(3600)).await?;
//!     let approval = ctx.wait_for_signal("approval").await?;
//!     Ok(approval)
//! })
//! ```
//!
//! Waits are numbered in call order. A resumed attempt replays the handler
//! from the top; completed waits return their recorded result immediately.
//!
//! ## Running a worker
//!
//! ```rust,ignore
//! let config = WorkerConfig::from_env()?;
//! let _telemetry = TracingSdk::init(&config.telemetry)?;
//! Worker::from_config(catalog, &config)?
//!     .run(shutdown_token)
//!     .await;
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable the SQLite-backed checkpoint store

pub mod cancel;
pub mod catalog;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod console;
pub mod context;
pub mod engine;
pub mod executor;
pub mod logger;
pub mod metadata;
pub mod retry;
pub mod runtime;
pub mod task;
pub mod telemetry;
pub mod timeline;
pub mod timeout;
pub mod usage;
pub mod wait_until;
pub mod warm_start;
pub mod worker;

pub use cancel::{AttemptCancellation, CancelReason};
pub use catalog::{CatalogError, TaskCatalog, TaskCatalogBuilder, TaskDefinition};
pub use checkpoint::{CheckpointError, CheckpointStore, InMemoryCheckpointStore, ResumptionState};
pub use clock::{ClockSnapshot, DurableClock};
pub use config::{ConfigError, TelemetryConfig, WorkerConfig};
pub use console::{ConsoleInterceptor, ConsoleSource, ConsoleStream};
pub use context::TaskContext;
pub use engine::{
    Assignment, AttemptStatus, EngineError, Heartbeat, HttpRunEngineClient, InMemoryRunEngine,
    ReportOutcome, ReportedError, RunEngine, StatusReport, StatusReporter,
};
pub use executor::{
    Attempt, AttemptError, AttemptOutcome, AttemptPhase, AttemptReport, ExecutorError,
    ExecutorOptions, TaskExecutor, TaskExecutorBuilder,
};
pub use logger::{LogLevel, TaskLogger};
pub use metadata::RunMetadataStore;
pub use retry::RetryPolicy;
pub use runtime::{
    DevRuntimeManager, ExecutionMode, Interrupt, ManagedRuntimeManager, PendingWait,
    RuntimeManager, WaitRequest,
};
pub use task::{task_fn, FnTask, Task, TaskConfig, TaskError};
pub use telemetry::{TelemetryPipeline, TracingSdk};
pub use timeline::{TimelineMetric, TimelineRecorder};
pub use usage::UsageMeter;
pub use wait_until::{DrainOutcome, WaitBarrier};
pub use warm_start::{WarmStartClient, WarmStartError, WarmWorkerHandle, WorkerProcess};
pub use worker::{Dispatch, Worker, WorkerBuilder, WorkerError};

#[cfg(feature = "sqlite")]
pub use checkpoint::SqliteCheckpointStore;
