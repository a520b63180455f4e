//! Drives one attempt from assignment to final report.
//!
//! ```text
//! Idle -> Initializing -> Running -> Suspended --------> Reported
//!              |             |                              ^
//!              |             +----> Completing ------------+
//!              |             |          |                   |
//!              +-------------+----> Failed <--+             |
//!                                       +-------------------+
//! ```
//!
//! Every attempt-scoped resource (clock, usage meter, wait barrier, metadata
//! store, telemetry context, console capture) is created in `Initializing`
//! and torn down before the attempt is reported, so sequential attempts in
//! one process never observe each other's state.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::cancel::{AttemptCancellation, CancelReason};
use crate::catalog::{TaskCatalog, TaskDefinition};
use crate::checkpoint::{CheckpointError, CheckpointStore, InMemoryCheckpointStore, ResumptionState};
use crate::clock::DurableClock;
use crate::config::WorkerConfig;
use crate::console::ConsoleInterceptor;
use crate::context::{ContextParts, TaskContext};
use crate::engine::{
    Assignment, AttemptStatus, Heartbeat, ReportOutcome, ReportedError, RunEngine, StatusReport,
    StatusReporter,
};
use crate::logger::{LogLevel, TaskLogger};
use crate::metadata::{EngineSink, RunMetadataStore};
use crate::runtime::{self, CheckpointRequest, ExecutionMode, Interrupt, PendingWait, RuntimeManager};
use crate::task::TaskError;
use crate::telemetry::{
    record_span_exception, AttemptContext, AttemptContextStack, TelemetryPipeline, TracingExporter,
};
use crate::timeline::{self, TimelineMetric, TimelineRecorder};
use crate::timeout::UsageTimeoutEnforcer;
use crate::usage::{UsageMeter, UsageReporter};
use crate::wait_until::{DrainOutcome, WaitBarrier};

/// Lifecycle phase of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    Idle,
    Initializing,
    Running,
    Suspended,
    Completing,
    Failed,
    Reported,
}

impl AttemptPhase {
    pub fn can_transition_to(self, next: AttemptPhase) -> bool {
        use AttemptPhase::*;
        matches!(
            (self, next),
            (Idle, Initializing)
                | (Initializing, Running)
                | (Initializing, Failed)
                | (Running, Suspended)
                | (Running, Completing)
                | (Running, Failed)
                | (Completing, Reported)
                | (Completing, Failed)
                | (Suspended, Reported)
                | (Failed, Reported)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("invalid attempt transition from {from:?} to {to:?}")]
    InvalidTransition { from: AttemptPhase, to: AttemptPhase },
}

/// Why an attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptError {
    #[error("unknown task '{task_id}'")]
    UnknownTask { task_id: String },

    #[error("usage timeout exceeded: used {used_ms}ms of {limit_ms}ms")]
    UsageTimeoutExceeded { limit_ms: u64, used_ms: u64 },

    #[error("{message}")]
    Handler { message: String, retryable: bool },

    #[error("attempt cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("task panicked: {message}")]
    Panicked { message: String },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

impl AttemptError {
    /// Stable code sent to the Run Engine.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownTask { .. } => "UNKNOWN_TASK",
            Self::UsageTimeoutExceeded { .. } => "USAGE_TIMEOUT_EXCEEDED",
            Self::Handler { .. } => "HANDLER_ERROR",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Panicked { .. } => "PANICKED",
            Self::InvalidInput { .. } => "INVALID_INPUT",
        }
    }

    /// Whether the task's retry policy may schedule another attempt.
    pub fn retryable(&self) -> bool {
        match self {
            Self::UsageTimeoutExceeded { .. } => true,
            Self::Handler { retryable, .. } => *retryable,
            Self::UnknownTask { .. }
            | Self::Cancelled { .. }
            | Self::Panicked { .. }
            | Self::InvalidInput { .. } => false,
        }
    }

    fn from_cancel(reason: CancelReason) -> Self {
        match reason {
            CancelReason::UsageTimeout { limit, used } => Self::UsageTimeoutExceeded {
                limit_ms: limit.as_millis() as u64,
                used_ms: used.as_millis() as u64,
            },
            CancelReason::Requested { reason } => Self::Cancelled { reason },
        }
    }

    fn from_task_error(err: TaskError) -> Self {
        match err {
            TaskError::Retryable(e) => Self::Handler {
                message: format!("{e:#}"),
                retryable: true,
            },
            TaskError::Permanent(e) => Self::Handler {
                message: format!("{e:#}"),
                retryable: false,
            },
            TaskError::InvalidInput(message) => Self::InvalidInput { message },
            TaskError::Interrupted(Interrupt::Cancelled(reason)) => Self::from_cancel(reason),
            // Only reachable if a handler wraps a suspension in its own error.
            TaskError::Interrupted(Interrupt::Suspend(pending)) => Self::Handler {
                message: format!("suspension on wait #{} escaped the handler", pending.index),
                retryable: false,
            },
        }
    }
}

/// Final result of an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Completed {
        output: Value,
    },
    Suspended {
        pending: PendingWait,
    },
    Failed {
        error: AttemptError,
        /// Delay before the next attempt; `None` when no retry is allowed.
        retry_delay: Option<Duration>,
    },
}

/// One execution try of a task run, as tracked by its executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub run_id: String,
    pub attempt_number: u32,
    pub task_id: String,
    pub input: Value,
    pub phase: AttemptPhase,
    pub history: Vec<AttemptPhase>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub usage: Duration,
    pub outcome: Option<AttemptOutcome>,
}

impl Attempt {
    pub fn new(assignment: &Assignment) -> Self {
        Self {
            run_id: assignment.run_id.clone(),
            attempt_number: assignment.attempt_number,
            task_id: assignment.task_id.clone(),
            input: assignment.input.clone(),
            phase: AttemptPhase::Idle,
            history: vec![AttemptPhase::Idle],
            started_at: None,
            completed_at: None,
            usage: Duration::ZERO,
            outcome: None,
        }
    }

    pub fn transition(&mut self, next: AttemptPhase) -> Result<(), ExecutorError> {
        if !self.phase.can_transition_to(next) {
            return Err(ExecutorError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        self.history.push(next);
        Ok(())
    }

    fn advance(&mut self, next: AttemptPhase) {
        if let Err(e) = self.transition(next) {
            tracing::error!(run_id = %self.run_id, error = %e, "Attempt state machine violated");
        }
    }

    pub fn status(&self) -> Option<AttemptStatus> {
        self.outcome.as_ref().map(|o| match o {
            AttemptOutcome::Completed { .. } => AttemptStatus::Completed,
            AttemptOutcome::Suspended { .. } => AttemptStatus::Waiting,
            AttemptOutcome::Failed { .. } => AttemptStatus::Failed,
        })
    }
}

/// What [`TaskExecutor::execute`] hands back once the attempt is reported.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub attempt: Attempt,
    pub timeline: Vec<TimelineMetric>,
    /// Delivery of the final status report.
    pub delivery: ReportOutcome,
}

impl AttemptReport {
    pub fn status(&self) -> Option<AttemptStatus> {
        self.attempt.status()
    }

    pub fn error(&self) -> Option<&AttemptError> {
        match self.attempt.outcome {
            Some(AttemptOutcome::Failed { ref error, .. }) => Some(error),
            _ => None,
        }
    }
}

/// Knobs of a [`TaskExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub worker_id: String,
    pub default_max_duration: Option<Duration>,
    pub drain_timeout: Duration,
    pub timeout_grace: Duration,
    pub metadata_flush_interval: Duration,
    /// Period of usage heartbeats in managed mode.
    pub usage_report_interval: Duration,
    pub report_max_attempts: u32,
    pub log_level: LogLevel,
    /// Redirect process stdout/stderr into attempt logs.
    pub capture_console: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for ExecutorOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            default_max_duration: config.default_max_duration,
            drain_timeout: config.drain_timeout,
            timeout_grace: config.timeout_grace,
            metadata_flush_interval: config.metadata_flush_interval,
            usage_report_interval: config.heartbeat_interval,
            report_max_attempts: config.report_max_attempts,
            log_level: config.telemetry.log_level,
            capture_console: config.capture_console,
        }
    }
}

enum HandlerExit {
    Returned(Result<Result<Value, TaskError>, Box<dyn Any + Send>>),
    Cancelled(CancelReason),
}

enum Settled {
    Output(Value),
    Suspend(PendingWait),
    Failed(AttemptError),
}

/// Attempt-scoped resources shared by the executor's phases.
struct Scope {
    clock: DurableClock,
    usage: UsageMeter,
    timeline: TimelineRecorder,
    metadata: RunMetadataStore,
    waits: WaitBarrier,
    cancel: AttemptCancellation,
}

/// Finished attempts remembered to answer repeated assignments.
pub const FINISHED_ATTEMPTS_LIMIT: usize = 256;

/// Executes attempts one at a time.
///
/// An assignment for an attempt that already reached a terminal status is
/// answered from memory: the handler does not run again and nothing new is
/// reported.
pub struct TaskExecutor {
    catalog: TaskCatalog,
    engine: Arc<dyn RunEngine>,
    reporter: Arc<StatusReporter>,
    runtime: Arc<dyn RuntimeManager>,
    checkpoints: Arc<dyn CheckpointStore>,
    pipeline: TelemetryPipeline,
    console: ConsoleInterceptor,
    options: ExecutorOptions,
    current: Mutex<Option<AttemptCancellation>>,
    finished: Mutex<VecDeque<AttemptReport>>,
}

impl TaskExecutor {
    pub fn builder(catalog: TaskCatalog, engine: Arc<dyn RunEngine>) -> TaskExecutorBuilder {
        TaskExecutorBuilder::new(catalog, engine)
    }

    pub fn catalog(&self) -> &TaskCatalog {
        &self.catalog
    }

    pub fn reporter(&self) -> &Arc<StatusReporter> {
        &self.reporter
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeManager> {
        &self.runtime
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub fn pipeline(&self) -> &TelemetryPipeline {
        &self.pipeline
    }

    pub fn console(&self) -> &ConsoleInterceptor {
        &self.console
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    fn current(&self) -> MutexGuard<'_, Option<AttemptCancellation>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finished(&self) -> MutexGuard<'_, VecDeque<AttemptReport>> {
        self.finished.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The recorded report of a finished attempt.
    pub fn finished_attempt(&self, run_id: &str, attempt_number: u32) -> Option<AttemptReport> {
        let mut report = self
            .finished()
            .iter()
            .rev()
            .find(|r| r.attempt.run_id == run_id && r.attempt.attempt_number == attempt_number)
            .cloned()?;
        if matches!(report.delivery, ReportOutcome::Delivered | ReportOutcome::Duplicate)
            || self.reporter.is_delivered(run_id, attempt_number)
        {
            report.delivery = ReportOutcome::Duplicate;
        }
        Some(report)
    }

    fn remember(&self, report: &AttemptReport) {
        let mut finished = self.finished();
        finished.push_back(report.clone());
        while finished.len() > FINISHED_ATTEMPTS_LIMIT {
            finished.pop_front();
        }
    }

    /// Cancel the attempt currently running, if any.
    pub fn cancel_current(&self, reason: impl Into<String>) -> bool {
        match self.current().as_ref() {
            Some(cancel) => {
                cancel.cancel(CancelReason::Requested {
                    reason: reason.into(),
                });
                true
            }
            None => false,
        }
    }

    /// Run an assignment to its reported outcome. Assignments carrying a
    /// checkpoint are resumed from it.
    pub async fn execute(&self, mut assignment: Assignment) -> AttemptReport {
        match assignment.checkpoint.take() {
            Some(state) => self.resume(assignment, state).await,
            None => self.run(assignment, None).await,
        }
    }

    /// Resume a suspended attempt. The wait it was suspended on completes
    /// with the assignment's `resume_with` payload (or null).
    pub async fn resume(&self, mut assignment: Assignment, mut state: ResumptionState) -> AttemptReport {
        let result = assignment.resume_with.take().unwrap_or(Value::Null);
        state.complete_pending(result);
        if assignment.input.is_null() {
            assignment.input = state.input.clone();
        }
        self.run(assignment, Some(state)).await
    }

    async fn run(&self, assignment: Assignment, state: Option<ResumptionState>) -> AttemptReport {
        if let Some(previous) = self.finished_attempt(&assignment.run_id, assignment.attempt_number) {
            tracing::info!(
                run_id = %assignment.run_id,
                attempt = assignment.attempt_number,
                status = ?previous.status(),
                "Attempt already finished, not running it again"
            );
            return previous;
        }

        let run_id = assignment.run_id.clone();
        let span = tracing::info_span!(
            "attempt",
            run_id = %assignment.run_id,
            task_id = %assignment.task_id,
            attempt_number = assignment.attempt_number,
        );
        let report = self.run_inner(assignment, state).instrument(span).await;
        self.runtime.release(&run_id);
        if report.status().is_some_and(|s| s.is_terminal()) {
            self.remember(&report);
        }
        report
    }

    async fn run_inner(&self, assignment: Assignment, state: Option<ResumptionState>) -> AttemptReport {
        let mut attempt = Attempt::new(&assignment);
        attempt.advance(AttemptPhase::Initializing);

        let definition = match self.catalog.lookup(&assignment.task_id) {
            Ok(definition) => definition,
            Err(e) => {
                tracing::error!(error = %e, "Task lookup failed");
                attempt.advance(AttemptPhase::Failed);
                let error = AttemptError::UnknownTask {
                    task_id: assignment.task_id.clone(),
                };
                return self.report_failure(attempt, error, None, Vec::new(), None).await;
            }
        };

        let resumed = state.is_some();
        let scope = self.open_scope(&assignment, state.as_ref());
        *self.current() = Some(scope.cancel.clone());

        let attempt_context = AttemptContext {
            worker_id: Some(self.options.worker_id.clone()),
            ..AttemptContext::new(&attempt.run_id, &attempt.task_id, attempt.attempt_number)
        };
        let context_guard = self.pipeline.context_stack().push(attempt_context.clone());
        let console_guard = self.console.intercept(attempt_context.clone());
        let mut span = self.pipeline.start_span("attempt");
        span.set_attribute("attempt.resumed", resumed);

        attempt.started_at = Some(Utc::now());
        scope
            .timeline
            .record_or_log(if resumed { timeline::RESUMED } else { timeline::STARTED });
        if resumed {
            tracing::info!(usage_ms = scope.usage.total().as_millis() as u64, "Resuming attempt");
        }

        self.reporter
            .report(self.status_report(&attempt, AttemptStatus::Running, &scope))
            .await;

        attempt.advance(AttemptPhase::Running);
        scope.usage.start();

        let max_duration = definition
            .config
            .max_duration
            .or(self.options.default_max_duration);
        let enforcer = max_duration
            .map(|limit| UsageTimeoutEnforcer::spawn(scope.usage.clone(), limit, scope.cancel.clone()));
        let usage_reporter = (self.runtime.mode() == ExecutionMode::Managed).then(|| {
            UsageReporter::spawn(
                self.engine.clone(),
                self.options.worker_id.clone(),
                attempt.run_id.clone(),
                scope.usage.clone(),
                self.options.usage_report_interval,
            )
        });
        let flusher = scope.metadata.spawn_flusher(self.options.metadata_flush_interval);

        let (checkpoint_tx, checkpoint_rx) = mpsc::channel(1);
        let (completed_waits, task_state) = state
            .map(|s| (s.completed_waits, s.task_state))
            .unwrap_or_default();
        let ctx = TaskContext::new(ContextParts {
            attempt: attempt_context,
            clock: scope.clock.clone(),
            usage: scope.usage.clone(),
            cancel: scope.cancel.clone(),
            runtime: self.runtime.clone(),
            metadata: scope.metadata.clone(),
            waits: scope.waits.clone(),
            logger: TaskLogger::new(self.pipeline.clone(), self.options.log_level),
            console: self.console.clone(),
            checkpoints: Some(checkpoint_tx),
            completed_waits,
            task_state,
        });

        let exit = self
            .invoke(&definition, &attempt, &ctx, &scope, checkpoint_rx)
            .await;

        scope.usage.stop();
        drop(enforcer);
        drop(usage_reporter);
        attempt.usage = scope.usage.total();

        let settled = match exit {
            HandlerExit::Returned(Ok(Ok(output))) => Settled::Output(output),
            HandlerExit::Returned(Ok(Err(TaskError::Interrupted(Interrupt::Suspend(pending))))) => {
                Settled::Suspend(pending)
            }
            HandlerExit::Returned(Ok(Err(e))) => Settled::Failed(AttemptError::from_task_error(e)),
            HandlerExit::Returned(Err(payload)) => Settled::Failed(AttemptError::Panicked {
                message: panic_message(payload.as_ref()),
            }),
            HandlerExit::Cancelled(reason) => Settled::Failed(AttemptError::from_cancel(reason)),
        };

        let settled: Result<Value, AttemptError> = match settled {
            Settled::Output(output) => Ok(output),
            Settled::Failed(error) => Err(error),
            Settled::Suspend(pending) => {
                scope.timeline.record_or_log(timeline::SUSPENDED);
                let checkpoint = self.snapshot(&attempt, &scope, &ctx, Some(pending.clone()));
                match self.checkpoints.save(&checkpoint).await {
                    Ok(()) => {
                        attempt.advance(AttemptPhase::Suspended);
                        drop(flusher);
                        if let Err(e) = scope.metadata.flush().await {
                            tracing::warn!(error = %e, "Metadata flush before suspension failed");
                        }
                        span.end();
                        drop(console_guard);
                        self.flush_telemetry().await;
                        drop(context_guard);
                        self.current().take();

                        tracing::info!(
                            wait_index = pending.index,
                            usage_ms = attempt.usage.as_millis() as u64,
                            "Attempt suspended"
                        );
                        let mut report = self.status_report(&attempt, AttemptStatus::Waiting, &scope);
                        report.checkpoint = Some(checkpoint);
                        let delivery = self.reporter.report(report).await;
                        attempt.outcome = Some(AttemptOutcome::Suspended { pending });
                        attempt.advance(AttemptPhase::Reported);
                        return AttemptReport {
                            attempt,
                            timeline: scope.timeline.metrics(),
                            delivery,
                        };
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to persist checkpoint");
                        Err(AttemptError::Handler {
                            message: format!("failed to persist checkpoint: {e}"),
                            retryable: true,
                        })
                    }
                }
            }
        };

        attempt.advance(AttemptPhase::Completing);
        if let Err(ref error) = settled {
            record_span_exception(&mut span, error);
        }

        if let DrainOutcome::TimedOut { abandoned } = scope.waits.drain(self.options.drain_timeout).await {
            tracing::warn!(
                abandoned,
                timeout_ms = self.options.drain_timeout.as_millis() as u64,
                "Background work still outstanding, completing anyway"
            );
        }
        drop(flusher);
        if let Err(e) = scope.metadata.flush().await {
            tracing::warn!(error = %e, "Final metadata flush failed");
        }
        scope.timeline.record_or_log(timeline::COMPLETED);
        attempt.completed_at = Some(Utc::now());
        span.end();
        drop(console_guard);
        self.flush_telemetry().await;
        drop(context_guard);
        self.current().take();

        let timeline = scope.timeline.metrics();
        let report = match settled {
            Ok(output) => {
                tracing::info!(usage_ms = attempt.usage.as_millis() as u64, "Attempt completed");
                let mut report = self.status_report(&attempt, AttemptStatus::Completed, &scope);
                report.output = Some(output.clone());
                attempt.outcome = Some(AttemptOutcome::Completed { output });
                let delivery = self.reporter.report(report).await;
                attempt.advance(AttemptPhase::Reported);
                AttemptReport {
                    attempt,
                    timeline,
                    delivery,
                }
            }
            Err(error) => {
                attempt.advance(AttemptPhase::Failed);
                self.report_failure(attempt, error, Some(definition.as_ref()), timeline, Some(&scope))
                    .await
            }
        };

        if let Err(e) = self.checkpoints.remove(&report.attempt.run_id).await {
            tracing::warn!(error = %e, "Failed to remove checkpoint of finished attempt");
        }
        report
    }

    fn open_scope(&self, assignment: &Assignment, state: Option<&ResumptionState>) -> Scope {
        let clock = state
            .map(|s| DurableClock::restore(s.clock))
            .unwrap_or_default();
        let usage = UsageMeter::with_baseline(
            clock.clone(),
            Duration::from_millis(state.map(|s| s.usage_ms).unwrap_or_default()),
        );
        let timeline = TimelineRecorder::restore(
            clock.clone(),
            state.map(|s| s.timeline.clone()).unwrap_or_default(),
        );
        let metadata = RunMetadataStore::restore(
            assignment.run_id.clone(),
            Arc::new(EngineSink(self.engine.clone())),
            state.map(|s| s.metadata.clone()).unwrap_or_default(),
        );
        Scope {
            clock,
            usage,
            timeline,
            metadata,
            waits: WaitBarrier::new(),
            cancel: AttemptCancellation::new(),
        }
    }

    /// Run the handler until it returns or the attempt is cancelled, serving
    /// checkpoint requests in between.
    async fn invoke(
        &self,
        definition: &TaskDefinition,
        attempt: &Attempt,
        ctx: &TaskContext,
        scope: &Scope,
        mut checkpoint_rx: mpsc::Receiver<CheckpointRequest>,
    ) -> HandlerExit {
        let handler = definition.handler.clone();
        let fut = AssertUnwindSafe(handler.run_erased(attempt.input.clone(), ctx)).catch_unwind();
        tokio::pin!(fut);

        loop {
            tokio::select! {
                biased;
                result = &mut fut => return HandlerExit::Returned(result),
                Some(request) = checkpoint_rx.recv() => {
                    let result = self.checkpoint_now(attempt, scope, ctx).await;
                    let _ = request.ack.send(result.map_err(|e| e.to_string()));
                }
                _ = scope.cancel.cancelled() => {
                    let reason = scope.cancel.reason().unwrap_or(CancelReason::Requested {
                        reason: "cancelled".to_string(),
                    });
                    tracing::warn!(reason = ?reason, "Interrupting handler");
                    if !self.options.timeout_grace.is_zero() {
                        // The handler may finish its own cleanup; its result is discarded.
                        let _ = tokio::time::timeout(self.options.timeout_grace, &mut fut).await;
                    }
                    return HandlerExit::Cancelled(reason);
                }
            }
        }
    }

    async fn checkpoint_now(&self, attempt: &Attempt, scope: &Scope, ctx: &TaskContext) -> Result<(), CheckpointError> {
        let state = self.snapshot(attempt, scope, ctx, None);
        self.checkpoints.save(&state).await?;
        tracing::info!("Checkpoint persisted, process may be evicted");

        if self.runtime.mode() == ExecutionMode::Managed {
            let heartbeat = Heartbeat {
                run_id: Some(attempt.run_id.clone()),
                usage_ms: Some(state.usage_ms),
                evictable: true,
                ..Heartbeat::new(self.options.worker_id.clone())
            };
            if let Err(e) = self.engine.heartbeat(&heartbeat).await {
                tracing::warn!(error = %e, "Failed to announce checkpoint");
            }
        }
        Ok(())
    }

    fn snapshot(
        &self,
        attempt: &Attempt,
        scope: &Scope,
        ctx: &TaskContext,
        pending_wait: Option<PendingWait>,
    ) -> ResumptionState {
        let (completed_waits, task_state) = ctx.replay_snapshot();
        ResumptionState {
            run_id: attempt.run_id.clone(),
            attempt_number: attempt.attempt_number,
            task_id: attempt.task_id.clone(),
            input: attempt.input.clone(),
            completed_waits,
            pending_wait,
            clock: scope.clock.snapshot(),
            usage_ms: scope.usage.total().as_millis() as u64,
            metadata: scope.metadata.current(),
            timeline: scope.timeline.metrics(),
            task_state,
            created_at: Utc::now(),
        }
    }

    fn status_report(&self, attempt: &Attempt, status: AttemptStatus, scope: &Scope) -> StatusReport {
        let mut report = StatusReport::new(&attempt.run_id, attempt.attempt_number, status);
        report.usage_ms = scope.usage.total().as_millis() as u64;
        report.timeline = scope.timeline.metrics();
        report
    }

    async fn flush_telemetry(&self) {
        if let Err(e) = self.pipeline.flush().await {
            tracing::warn!(error = %e, "Telemetry flush failed");
        }
    }

    async fn report_failure(
        &self,
        mut attempt: Attempt,
        error: AttemptError,
        definition: Option<&TaskDefinition>,
        timeline: Vec<TimelineMetric>,
        scope: Option<&Scope>,
    ) -> AttemptReport {
        let retry_delay = match definition {
            Some(definition) if error.retryable() => {
                definition.config.retry.delay_for_attempt(attempt.attempt_number)
            }
            _ => None,
        };
        tracing::error!(
            error = %error,
            code = error.code(),
            retry = retry_delay.is_some(),
            "Attempt failed"
        );

        let mut report = StatusReport::new(&attempt.run_id, attempt.attempt_number, AttemptStatus::Failed);
        if let Some(scope) = scope {
            report.usage_ms = scope.usage.total().as_millis() as u64;
        }
        report.timeline = timeline.clone();
        report.error = Some(ReportedError {
            code: error.code().to_string(),
            message: error.to_string(),
            retryable: retry_delay.is_some(),
            retry_delay_ms: retry_delay.map(|d| d.as_millis() as u64),
        });

        let delivery = self.reporter.report(report).await;
        attempt.outcome = Some(AttemptOutcome::Failed { error, retry_delay });
        attempt.advance(AttemptPhase::Reported);
        AttemptReport {
            attempt,
            timeline,
            delivery,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Builder for constructing a [`TaskExecutor`].
pub struct TaskExecutorBuilder {
    catalog: TaskCatalog,
    engine: Arc<dyn RunEngine>,
    runtime: Option<Arc<dyn RuntimeManager>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    pipeline: Option<TelemetryPipeline>,
    reporter: Option<Arc<StatusReporter>>,
    options: ExecutorOptions,
}

impl TaskExecutorBuilder {
    pub fn new(catalog: TaskCatalog, engine: Arc<dyn RunEngine>) -> Self {
        Self {
            catalog,
            engine,
            runtime: None,
            checkpoints: None,
            pipeline: None,
            reporter: None,
            options: ExecutorOptions::default(),
        }
    }

    /// Select the runtime manager for `mode`.
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.runtime = Some(runtime::for_mode(mode));
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn RuntimeManager>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Telemetry pipeline for attempt spans, task logs and console output.
    pub fn telemetry(mut self, pipeline: TelemetryPipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Share a status reporter, e.g. one the worker loop retries pending reports on.
    pub fn reporter(mut self, reporter: Arc<StatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> TaskExecutor {
        let pipeline = self.pipeline.unwrap_or_else(|| {
            TelemetryPipeline::new(Arc::new(TracingExporter), AttemptContextStack::new())
        });
        let reporter = self.reporter.unwrap_or_else(|| {
            Arc::new(StatusReporter::new(
                self.engine.clone(),
                self.options.report_max_attempts,
            ))
        });
        TaskExecutor {
            catalog: self.catalog,
            reporter,
            runtime: self
                .runtime
                .unwrap_or_else(|| runtime::for_mode(ExecutionMode::Dev)),
            checkpoints: self
                .checkpoints
                .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
            console: ConsoleInterceptor::with_process_capture(
                pipeline.clone(),
                self.options.capture_console,
            ),
            pipeline,
            engine: self.engine,
            options: self.options,
            current: Mutex::new(None),
            finished: Mutex::new(VecDeque::new()),
        }
    }
}
