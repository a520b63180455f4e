//! What task code sees of the attempt it runs in.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::cancel::AttemptCancellation;
use crate::clock::DurableClock;
use crate::console::ConsoleInterceptor;
use crate::logger::TaskLogger;
use crate::metadata::RunMetadataStore;
use crate::runtime::{
    CheckpointRequest, ExecutionMode, Interrupt, RuntimeManager, WaitDecision, WaitRequest, WaitScope,
};
use crate::task::TaskError;
use crate::telemetry::AttemptContext;
use crate::usage::UsageMeter;
use crate::wait_until::WaitBarrier;

#[derive(Debug, Default)]
struct Replay {
    next_index: u32,
    completed: BTreeMap<u32, Value>,
    task_state: Option<Value>,
}

/// Attempt-scoped resources assembled by the executor.
pub(crate) struct ContextParts {
    pub attempt: AttemptContext,
    pub clock: DurableClock,
    pub usage: UsageMeter,
    pub cancel: AttemptCancellation,
    pub runtime: Arc<dyn RuntimeManager>,
    pub metadata: RunMetadataStore,
    pub waits: WaitBarrier,
    pub logger: TaskLogger,
    pub console: ConsoleInterceptor,
    pub checkpoints: Option<mpsc::Sender<CheckpointRequest>>,
    pub completed_waits: BTreeMap<u32, Value>,
    pub task_state: Option<Value>,
}

struct ContextInner {
    attempt: AttemptContext,
    clock: DurableClock,
    usage: UsageMeter,
    cancel: AttemptCancellation,
    runtime: Arc<dyn RuntimeManager>,
    metadata: RunMetadataStore,
    waits: WaitBarrier,
    logger: TaskLogger,
    console: ConsoleInterceptor,
    checkpoints: Option<mpsc::Sender<CheckpointRequest>>,
    replay: Mutex<Replay>,
}

/// Handle passed to a task handler.
///
/// Durable waits are numbered in the order the handler makes them. When an
/// attempt resumes from a checkpoint the handler runs again from the top and
/// waits that already completed return their recorded result immediately, so
/// handlers must make the same sequence of waits on every run.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

impl TaskContext {
    pub(crate) fn new(parts: ContextParts) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                attempt: parts.attempt,
                clock: parts.clock,
                usage: parts.usage,
                cancel: parts.cancel,
                runtime: parts.runtime,
                metadata: parts.metadata,
                waits: parts.waits,
                logger: parts.logger,
                console: parts.console,
                checkpoints: parts.checkpoints,
                replay: Mutex::new(Replay {
                    next_index: 0,
                    completed: parts.completed_waits,
                    task_state: parts.task_state,
                }),
            }),
        }
    }

    fn replay(&self) -> MutexGuard<'_, Replay> {
        self.inner.replay.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn attempt(&self) -> &AttemptContext {
        &self.inner.attempt
    }

    pub fn run_id(&self) -> &str {
        &self.inner.attempt.run_id
    }

    pub fn attempt_number(&self) -> u32 {
        self.inner.attempt.attempt_number
    }

    pub fn mode(&self) -> ExecutionMode {
        self.inner.runtime.mode()
    }

    pub fn clock(&self) -> &DurableClock {
        &self.inner.clock
    }

    /// Usage accumulated by this run so far.
    pub fn usage(&self) -> Duration {
        self.inner.usage.total()
    }

    pub fn metadata(&self) -> &RunMetadataStore {
        &self.inner.metadata
    }

    /// Barrier for background work that must finish before the attempt completes.
    pub fn wait_barrier(&self) -> &WaitBarrier {
        &self.inner.waits
    }

    pub fn logger(&self) -> &TaskLogger {
        &self.inner.logger
    }

    pub fn console(&self) -> &ConsoleInterceptor {
        &self.inner.console
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once the attempt is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Fail with [`Interrupt::Cancelled`] if the attempt was cancelled.
    ///
    /// Long-running handlers call this between units of work.
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        match self.inner.cancel.reason() {
            Some(reason) if self.is_cancelled() => Err(Interrupt::Cancelled(reason).into()),
            _ => Ok(()),
        }
    }

    fn scope(&self, index: u32) -> WaitScope {
        WaitScope {
            run_id: self.run_id().to_string(),
            index,
            clock: self.inner.clock.clone(),
            usage: self.inner.usage.clone(),
            cancel: self.inner.cancel.clone(),
            checkpoints: self.inner.checkpoints.clone(),
        }
    }

    /// Wait durably. Depending on the runtime this either waits in process or
    /// suspends the attempt, unwinding the handler with an interrupt.
    pub async fn schedule_durable_wait(&self, request: WaitRequest) -> Result<Value, TaskError> {
        let index = {
            let mut replay = self.replay();
            let index = replay.next_index;
            replay.next_index += 1;
            if let Some(result) = replay.completed.get(&index) {
                tracing::debug!(run_id = %self.run_id(), index, "Replaying completed wait");
                return Ok(result.clone());
            }
            index
        };

        match self.inner.runtime.wait_for(&self.scope(index), request).await? {
            WaitDecision::Resolved(result) => {
                self.replay().completed.insert(index, result.clone());
                Ok(result)
            }
            WaitDecision::Suspend(pending) => Err(Interrupt::Suspend(pending).into()),
        }
    }

    pub async fn wait_for(&self, duration: Duration) -> Result<(), TaskError> {
        self.schedule_durable_wait(WaitRequest::Duration(duration))
            .await
            .map(|_| ())
    }

    pub async fn wait_until(&self, at: DateTime<Utc>) -> Result<(), TaskError> {
        self.schedule_durable_wait(WaitRequest::Until(at))
            .await
            .map(|_| ())
    }

    /// Wait for an external signal and return its payload.
    pub async fn wait_for_signal(&self, id: impl Into<String>) -> Result<Value, TaskError> {
        self.schedule_durable_wait(WaitRequest::Signal(id.into())).await
    }

    /// Tell the runtime this is a safe point to checkpoint the attempt.
    pub async fn request_checkpoint(&self) -> Result<(), TaskError> {
        let scope = self.scope(self.replay().next_index);
        self.inner.runtime.request_checkpoint(&scope).await?;
        Ok(())
    }

    /// Progress to carry into the checkpoint, available again after resumption.
    pub fn save_state(&self, state: Value) {
        self.replay().task_state = Some(state);
    }

    pub fn state(&self) -> Option<Value> {
        self.replay().task_state.clone()
    }

    /// Completed waits and saved state, for the executor's checkpoint.
    pub(crate) fn replay_snapshot(&self) -> (BTreeMap<u32, Value>, Option<Value>) {
        let replay = self.replay();
        (replay.completed.clone(), replay.task_state.clone())
    }
}
