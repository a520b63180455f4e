use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

use super::{ExecutionMode, RuntimeError, RuntimeManager, WaitDecision, WaitRequest, WaitScope};

type SignalKey = (String, String);

#[derive(Debug, Default)]
struct Signals {
    waiting: HashMap<SignalKey, oneshot::Sender<Value>>,
    /// Completions that arrived before anyone waited on them.
    early: HashMap<SignalKey, Value>,
}

/// Usage stopped and the clock paused until dropped.
struct PausedAccounting<'a> {
    scope: &'a WaitScope,
    was_running: bool,
    was_paused: bool,
}

impl<'a> PausedAccounting<'a> {
    fn start(scope: &'a WaitScope) -> Self {
        let was_running = scope.usage.stop();
        let was_paused = scope.clock.is_paused();
        scope.clock.pause();
        Self {
            scope,
            was_running,
            was_paused,
        }
    }
}

impl Drop for PausedAccounting<'_> {
    fn drop(&mut self) {
        if !self.was_paused {
            self.scope.clock.resume();
        }
        if self.was_running {
            self.scope.usage.start();
        }
    }
}

/// Simulates durable waits inside the current process.
///
/// Waiting sleeps with the durable clock paused and usage accounting
/// stopped, so a wait never counts against the task's usage budget.
/// Signals are scoped to the run that waits on them.
#[derive(Debug, Default)]
pub struct DevRuntimeManager {
    signals: Mutex<Signals>,
}

impl DevRuntimeManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn signals(&self) -> MutexGuard<'_, Signals> {
        self.signals.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn paused<F>(&self, scope: &WaitScope, fut: F) -> Result<Value, RuntimeError>
    where
        F: std::future::Future<Output = Value> + Send,
    {
        // Accounting comes back when the guard drops, including when the
        // whole wait is dropped by the executor.
        let _accounting = PausedAccounting::start(scope);
        tokio::select! {
            value = fut => Ok(value),
            _ = scope.cancel.cancelled() => Err(scope.cancelled().into()),
        }
    }
}

#[async_trait]
impl RuntimeManager for DevRuntimeManager {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Dev
    }

    async fn wait_for(&self, scope: &WaitScope, request: WaitRequest) -> Result<WaitDecision, RuntimeError> {
        if scope.cancel.is_cancelled() {
            return Err(scope.cancelled().into());
        }

        let value = match request {
            WaitRequest::Signal(id) => {
                let key = (scope.run_id.clone(), id);
                let rx = {
                    let mut signals = self.signals();
                    if let Some(value) = signals.early.remove(&key) {
                        return Ok(WaitDecision::Resolved(value));
                    }
                    let (tx, rx) = oneshot::channel();
                    signals.waiting.insert(key.clone(), tx);
                    rx
                };
                tracing::debug!(run_id = %key.0, signal = %key.1, index = scope.index, "Waiting for signal");
                // A replaced waiter sees its sender dropped and resolves with null.
                self.paused(scope, async move { rx.await.unwrap_or(Value::Null) })
                    .await?
            }
            timed => {
                let remaining = timed.remaining(Utc::now()).unwrap_or_default();
                tracing::debug!(
                    index = scope.index,
                    wait_ms = remaining.as_millis() as u64,
                    "Simulating durable wait"
                );
                self.paused(scope, async move {
                    tokio::time::sleep(remaining).await;
                    Value::Null
                })
                .await?
            }
        };
        Ok(WaitDecision::Resolved(value))
    }

    async fn request_checkpoint(&self, _scope: &WaitScope) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn complete_signal(&self, run_id: &str, id: &str, value: Value) -> bool {
        let key = (run_id.to_string(), id.to_string());
        let mut signals = self.signals();
        match signals.waiting.remove(&key) {
            Some(tx) => {
                if let Err(value) = tx.send(value) {
                    signals.early.insert(key, value);
                }
            }
            None => {
                signals.early.insert(key, value);
            }
        }
        true
    }

    fn release(&self, run_id: &str) {
        let mut signals = self.signals();
        signals.waiting.retain(|(run, _), _| run != run_id);
        signals.early.retain(|(run, _), _| run != run_id);
    }
}
