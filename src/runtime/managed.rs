use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::oneshot;

use super::{
    CheckpointRequest, ExecutionMode, PendingWait, RuntimeError, RuntimeManager, WaitDecision,
    WaitRequest, WaitScope,
};

/// Runtime used under the Run Engine.
///
/// A wait does not block: it asks the executor to suspend the attempt on a
/// [`PendingWait`]. The Run Engine re-dispatches the attempt once the wait
/// completes and the handler replays up to the same point.
#[derive(Debug, Default)]
pub struct ManagedRuntimeManager;

impl ManagedRuntimeManager {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RuntimeManager for ManagedRuntimeManager {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Managed
    }

    async fn wait_for(&self, scope: &WaitScope, request: WaitRequest) -> Result<WaitDecision, RuntimeError> {
        if scope.cancel.is_cancelled() {
            return Err(scope.cancelled().into());
        }
        let now = Utc::now();
        if request.remaining(now) == Some(Duration::ZERO) {
            return Ok(WaitDecision::Resolved(serde_json::Value::Null));
        }

        tracing::info!(index = scope.index, request = ?request, "Suspending attempt on durable wait");
        Ok(WaitDecision::Suspend(PendingWait {
            index: scope.index,
            request,
            requested_at: now,
        }))
    }

    async fn request_checkpoint(&self, scope: &WaitScope) -> Result<(), RuntimeError> {
        let Some(ref checkpoints) = scope.checkpoints else {
            tracing::debug!("No executor listening for checkpoints");
            return Ok(());
        };

        let (ack, rx) = oneshot::channel();
        checkpoints
            .send(CheckpointRequest { ack })
            .await
            .map_err(|_| RuntimeError::Checkpoint("executor is not accepting checkpoints".to_string()))?;

        tokio::select! {
            result = rx => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(RuntimeError::Checkpoint(e)),
                Err(_) => Err(RuntimeError::Checkpoint("checkpoint request dropped".to_string())),
            },
            _ = scope.cancel.cancelled() => Err(scope.cancelled().into()),
        }
    }
}
