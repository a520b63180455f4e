//! One-shot cancellation signal for a running attempt.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why an attempt was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Accumulated usage reached the task's maximum duration.
    UsageTimeout { limit: Duration, used: Duration },
    /// The Run Engine (or the worker shutting down) asked for cancellation.
    Requested { reason: String },
}

/// Cancellation shared between the executor, the timeout enforcer and task code.
///
/// The first reason recorded wins; later calls only cancel the token again,
/// which is a no-op.
#[derive(Debug, Clone, Default)]
pub struct AttemptCancellation {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl AttemptCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().cloned()
    }

    /// Resolves once the attempt has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
