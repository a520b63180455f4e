//! Usage-based deadline enforcement.

use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cancel::{AttemptCancellation, CancelReason};
use crate::usage::UsageMeter;

/// Cancels an attempt once its metered usage reaches a bound.
///
/// The enforcer only counts down while the meter is running: it subscribes
/// to start/stop transitions and never sleeps against wall time while usage
/// accounting is stopped. Dropping the enforcer stops it.
pub struct UsageTimeoutEnforcer {
    limit: Duration,
    handle: JoinHandle<()>,
}

impl UsageTimeoutEnforcer {
    pub fn spawn(meter: UsageMeter, limit: Duration, cancel: AttemptCancellation) -> Self {
        let handle = tokio::spawn(enforce(meter, limit, cancel));
        Self { limit, handle }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }
}

impl Drop for UsageTimeoutEnforcer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn enforce(meter: UsageMeter, limit: Duration, cancel: AttemptCancellation) {
    let mut transitions = meter.subscribe();
    loop {
        let running = transitions.borrow_and_update().running;
        if !running {
            if transitions.changed().await.is_err() {
                return;
            }
            continue;
        }

        let used = meter.total();
        if used >= limit {
            tracing::warn!(
                limit_ms = limit.as_millis() as u64,
                used_ms = used.as_millis() as u64,
                "Usage limit reached, cancelling attempt"
            );
            cancel.cancel(CancelReason::UsageTimeout { limit, used });
            return;
        }

        // Usage may stall while the clock is paused, so re-check after waking.
        tokio::select! {
            _ = tokio::time::sleep(limit - used) => {}
            changed = transitions.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}
