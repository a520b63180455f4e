//! Tracking of background work a task schedules before it completes.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Handle for one outstanding deferred operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitToken(u64);

/// Result of [`WaitBarrier::drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every registered token was resolved before the deadline.
    Clear,
    /// The deadline passed; the listed number of tokens were abandoned.
    TimedOut { abandoned: usize },
}

#[derive(Debug, Default)]
struct BarrierInner {
    next: AtomicU64,
    tokens: Mutex<HashSet<u64>>,
    drained: Notify,
}

/// Wait-until manager scoped to one attempt.
#[derive(Debug, Clone, Default)]
pub struct WaitBarrier {
    inner: Arc<BarrierInner>,
}

impl WaitBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    fn tokens(&self) -> MutexGuard<'_, HashSet<u64>> {
        self.inner.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self) -> WaitToken {
        let id = self.inner.next.fetch_add(1, Ordering::Relaxed);
        self.tokens().insert(id);
        WaitToken(id)
    }

    /// Mark a token resolved. Returns false if it was unknown or already resolved.
    pub fn resolve(&self, token: WaitToken) -> bool {
        let (removed, empty) = {
            let mut tokens = self.tokens();
            let removed = tokens.remove(&token.0);
            (removed, tokens.is_empty())
        };
        if removed && empty {
            self.inner.drained.notify_waiters();
        }
        removed
    }

    pub fn outstanding(&self) -> usize {
        self.tokens().len()
    }

    /// Spawn `fut` as tracked background work, resolving its token on exit.
    pub fn spawn<F>(&self, fut: F) -> WaitToken
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.register();
        let barrier = self.clone();
        tokio::spawn(async move {
            fut.await;
            barrier.resolve(token);
        });
        token
    }

    /// Wait until no tokens remain or `timeout` elapses.
    ///
    /// On timeout the remaining tokens are discarded so they cannot hold up
    /// a later completion.
    pub async fn drain(&self, timeout: Duration) -> DrainOutcome {
        let cleared = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.inner.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.outstanding() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await;

        match cleared {
            Ok(()) => DrainOutcome::Clear,
            Err(_) => {
                let abandoned = {
                    let mut tokens = self.tokens();
                    let n = tokens.len();
                    tokens.clear();
                    n
                };
                if abandoned == 0 {
                    DrainOutcome::Clear
                } else {
                    DrainOutcome::TimedOut { abandoned }
                }
            }
        }
    }
}
