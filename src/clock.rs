//! Pausable time source for executing task code.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Persisted clock position, carried inside a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSnapshot {
    /// Task-visible elapsed time at the moment of the snapshot.
    pub elapsed_ms: u64,
    /// Total time spent paused so far, across all prior processes.
    pub paused_ms: u64,
}

#[derive(Debug)]
struct ClockState {
    base: Duration,
    carried_paused: Duration,
    origin: Instant,
    paused_at: Option<Instant>,
    paused_total: Duration,
    last: Duration,
}

impl ClockState {
    fn raw_elapsed(&self, now: Instant) -> Duration {
        let end = self.paused_at.unwrap_or(now);
        end.saturating_duration_since(self.origin)
            .saturating_sub(self.paused_total)
    }
}

/// Elapsed logical time net of pauses.
///
/// Clones share state, so the executor, the usage meter and the runtime
/// manager all observe the same timeline. `now()` never decreases, including
/// across a restore from a [`ClockSnapshot`].
#[derive(Debug, Clone)]
pub struct DurableClock {
    state: Arc<Mutex<ClockState>>,
}

impl Default for DurableClock {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableClock {
    /// Start a fresh clock at zero.
    pub fn new() -> Self {
        Self::restore(ClockSnapshot::default())
    }

    /// Continue a clock persisted by [`DurableClock::snapshot`].
    ///
    /// Wall time that passed between the snapshot and now is not counted.
    pub fn restore(snapshot: ClockSnapshot) -> Self {
        let base = Duration::from_millis(snapshot.elapsed_ms);
        Self {
            state: Arc::new(Mutex::new(ClockState {
                base,
                carried_paused: Duration::from_millis(snapshot.paused_ms),
                origin: Instant::now(),
                paused_at: None,
                paused_total: Duration::ZERO,
                last: base,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current task-visible elapsed time.
    pub fn now(&self) -> Duration {
        let mut state = self.lock();
        let elapsed = state.base + state.raw_elapsed(Instant::now());
        state.last = state.last.max(elapsed);
        state.last
    }

    /// Stop counting time. A second call while paused is a no-op.
    pub fn pause(&self) {
        let mut state = self.lock();
        if state.paused_at.is_none() {
            state.paused_at = Some(Instant::now());
        }
    }

    /// Resume counting time. A call while running is a no-op.
    pub fn resume(&self) {
        let mut state = self.lock();
        if let Some(paused_at) = state.paused_at.take() {
            state.paused_total += Instant::now().saturating_duration_since(paused_at);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused_at.is_some()
    }

    /// Total paused time, including pauses carried over from earlier processes.
    pub fn paused_total(&self) -> Duration {
        let state = self.lock();
        let open = state
            .paused_at
            .map(|p| Instant::now().saturating_duration_since(p))
            .unwrap_or_default();
        state.carried_paused + state.paused_total + open
    }

    /// Run `fut` with the clock paused, resuming afterwards.
    ///
    /// If the clock was already paused it stays paused.
    pub async fn pause_while<F: Future>(&self, fut: F) -> F::Output {
        let was_paused = self.is_paused();
        self.pause();
        let output = fut.await;
        if !was_paused {
            self.resume();
        }
        output
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            elapsed_ms: self.now().as_millis() as u64,
            paused_ms: self.paused_total().as_millis() as u64,
        }
    }
}
