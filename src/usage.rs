//! Usage accounting for a single attempt.
//!
//! The meter measures durable time (see [`DurableClock`]) rather than wall
//! time, so network latency and paused waits never count against a task's
//! budget. Start/stop transitions are published on a `watch` channel which
//! the timeout enforcer and the usage reporter subscribe to.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::DurableClock;
use crate::engine::{Heartbeat, RunEngine};

/// One metered interval, as offsets on the attempt's durable clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSample {
    pub start: Duration,
    pub end: Option<Duration>,
}

impl UsageSample {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    fn duration_until(&self, now: Duration) -> Duration {
        self.end.unwrap_or(now).saturating_sub(self.start)
    }
}

/// Published on every start/stop transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageState {
    pub running: bool,
    pub transitions: u64,
}

#[derive(Debug, Default)]
struct MeterState {
    baseline: Duration,
    samples: Vec<UsageSample>,
}

impl MeterState {
    fn open(&self) -> Option<&UsageSample> {
        self.samples.last().filter(|s| s.is_open())
    }
}

/// Resource meter owned by one attempt.
#[derive(Debug, Clone)]
pub struct UsageMeter {
    clock: DurableClock,
    state: Arc<Mutex<MeterState>>,
    transitions: Arc<watch::Sender<UsageState>>,
}

impl UsageMeter {
    pub fn new(clock: DurableClock) -> Self {
        Self::with_baseline(clock, Duration::ZERO)
    }

    /// Meter that already carries `baseline` of usage, e.g. from a checkpoint.
    pub fn with_baseline(clock: DurableClock, baseline: Duration) -> Self {
        let (tx, _rx) = watch::channel(UsageState::default());
        Self {
            clock,
            state: Arc::new(Mutex::new(MeterState {
                baseline,
                samples: Vec::new(),
            })),
            transitions: Arc::new(tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MeterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a sample. Returns false if one was already open.
    pub fn start(&self) -> bool {
        {
            let mut state = self.lock();
            if state.open().is_some() {
                return false;
            }
            let start = self.clock.now();
            state.samples.push(UsageSample { start, end: None });
        }
        self.publish(true);
        true
    }

    /// Close the open sample. Returns false if none was open.
    pub fn stop(&self) -> bool {
        {
            let mut state = self.lock();
            let now = self.clock.now();
            match state.samples.last_mut() {
                Some(sample) if sample.is_open() => sample.end = Some(now),
                _ => return false,
            }
        }
        self.publish(false);
        true
    }

    fn publish(&self, running: bool) {
        self.transitions.send_modify(|state| {
            state.running = running;
            state.transitions += 1;
        });
    }

    pub fn is_running(&self) -> bool {
        self.lock().open().is_some()
    }

    /// Baseline plus closed samples plus the open sample measured now.
    pub fn total(&self) -> Duration {
        let state = self.lock();
        let now = self.clock.now();
        state.baseline
            + state
                .samples
                .iter()
                .map(|s| s.duration_until(now))
                .sum::<Duration>()
    }

    pub fn samples(&self) -> Vec<UsageSample> {
        self.lock().samples.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UsageState> {
        self.transitions.subscribe()
    }

    pub fn clock(&self) -> &DurableClock {
        &self.clock
    }

    /// Run `fut` with accounting stopped, restarting it afterwards if it was running.
    pub async fn pause_while<F: Future>(&self, fut: F) -> F::Output {
        let was_running = self.stop();
        let output = fut.await;
        if was_running {
            self.start();
        }
        output
    }
}

/// Periodically sends usage totals with the worker heartbeat.
///
/// Only spawned in managed mode; local development never reports usage.
pub struct UsageReporter {
    handle: JoinHandle<()>,
}

impl UsageReporter {
    pub fn spawn(
        engine: Arc<dyn RunEngine>,
        worker_id: String,
        run_id: String,
        meter: UsageMeter,
        interval: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let heartbeat = Heartbeat {
                    run_id: Some(run_id.clone()),
                    usage_ms: Some(meter.total().as_millis() as u64),
                    ..Heartbeat::new(worker_id.clone())
                };
                if let Err(e) = engine.heartbeat(&heartbeat).await {
                    tracing::warn!(run_id = %run_id, error = %e, "Failed to report usage");
                }
            }
        });
        Self { handle }
    }
}

impl Drop for UsageReporter {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
