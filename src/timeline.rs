//! Lifecycle timestamps for an attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::clock::DurableClock;

pub const STARTED: &str = "started";
pub const RESUMED: &str = "resumed";
pub const SUSPENDED: &str = "suspended";
pub const COMPLETED: &str = "completed";

/// A named point in an attempt's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineMetric {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    /// Durable elapsed time of the attempt when the metric was taken.
    pub elapsed_ms: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimelineError {
    #[error("timeline metric '{0}' already recorded for this attempt")]
    DuplicateMetric(String),
}

/// Records each named metric at most once, in non-decreasing order.
#[derive(Debug)]
pub struct TimelineRecorder {
    clock: DurableClock,
    metrics: Mutex<Vec<TimelineMetric>>,
    idempotent: HashSet<String>,
}

impl TimelineRecorder {
    /// `suspended` and `resumed` may repeat for attempts that wait more than
    /// once; they are idempotent by default.
    pub fn new(clock: DurableClock) -> Self {
        Self::restore(clock, Vec::new())
    }

    /// Recorder that continues from metrics persisted in a checkpoint.
    pub fn restore(clock: DurableClock, metrics: Vec<TimelineMetric>) -> Self {
        Self {
            clock,
            metrics: Mutex::new(metrics),
            idempotent: [SUSPENDED, RESUMED].into_iter().map(String::from).collect(),
        }
    }

    /// Designate `name` as idempotent: repeats keep the first timestamp.
    pub fn with_idempotent(mut self, name: &str) -> Self {
        self.idempotent.insert(name.to_string());
        self
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TimelineMetric>> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, name: &str) -> Result<(), TimelineError> {
        let mut metrics = self.lock();
        if metrics.iter().any(|m| m.name == name) {
            if self.idempotent.contains(name) {
                return Ok(());
            }
            return Err(TimelineError::DuplicateMetric(name.to_string()));
        }

        let mut timestamp = Utc::now();
        let mut elapsed_ms = self.clock.now().as_millis() as u64;
        if let Some(last) = metrics.last() {
            timestamp = timestamp.max(last.timestamp);
            elapsed_ms = elapsed_ms.max(last.elapsed_ms);
        }

        metrics.push(TimelineMetric {
            name: name.to_string(),
            timestamp,
            elapsed_ms,
        });
        Ok(())
    }

    /// Record `name`, logging instead of failing on a duplicate.
    pub fn record_or_log(&self, name: &str) {
        if let Err(e) = self.record(name) {
            tracing::warn!(error = %e, "Timeline metric not recorded");
        }
    }

    pub fn get(&self, name: &str) -> Option<TimelineMetric> {
        self.lock().iter().find(|m| m.name == name).cloned()
    }

    pub fn metrics(&self) -> Vec<TimelineMetric> {
        self.lock().clone()
    }
}
