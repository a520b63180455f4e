//! Resumption state for suspended attempts and where it is kept.

#[cfg(feature = "sqlite")]
mod sqlite_store;

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::clock::ClockSnapshot;
use crate::engine::MetadataMap;
use crate::runtime::PendingWait;
use crate::timeline::TimelineMetric;

/// Everything needed to continue an attempt in a later process.
///
/// Task code is replayed from the top on resumption; durable waits that
/// already completed are answered from `completed_waits` by their sequence
/// number instead of waiting again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumptionState {
    pub run_id: String,
    pub attempt_number: u32,
    pub task_id: String,
    pub input: serde_json::Value,
    #[serde(default)]
    pub completed_waits: BTreeMap<u32, serde_json::Value>,
    #[serde(default)]
    pub pending_wait: Option<PendingWait>,
    pub clock: ClockSnapshot,
    pub usage_ms: u64,
    #[serde(default)]
    pub metadata: MetadataMap,
    #[serde(default)]
    pub timeline: Vec<TimelineMetric>,
    /// Arbitrary progress saved by task code through its context.
    #[serde(default)]
    pub task_state: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ResumptionState {
    /// Mark the pending wait complete with `result`, ready for replay.
    pub fn complete_pending(&mut self, result: serde_json::Value) {
        if let Some(pending) = self.pending_wait.take() {
            self.completed_waits.insert(pending.index, result);
        }
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Persistence for [`ResumptionState`], keyed by run.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Save or replace the checkpoint of `state.run_id`.
    async fn save(&self, state: &ResumptionState) -> Result<(), CheckpointError>;

    async fn load(&self, run_id: &str) -> Result<Option<ResumptionState>, CheckpointError>;

    /// Forget the checkpoint of a run once it reached a terminal state.
    async fn remove(&self, run_id: &str) -> Result<(), CheckpointError>;
}

/// Checkpoints kept in process memory. Lost on restart; for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    states: Mutex<HashMap<String, ResumptionState>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ResumptionState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, state: &ResumptionState) -> Result<(), CheckpointError> {
        self.lock().insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<ResumptionState>, CheckpointError> {
        Ok(self.lock().get(run_id).cloned())
    }

    async fn remove(&self, run_id: &str) -> Result<(), CheckpointError> {
        self.lock().remove(run_id);
        Ok(())
    }
}
