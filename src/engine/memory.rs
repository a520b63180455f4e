//! In-process Run Engine for tests and local development.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{Assignment, EngineError, Heartbeat, MetadataMap, RunEngine, StatusReport};

#[derive(Debug, Default)]
struct EngineState {
    queue: VecDeque<Assignment>,
    reports: Vec<StatusReport>,
    terminal: HashSet<(String, u32)>,
    heartbeats: Vec<Heartbeat>,
    metadata: HashMap<String, MetadataMap>,
    metadata_flushes: usize,
    failing_reports: usize,
}

/// Run Engine held entirely in memory.
///
/// Duplicate terminal reports for an attempt are accepted but not recorded,
/// matching the coordinator's idempotency guarantee.
#[derive(Debug, Default)]
pub struct InMemoryRunEngine {
    state: Mutex<EngineState>,
}

impl InMemoryRunEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, assignment: Assignment) {
        self.lock().queue.push_back(assignment);
    }

    /// Make the next `n` report calls fail with a transport error.
    pub fn fail_next_reports(&self, n: usize) {
        self.lock().failing_reports = n;
    }

    pub fn reports(&self) -> Vec<StatusReport> {
        self.lock().reports.clone()
    }

    pub fn reports_for(&self, run_id: &str) -> Vec<StatusReport> {
        self.lock()
            .reports
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn heartbeats(&self) -> Vec<Heartbeat> {
        self.lock().heartbeats.clone()
    }

    pub fn metadata(&self, run_id: &str) -> Option<MetadataMap> {
        self.lock().metadata.get(run_id).cloned()
    }

    /// Number of metadata flushes received across all runs.
    pub fn metadata_flushes(&self) -> usize {
        self.lock().metadata_flushes
    }
}

#[async_trait]
impl RunEngine for InMemoryRunEngine {
    async fn dequeue(&self, _worker_id: &str) -> Result<Option<Assignment>, EngineError> {
        Ok(self.lock().queue.pop_front())
    }

    async fn report(&self, report: &StatusReport) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.failing_reports > 0 {
            state.failing_reports -= 1;
            return Err(EngineError::Transport("connection reset".to_string()));
        }

        if report.status.is_terminal() {
            let key = (report.run_id.clone(), report.attempt_number);
            if !state.terminal.insert(key) {
                return Ok(());
            }
        }
        state.reports.push(report.clone());
        Ok(())
    }

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), EngineError> {
        self.lock().heartbeats.push(heartbeat.clone());
        Ok(())
    }

    async fn flush_metadata(&self, run_id: &str, metadata: &MetadataMap) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.metadata.insert(run_id.to_string(), metadata.clone());
        state.metadata_flushes += 1;
        Ok(())
    }
}
