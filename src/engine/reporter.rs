//! At-least-once, idempotent status reporting.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{EngineError, RunEngine, StatusReport};
use crate::retry::RetryPolicy;

/// What happened to a status report.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// The Run Engine acknowledged the report.
    Delivered,
    /// The same terminal status was already delivered; nothing was sent.
    Duplicate,
    /// Transient failures exhausted the retry budget. The report is kept and
    /// can be sent later with [`StatusReporter::retry_pending`].
    Deferred,
    /// The Run Engine refused the report permanently.
    Rejected(EngineError),
}

/// Terminal deliveries remembered for deduplication.
pub const DEFAULT_DELIVERED_LIMIT: usize = 4096;
/// Deferred reports kept for [`StatusReporter::retry_pending`].
pub const DEFAULT_PENDING_LIMIT: usize = 1024;

type AttemptKey = (String, u32);

/// Delivered terminal attempts, oldest evicted first.
#[derive(Debug, Default)]
struct Delivered {
    keys: HashSet<AttemptKey>,
    order: VecDeque<AttemptKey>,
}

impl Delivered {
    fn contains(&self, key: &AttemptKey) -> bool {
        self.keys.contains(key)
    }

    fn insert(&mut self, key: AttemptKey, limit: usize) {
        if !self.keys.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > limit {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
    }
}

/// Sends status reports with backoff and remembers delivered terminal states.
///
/// Reports of one attempt reach the Run Engine in transition order: once a
/// later report of an attempt is delivered, its deferred non-terminal
/// reports are dropped instead of being sent after it.
pub struct StatusReporter {
    engine: Arc<dyn RunEngine>,
    backoff: RetryPolicy,
    delivered: Mutex<Delivered>,
    pending: Mutex<VecDeque<StatusReport>>,
    delivered_limit: usize,
    pending_limit: usize,
}

impl StatusReporter {
    pub fn new(engine: Arc<dyn RunEngine>, max_attempts: u32) -> Self {
        Self::with_backoff(
            engine,
            RetryPolicy::Exponential {
                max_attempts,
                min_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                factor: 2.0,
                randomize: false,
            },
        )
    }

    pub fn with_backoff(engine: Arc<dyn RunEngine>, backoff: RetryPolicy) -> Self {
        Self {
            engine,
            backoff,
            delivered: Mutex::new(Delivered::default()),
            pending: Mutex::new(VecDeque::new()),
            delivered_limit: DEFAULT_DELIVERED_LIMIT,
            pending_limit: DEFAULT_PENDING_LIMIT,
        }
    }

    /// Bound the remembered terminal deliveries and the deferred reports.
    pub fn with_limits(mut self, delivered: usize, pending: usize) -> Self {
        self.delivered_limit = delivered.max(1);
        self.pending_limit = pending.max(1);
        self
    }

    fn delivered(&self) -> MutexGuard<'_, Delivered> {
        self.delivered.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending_lock(&self) -> MutexGuard<'_, VecDeque<StatusReport>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a terminal report for this attempt was delivered.
    pub fn is_delivered(&self, run_id: &str, attempt_number: u32) -> bool {
        self.delivered().contains(&(run_id.to_string(), attempt_number))
    }

    fn defer(&self, report: StatusReport) {
        let mut pending = self.pending_lock();
        pending.push_back(report);
        while pending.len() > self.pending_limit {
            if let Some(dropped) = pending.pop_front() {
                tracing::error!(
                    run_id = %dropped.run_id,
                    attempt = dropped.attempt_number,
                    status = %dropped.status,
                    "Pending report queue full, dropping oldest report"
                );
            }
        }
    }

    fn drop_superseded(&self, key: &AttemptKey) {
        let mut pending = self.pending_lock();
        let before = pending.len();
        pending.retain(|p| {
            p.status.is_terminal() || p.run_id != key.0 || p.attempt_number != key.1
        });
        let dropped = before - pending.len();
        if dropped > 0 {
            tracing::debug!(run_id = %key.0, attempt = key.1, dropped, "Dropped superseded pending reports");
        }
    }

    pub async fn report(&self, report: StatusReport) -> ReportOutcome {
        let key = (report.run_id.clone(), report.attempt_number);
        if report.status.is_terminal() && self.delivered().contains(&key) {
            tracing::debug!(run_id = %report.run_id, status = %report.status, "Skipping duplicate terminal report");
            return ReportOutcome::Duplicate;
        }

        match self.deliver(&report).await {
            Ok(()) => {
                if report.status.is_terminal() {
                    self.delivered().insert(key.clone(), self.delivered_limit);
                }
                self.drop_superseded(&key);
                ReportOutcome::Delivered
            }
            Err(e) if e.is_transient() => {
                tracing::error!(
                    run_id = %report.run_id,
                    attempt = report.attempt_number,
                    status = %report.status,
                    error = %e,
                    "Status report retries exhausted, keeping report for later delivery"
                );
                self.defer(report);
                ReportOutcome::Deferred
            }
            Err(e) => {
                tracing::error!(
                    run_id = %report.run_id,
                    status = %report.status,
                    error = %e,
                    "Status report rejected"
                );
                ReportOutcome::Rejected(e)
            }
        }
    }

    async fn deliver(&self, report: &StatusReport) -> Result<(), EngineError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.engine.report(report).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => match self.backoff.delay_for_attempt(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            run_id = %report.run_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Status report failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Reports whose delivery was deferred.
    pub fn pending(&self) -> Vec<StatusReport> {
        self.pending_lock().iter().cloned().collect()
    }

    /// Try to deliver deferred reports again. Returns how many were delivered.
    pub async fn retry_pending(&self) -> usize {
        let reports = std::mem::take(&mut *self.pending_lock());
        let mut delivered = 0;
        for report in reports {
            if !report.status.is_terminal() && self.is_delivered(&report.run_id, report.attempt_number) {
                continue;
            }
            match self.report(report).await {
                ReportOutcome::Delivered | ReportOutcome::Duplicate => delivered += 1,
                ReportOutcome::Deferred | ReportOutcome::Rejected(_) => {}
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AttemptStatus, InMemoryRunEngine};

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let engine = Arc::new(InMemoryRunEngine::new());
        engine.fail_next_reports(2);
        let reporter = StatusReporter::new(engine.clone(), 5);

        let outcome = reporter
            .report(StatusReport::new("run_1", 1, AttemptStatus::Completed))
            .await;

        assert_eq!(outcome, ReportOutcome::Delivered);
        assert_eq!(engine.reports().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_status_is_reported_once() {
        let engine = Arc::new(InMemoryRunEngine::new());
        let reporter = StatusReporter::new(engine.clone(), 3);
        let report = StatusReport::new("run_1", 1, AttemptStatus::Failed);

        assert_eq!(reporter.report(report.clone()).await, ReportOutcome::Delivered);
        assert_eq!(reporter.report(report).await, ReportOutcome::Duplicate);
        assert_eq!(engine.reports().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_report_can_be_retried_later() {
        let engine = Arc::new(InMemoryRunEngine::new());
        engine.fail_next_reports(10);
        let reporter = StatusReporter::new(engine.clone(), 3);

        let outcome = reporter
            .report(StatusReport::new("run_1", 1, AttemptStatus::Completed))
            .await;
        assert_eq!(outcome, ReportOutcome::Deferred);
        assert_eq!(reporter.pending().len(), 1);

        engine.fail_next_reports(0);
        assert_eq!(reporter.retry_pending().await, 1);
        assert!(reporter.pending().is_empty());
        assert_eq!(engine.reports_for("run_1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_running_report_is_not_sent_after_completion() {
        let engine = Arc::new(InMemoryRunEngine::new());
        let reporter = StatusReporter::new(engine.clone(), 3);

        engine.fail_next_reports(3);
        let running = reporter
            .report(StatusReport::new("run_1", 1, AttemptStatus::Running))
            .await;
        assert_eq!(running, ReportOutcome::Deferred);

        let completed = reporter
            .report(StatusReport::new("run_1", 1, AttemptStatus::Completed))
            .await;
        assert_eq!(completed, ReportOutcome::Delivered);
        assert!(reporter.pending().is_empty());

        assert_eq!(reporter.retry_pending().await, 0);
        let statuses: Vec<_> = engine.reports().iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![AttemptStatus::Completed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_reports_of_other_attempts_are_kept() {
        let engine = Arc::new(InMemoryRunEngine::new());
        let reporter = StatusReporter::new(engine.clone(), 1);

        engine.fail_next_reports(1);
        reporter
            .report(StatusReport::new("run_1", 1, AttemptStatus::Running))
            .await;
        reporter
            .report(StatusReport::new("run_2", 1, AttemptStatus::Completed))
            .await;

        assert_eq!(reporter.pending().len(), 1);
        assert_eq!(reporter.retry_pending().await, 1);
        assert_eq!(engine.reports_for("run_1")[0].status, AttemptStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bookkeeping_is_bounded() {
        let engine = Arc::new(InMemoryRunEngine::new());
        let reporter = StatusReporter::new(engine.clone(), 1).with_limits(2, 2);

        for run in ["run_1", "run_2", "run_3"] {
            reporter
                .report(StatusReport::new(run, 1, AttemptStatus::Completed))
                .await;
        }
        assert!(!reporter.is_delivered("run_1", 1));
        assert!(reporter.is_delivered("run_2", 1));
        assert!(reporter.is_delivered("run_3", 1));

        engine.fail_next_reports(3);
        for run in ["run_4", "run_5", "run_6"] {
            reporter
                .report(StatusReport::new(run, 1, AttemptStatus::Failed))
                .await;
        }
        let pending: Vec<_> = reporter.pending().into_iter().map(|r| r.run_id).collect();
        assert_eq!(pending, vec!["run_5", "run_6"]);
    }
}
