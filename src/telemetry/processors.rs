//! Record types, processors and exporters of the telemetry pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};

use super::context::AttemptContextStack;
use super::TelemetryError;
use crate::engine::MetadataMap;
use crate::logger::LogLevel;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub attributes: MetadataMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "code", content = "message", rename_all = "snake_case")]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanRecord {
    pub span_id: u64,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SpanStatus,
    pub attributes: MetadataMap,
    pub events: Vec<SpanEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub attributes: MetadataMap,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
            attributes: MetadataMap::new(),
        }
    }
}

/// Unit of telemetry handed to an [`Exporter`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryRecord {
    Span(SpanRecord),
    Log(LogRecord),
}

impl TelemetryRecord {
    pub fn attributes(&self) -> &MetadataMap {
        match self {
            Self::Span(span) => &span.attributes,
            Self::Log(log) => &log.attributes,
        }
    }

    /// The `run.id` attribute, if the record was tagged with an attempt.
    pub fn run_id(&self) -> Option<&str> {
        self.attributes().get("run.id").and_then(|v| v.as_str())
    }
}

/// Hook that can enrich records before they are queued for export.
pub trait RecordProcessor: Send + Sync {
    fn on_span_start(&self, _span: &mut SpanRecord) {}

    fn on_log(&self, _log: &mut LogRecord) {}
}

fn tag_with_current(stack: &AttemptContextStack, attributes: &mut MetadataMap) {
    let Some(context) = stack.current() else {
        return;
    };
    for (key, value) in context.attributes() {
        attributes.entry(key.to_string()).or_insert(value);
    }
}

/// Adds the current attempt's identifiers to spans as they start.
pub struct TaskContextSpanProcessor {
    stack: AttemptContextStack,
}

impl TaskContextSpanProcessor {
    pub fn new(stack: AttemptContextStack) -> Self {
        Self { stack }
    }
}

impl RecordProcessor for TaskContextSpanProcessor {
    fn on_span_start(&self, span: &mut SpanRecord) {
        tag_with_current(&self.stack, &mut span.attributes);
    }
}

/// Adds the current attempt's identifiers to log records.
///
/// Records that already carry a `run.id` keep it.
pub struct TaskContextLogProcessor {
    stack: AttemptContextStack,
}

impl TaskContextLogProcessor {
    pub fn new(stack: AttemptContextStack) -> Self {
        Self { stack }
    }
}

impl RecordProcessor for TaskContextLogProcessor {
    fn on_log(&self, log: &mut LogRecord) {
        if log.attributes.contains_key("run.id") {
            return;
        }
        tag_with_current(&self.stack, &mut log.attributes);
    }
}

/// Destination of exported telemetry batches.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(&self, batch: Vec<TelemetryRecord>) -> Result<(), TelemetryError>;
}

/// Keeps exported records in memory.
#[derive(Debug, Default)]
pub struct InMemoryExporter {
    records: Mutex<Vec<TelemetryRecord>>,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TelemetryRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.lock().clone()
    }

    pub fn logs(&self) -> Vec<LogRecord> {
        self.lock()
            .iter()
            .filter_map(|r| match r {
                TelemetryRecord::Log(log) => Some(log.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        self.lock()
            .iter()
            .filter_map(|r| match r {
                TelemetryRecord::Span(span) => Some(span.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[async_trait]
impl Exporter for InMemoryExporter {
    async fn export(&self, batch: Vec<TelemetryRecord>) -> Result<(), TelemetryError> {
        self.lock().extend(batch);
        Ok(())
    }
}

/// Forwards records as `tracing` events, so they reach whatever subscriber
/// (and OTLP exporter) the process installed.
#[derive(Debug, Default)]
pub struct TracingExporter;

fn attr<'a>(attributes: &'a MetadataMap, key: &str) -> &'a str {
    attributes.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

#[async_trait]
impl Exporter for TracingExporter {
    async fn export(&self, batch: Vec<TelemetryRecord>) -> Result<(), TelemetryError> {
        for record in batch {
            match record {
                TelemetryRecord::Log(log) => {
                    let run_id = attr(&log.attributes, "run.id");
                    let task_id = attr(&log.attributes, "task.id");
                    match log.level {
                        LogLevel::Debug => tracing::debug!(run_id, task_id, "{}", log.message),
                        LogLevel::Log | LogLevel::Info => {
                            tracing::info!(run_id, task_id, "{}", log.message)
                        }
                        LogLevel::Warn => tracing::warn!(run_id, task_id, "{}", log.message),
                        LogLevel::Error => tracing::error!(run_id, task_id, "{}", log.message),
                    }
                }
                TelemetryRecord::Span(span) => {
                    let duration_ms = span
                        .end_time
                        .map(|end| (end - span.start_time).num_milliseconds())
                        .unwrap_or_default();
                    tracing::info!(
                        span = %span.name,
                        run_id = attr(&span.attributes, "run.id"),
                        duration_ms,
                        status = ?span.status,
                        events = span.events.len(),
                        "Span finished"
                    );
                }
            }
        }
        Ok(())
    }
}
