//! Telemetry for task attempts.
//!
//! Two layers live here:
//!
//! - [`TracingSdk`] owns the process-wide `tracing` subscriber and, when an
//!   endpoint is configured, the OTLP span exporter. It is initialized once
//!   at worker startup and flushed on shutdown.
//! - [`TelemetryPipeline`] carries the spans and logs produced *for* an
//!   attempt (task logs, captured console output, the attempt span). Records
//!   pass through [`RecordProcessor`]s that tag them with the attempt found
//!   on an explicit [`AttemptContextStack`], then queue for an [`Exporter`].

mod context;
mod processors;

pub use context::{AttemptContext, AttemptContextStack, ContextGuard};
pub use processors::{
    Exporter, InMemoryExporter, LogRecord, RecordProcessor, SpanEvent, SpanRecord, SpanStatus,
    TaskContextLogProcessor, TaskContextSpanProcessor, TelemetryRecord, TracingExporter,
};

use chrono::Utc;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use serde_json::Value;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;
use crate::engine::MetadataMap;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("telemetry initialization failed: {0}")]
    Init(String),

    #[error("telemetry export failed: {0}")]
    Export(String),
}

/// Process-wide tracing resources that must be kept alive and flushed on shutdown.
pub struct TracingSdk {
    provider: Option<SdkTracerProvider>,
}

impl TracingSdk {
    /// Install the tracing subscriber with optional OTLP export.
    ///
    /// Always installs a JSON-formatted stdout layer writing to a duplicate of
    /// the stdout descriptor. `RUST_LOG` overrides the configured level.
    pub fn init(config: &TelemetryConfig) -> Result<Self, TelemetryError> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

        // Worker logs bypass task console capture.
        let writer = match crate::console::detached_stdout() {
            Ok(stdout) => BoxMakeWriter::new(Mutex::new(stdout)),
            Err(_) => BoxMakeWriter::new(std::io::stdout),
        };
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_writer(writer);

        let Some(ref endpoint) = config.otlp_endpoint else {
            tracing_subscriber::registry()
                .with(filter)
                .with(json_layer)
                .try_init()
                .map_err(|e| TelemetryError::Init(e.to_string()))?;
            return Ok(Self { provider: None });
        };

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| TelemetryError::Init(e.to_string()))?;

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(
                opentelemetry_sdk::Resource::builder()
                    .with_service_name(config.service_name.clone())
                    .build(),
            )
            .build();

        let tracer = provider.tracer("runworker");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(filter)
            .with(json_layer)
            .with(otel_layer)
            .try_init()
            .map_err(|e| TelemetryError::Init(e.to_string()))?;

        Ok(Self {
            provider: Some(provider),
        })
    }

    pub fn is_exporting(&self) -> bool {
        self.provider.is_some()
    }

    /// Flush all pending spans.
    pub fn flush(&self) {
        if let Some(ref provider) = self.provider {
            if let Err(e) = provider.force_flush() {
                tracing::warn!(error = %e, "Failed to flush spans");
            }
        }
    }

    pub fn shutdown(mut self) {
        self.shutdown_provider();
    }

    fn shutdown_provider(&mut self) {
        self.flush();
        if let Some(provider) = self.provider.take() {
            let _: Result<(), _> = provider.shutdown();
        }
    }
}

impl Drop for TracingSdk {
    fn drop(&mut self) {
        self.shutdown_provider();
    }
}

/// Records kept for export before the oldest are dropped.
pub const DEFAULT_QUEUE_LIMIT: usize = 10_000;

struct PipelineInner {
    processors: RwLock<Vec<Arc<dyn RecordProcessor>>>,
    exporter: Arc<dyn Exporter>,
    stack: AttemptContextStack,
    queue: Mutex<Vec<TelemetryRecord>>,
    queue_limit: usize,
    dropped: AtomicU64,
    next_span_id: AtomicU64,
    flush_lock: tokio::sync::Mutex<()>,
}

/// Queue of attempt telemetry in front of an [`Exporter`].
#[derive(Clone)]
pub struct TelemetryPipeline {
    inner: Arc<PipelineInner>,
}

impl TelemetryPipeline {
    /// Pipeline tagging records from `stack`, with the span and log context
    /// processors installed.
    pub fn new(exporter: Arc<dyn Exporter>, stack: AttemptContextStack) -> Self {
        Self::with_queue_limit(exporter, stack, DEFAULT_QUEUE_LIMIT)
    }

    /// Like [`TelemetryPipeline::new`], keeping at most `limit` unexported
    /// records. The oldest are dropped first.
    pub fn with_queue_limit(exporter: Arc<dyn Exporter>, stack: AttemptContextStack, limit: usize) -> Self {
        let processors: Vec<Arc<dyn RecordProcessor>> = vec![
            Arc::new(TaskContextSpanProcessor::new(stack.clone())),
            Arc::new(TaskContextLogProcessor::new(stack.clone())),
        ];
        Self {
            inner: Arc::new(PipelineInner {
                processors: RwLock::new(processors),
                exporter,
                stack,
                queue: Mutex::new(Vec::new()),
                queue_limit: limit.max(1),
                dropped: AtomicU64::new(0),
                next_span_id: AtomicU64::new(1),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn add_processor(&self, processor: Arc<dyn RecordProcessor>) {
        self.inner
            .processors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(processor);
    }

    pub fn context_stack(&self) -> &AttemptContextStack {
        &self.inner.stack
    }

    fn processors(&self) -> Vec<Arc<dyn RecordProcessor>> {
        self.inner
            .processors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn queue(&self) -> MutexGuard<'_, Vec<TelemetryRecord>> {
        self.inner.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, record: TelemetryRecord) {
        let mut queue = self.queue();
        queue.push(record);
        self.trim(&mut queue);
    }

    fn trim(&self, queue: &mut Vec<TelemetryRecord>) {
        let excess = queue.len().saturating_sub(self.inner.queue_limit);
        if excess > 0 {
            queue.drain(..excess);
            self.inner.dropped.fetch_add(excess as u64, Ordering::Relaxed);
        }
    }

    pub fn emit_log(&self, mut record: LogRecord) {
        for processor in self.processors() {
            processor.on_log(&mut record);
        }
        self.enqueue(TelemetryRecord::Log(record));
    }

    pub fn start_span(&self, name: impl Into<String>) -> ActiveSpan {
        let mut record = SpanRecord {
            span_id: self.inner.next_span_id.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            start_time: Utc::now(),
            end_time: None,
            status: SpanStatus::Unset,
            attributes: MetadataMap::new(),
            events: Vec::new(),
        };
        for processor in self.processors() {
            processor.on_span_start(&mut record);
        }
        ActiveSpan {
            pipeline: self.clone(),
            record: Some(record),
        }
    }

    /// Records waiting for the next flush.
    pub fn queued(&self) -> usize {
        self.queue().len()
    }

    /// Records discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Export everything queued so far.
    ///
    /// On failure the batch is put back in front of the queue, within the
    /// queue limit.
    pub async fn flush(&self) -> Result<(), TelemetryError> {
        let _guard = self.inner.flush_lock.lock().await;
        let batch = std::mem::take(&mut *self.queue());
        if batch.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.inner.exporter.export(batch.clone()).await {
            let mut queue = self.queue();
            let newer = std::mem::replace(&mut *queue, batch);
            queue.extend(newer);
            self.trim(&mut queue);
            return Err(e);
        }
        Ok(())
    }
}

/// A span that has started but not ended. It is queued for export when it
/// ends, explicitly or on drop.
pub struct ActiveSpan {
    pipeline: TelemetryPipeline,
    record: Option<SpanRecord>,
}

impl ActiveSpan {
    pub fn span_id(&self) -> u64 {
        self.record.as_ref().map(|r| r.span_id).unwrap_or_default()
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.record.as_ref().and_then(|r| r.attributes.get(key))
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<Value>) {
        if let Some(ref mut record) = self.record {
            record.attributes.insert(key.to_string(), value.into());
        }
    }

    pub fn add_event(&mut self, name: &str, attributes: MetadataMap) {
        if let Some(ref mut record) = self.record {
            record.events.push(SpanEvent {
                name: name.to_string(),
                timestamp: Utc::now(),
                attributes,
            });
        }
    }

    pub fn set_status(&mut self, status: SpanStatus) {
        if let Some(ref mut record) = self.record {
            record.status = status;
        }
    }

    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(mut record) = self.record.take() {
            record.end_time = Some(Utc::now());
            self.pipeline.enqueue(TelemetryRecord::Span(record));
        }
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Attach an `exception` event to `span` and mark it failed, leaving it open.
pub fn record_span_exception(span: &mut ActiveSpan, error: &(impl Display + ?Sized)) {
    let message = error.to_string();
    let mut attributes = MetadataMap::new();
    attributes.insert("exception.message".to_string(), Value::from(message.clone()));
    span.add_event("exception", attributes);
    span.set_status(SpanStatus::Error(message));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LogLevel;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    fn pipeline() -> (TelemetryPipeline, Arc<InMemoryExporter>) {
        let exporter = Arc::new(InMemoryExporter::new());
        (TelemetryPipeline::new(exporter.clone(), AttemptContextStack::new()), exporter)
    }

    #[tokio::test]
    async fn test_records_are_tagged_with_current_attempt() {
        let (pipeline, exporter) = pipeline();
        let guard = pipeline
            .context_stack()
            .push(AttemptContext::new("run_1", "send-email", 1));
        pipeline.emit_log(LogRecord::new(LogLevel::Info, "inside"));
        pipeline.start_span("attempt").end();
        drop(guard);
        pipeline.emit_log(LogRecord::new(LogLevel::Info, "outside"));
        pipeline.flush().await.unwrap();

        let records = exporter.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].run_id(), Some("run_1"));
        assert_eq!(records[1].run_id(), Some("run_1"));
        assert_eq!(records[2].run_id(), None);
    }

    #[tokio::test]
    async fn test_span_tags_come_from_start_not_end() {
        let (pipeline, exporter) = pipeline();
        let span = pipeline.start_span("untagged");
        let _guard = pipeline.context_stack().push(AttemptContext::new("run_2", "t", 1));
        span.end();
        pipeline.flush().await.unwrap();

        assert_eq!(exporter.spans()[0].attributes.get("run.id"), None);
    }

    #[tokio::test]
    async fn test_exception_keeps_span_open() {
        let (pipeline, exporter) = pipeline();
        let mut span = pipeline.start_span("attempt");
        record_span_exception(&mut span, "boom");
        assert_eq!(pipeline.queued(), 0);

        span.set_attribute("after", true);
        drop(span);
        pipeline.flush().await.unwrap();

        let spans = exporter.spans();
        assert_eq!(spans[0].events[0].name, "exception");
        assert_eq!(spans[0].status, SpanStatus::Error("boom".into()));
        assert_eq!(spans[0].attributes.get("after"), Some(&Value::Bool(true)));
    }

    struct FlakyExporter {
        fail: AtomicBool,
        inner: InMemoryExporter,
    }

    #[async_trait]
    impl Exporter for FlakyExporter {
        async fn export(&self, batch: Vec<TelemetryRecord>) -> Result<(), TelemetryError> {
            if self.fail.swap(false, Ordering::SeqCst) {
                return Err(TelemetryError::Export("collector down".into()));
            }
            self.inner.export(batch).await
        }
    }

    #[tokio::test]
    async fn test_failed_export_requeues_batch() {
        let exporter = Arc::new(FlakyExporter {
            fail: AtomicBool::new(true),
            inner: InMemoryExporter::new(),
        });
        let pipeline = TelemetryPipeline::new(exporter.clone(), AttemptContextStack::new());
        pipeline.emit_log(LogRecord::new(LogLevel::Info, "first"));

        assert!(pipeline.flush().await.is_err());
        assert_eq!(pipeline.queued(), 1);

        pipeline.emit_log(LogRecord::new(LogLevel::Info, "second"));
        pipeline.flush().await.unwrap();
        let messages: Vec<_> = exporter.inner.logs().into_iter().map(|l| l.message).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    struct DownExporter;

    #[async_trait]
    impl Exporter for DownExporter {
        async fn export(&self, _batch: Vec<TelemetryRecord>) -> Result<(), TelemetryError> {
            Err(TelemetryError::Export("collector down".into()))
        }
    }

    #[tokio::test]
    async fn test_queue_stays_bounded_while_export_fails() {
        let pipeline = TelemetryPipeline::with_queue_limit(Arc::new(DownExporter), AttemptContextStack::new(), 3);
        for i in 0..5 {
            pipeline.emit_log(LogRecord::new(LogLevel::Info, format!("log {i}")));
            assert!(pipeline.flush().await.is_err());
        }

        assert_eq!(pipeline.queued(), 3);
        assert_eq!(pipeline.dropped(), 2);
        let batch = std::mem::take(&mut *pipeline.queue());
        let messages: Vec<_> = batch
            .into_iter()
            .filter_map(|r| match r {
                TelemetryRecord::Log(log) => Some(log.message),
                TelemetryRecord::Span(_) => None,
            })
            .collect();
        assert_eq!(messages, vec!["log 2", "log 3", "log 4"]);
    }
}
