//! Capture of task console output as attempt telemetry.
//!
//! While a [`ConsoleGuard`] is alive, complete lines become log records
//! tagged with the guard's attempt. Lines reach the interceptor two ways:
//!
//! - an interceptor built with process capture redirects the process's
//!   stdout and stderr descriptors, so plain `println!`/`eprintln!` output
//!   is captured (unix only);
//! - [`ConsoleInterceptor::stdout`] and [`ConsoleInterceptor::stderr`] give
//!   writers that never touch the descriptors.
//!
//! Without an active guard, output passes through to the real streams.

#[cfg(unix)]
mod redirect;

use std::fs::File;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::logger::LogLevel;
use crate::telemetry::{AttemptContext, LogRecord, TelemetryPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleSource {
    Stdout,
    Stderr,
}

impl ConsoleSource {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    fn level(&self) -> LogLevel {
        match self {
            Self::Stdout => LogLevel::Info,
            Self::Stderr => LogLevel::Error,
        }
    }
}

struct Capture {
    id: u64,
    context: AttemptContext,
}

struct InterceptorInner {
    pipeline: TelemetryPipeline,
    process_streams: bool,
    next_id: AtomicU64,
    /// Active captures, innermost last.
    captures: Mutex<Vec<Capture>>,
}

/// Redirects console writes into the telemetry pipeline for one attempt at a time.
#[derive(Clone)]
pub struct ConsoleInterceptor {
    inner: Arc<InterceptorInner>,
}

impl ConsoleInterceptor {
    /// Interceptor for the explicit writers only.
    pub fn new(pipeline: TelemetryPipeline) -> Self {
        Self::with_process_capture(pipeline, false)
    }

    /// Interceptor that also redirects the process's stdout and stderr while
    /// a capture is active, when `enabled`.
    pub fn with_process_capture(pipeline: TelemetryPipeline, enabled: bool) -> Self {
        Self {
            inner: Arc::new(InterceptorInner {
                pipeline,
                process_streams: enabled,
                next_id: AtomicU64::new(0),
                captures: Mutex::new(Vec::new()),
            }),
        }
    }

    fn captures(&self) -> MutexGuard<'_, Vec<Capture>> {
        self.inner.captures.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start capturing console output for `context`.
    ///
    /// Dropping the guard restores whatever destination was active before,
    /// whether the attempt succeeded, failed or panicked.
    pub fn intercept(&self, context: AttemptContext) -> ConsoleGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(run_id = %context.run_id, "Console capture started");
        self.captures().push(Capture { id, context });
        ConsoleGuard {
            interceptor: self.clone(),
            id,
            #[cfg(unix)]
            redirect: self.redirect(),
        }
    }

    #[cfg(unix)]
    fn redirect(&self) -> Option<redirect::Registration> {
        if !self.inner.process_streams {
            return None;
        }
        match redirect::acquire(self.clone()) {
            Ok(registration) => Some(registration),
            Err(e) => {
                tracing::warn!(error = %e, "Could not redirect process output, capturing explicit writers only");
                None
            }
        }
    }

    pub fn captures_process_streams(&self) -> bool {
        cfg!(unix) && self.inner.process_streams
    }

    pub fn is_active(&self) -> bool {
        !self.captures().is_empty()
    }

    pub fn stdout(&self) -> ConsoleStream {
        ConsoleStream::new(self.clone(), ConsoleSource::Stdout)
    }

    pub fn stderr(&self) -> ConsoleStream {
        ConsoleStream::new(self.clone(), ConsoleSource::Stderr)
    }

    /// Emit `line` for the innermost capture. Returns false when none is active.
    fn capture_line(&self, source: ConsoleSource, line: &str) -> bool {
        let Some(context) = self.captures().last().map(|c| c.context.clone()) else {
            return false;
        };
        let mut record = LogRecord::new(source.level(), line);
        for (key, value) in context.attributes() {
            record.attributes.insert(key.to_string(), value);
        }
        record
            .attributes
            .insert("log.source".to_string(), source.as_str().into());
        self.inner.pipeline.emit_log(record);
        true
    }

    fn dispatch(&self, source: ConsoleSource, line: &str) -> io::Result<()> {
        if self.capture_line(source, line) {
            return Ok(());
        }
        match source {
            ConsoleSource::Stdout => writeln!(io::stdout().lock(), "{line}"),
            ConsoleSource::Stderr => writeln!(io::stderr().lock(), "{line}"),
        }
    }
}

/// A writer on the process's stdout that is not affected by console capture.
///
/// Worker diagnostics use it so they are never mistaken for task output.
pub fn detached_stdout() -> io::Result<File> {
    #[cfg(unix)]
    {
        redirect::detached_stdout()
    }
    #[cfg(not(unix))]
    {
        Err(io::Error::new(io::ErrorKind::Unsupported, "descriptor duplication needs unix"))
    }
}

/// Ends a console capture when dropped.
pub struct ConsoleGuard {
    interceptor: ConsoleInterceptor,
    id: u64,
    #[cfg(unix)]
    redirect: Option<redirect::Registration>,
}

impl Drop for ConsoleGuard {
    fn drop(&mut self) {
        // Pending process output is drained before the capture ends.
        #[cfg(unix)]
        drop(self.redirect.take());
        self.interceptor.captures().retain(|c| c.id != self.id);
    }
}

/// Line-buffered writer over the console. Partial lines are emitted on flush
/// or drop.
pub struct ConsoleStream {
    interceptor: ConsoleInterceptor,
    source: ConsoleSource,
    buffer: Vec<u8>,
}

impl ConsoleStream {
    fn new(interceptor: ConsoleInterceptor, source: ConsoleSource) -> Self {
        Self {
            interceptor,
            source,
            buffer: Vec::new(),
        }
    }

    fn emit_line(&self, bytes: &[u8]) -> io::Result<()> {
        let line = String::from_utf8_lossy(bytes);
        self.interceptor
            .dispatch(self.source, line.trim_end_matches('\r'))
    }
}

impl Write for ConsoleStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.emit_line(&line[..line.len() - 1])?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.emit_line(&line)?;
        }
        Ok(())
    }
}

impl Drop for ConsoleStream {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{AttemptContextStack, InMemoryExporter};

    fn interceptor() -> (ConsoleInterceptor, TelemetryPipeline, Arc<InMemoryExporter>) {
        let exporter = Arc::new(InMemoryExporter::new());
        let pipeline = TelemetryPipeline::new(exporter.clone(), AttemptContextStack::new());
        (ConsoleInterceptor::new(pipeline.clone()), pipeline, exporter)
    }

    #[tokio::test]
    async fn test_lines_are_captured_while_guard_lives() {
        let (console, pipeline, exporter) = interceptor();
        {
            let _guard = console.intercept(AttemptContext::new("run_1", "t", 1));
            let mut out = console.stdout();
            write!(out, "hello ").unwrap();
            writeln!(out, "world").unwrap();
            writeln!(console.stderr(), "oops").unwrap();
        }
        assert!(!console.is_active());
        pipeline.flush().await.unwrap();

        let logs = exporter.logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "hello world");
        assert_eq!(logs[0].level, LogLevel::Info);
        assert_eq!(logs[1].level, LogLevel::Error);
        assert_eq!(logs[1].attributes.get("log.source"), Some(&serde_json::json!("stderr")));
        assert!(logs.iter().all(|l| l.attributes.get("run.id") == Some(&serde_json::json!("run_1"))));
    }

    #[tokio::test]
    async fn test_partial_line_emitted_on_drop() {
        let (console, pipeline, exporter) = interceptor();
        let _guard = console.intercept(AttemptContext::new("run_1", "t", 1));
        {
            let mut out = console.stdout();
            write!(out, "no newline").unwrap();
        }
        pipeline.flush().await.unwrap();
        assert_eq!(exporter.logs()[0].message, "no newline");
    }

    #[tokio::test]
    async fn test_guard_restores_after_panic() {
        let (console, _, _) = interceptor();
        let c = console.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = c.intercept(AttemptContext::new("run_1", "t", 1));
            panic!("handler blew up");
        }));
        assert!(result.is_err());
        assert!(!console.is_active());
    }
}
