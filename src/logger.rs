//! Structured logging for task code.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::engine::MetadataMap;
use crate::telemetry::{LogRecord, TelemetryPipeline};

/// Severity of a task log record, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Log,
    #[default]
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(Self::Debug),
            "log" => Ok(Self::Log),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Log => "log",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Logger handed to task code.
///
/// Records go to the telemetry pipeline, which tags them with the current
/// attempt. Records below `min_level` are dropped.
#[derive(Clone)]
pub struct TaskLogger {
    pipeline: TelemetryPipeline,
    min_level: LogLevel,
}

impl TaskLogger {
    pub fn new(pipeline: TelemetryPipeline, min_level: LogLevel) -> Self {
        Self { pipeline, min_level }
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Emit a record with structured attributes.
    pub fn emit(&self, level: LogLevel, message: impl Into<String>, attributes: MetadataMap) {
        if !self.enabled(level) {
            return;
        }
        let mut record = LogRecord::new(level, message);
        record.attributes.extend(attributes);
        self.pipeline.emit_log(record);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(LogLevel::Debug, message, MetadataMap::new());
    }

    pub fn log(&self, message: impl Into<String>) {
        self.emit(LogLevel::Log, message, MetadataMap::new());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogLevel::Info, message, MetadataMap::new());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(LogLevel::Warn, message, MetadataMap::new());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogLevel::Error, message, MetadataMap::new());
    }
}
