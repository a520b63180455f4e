//! Worker configuration read from the environment.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::logger::LogLevel;
use crate::runtime::ExecutionMode;

const KEYS: &[&str] = &[
    "RUNWORKER_EXECUTION_MODE",
    "RUNWORKER_MAX_DURATION_SECS",
    "RUNWORKER_ENGINE_URL",
    "RUNWORKER_ENGINE_TIMEOUT_MS",
    "RUNWORKER_WARM_START_URL",
    "RUNWORKER_WORKER_ID",
    "RUNWORKER_HEARTBEAT_INTERVAL_MS",
    "RUNWORKER_METADATA_FLUSH_MS",
    "RUNWORKER_DRAIN_TIMEOUT_MS",
    "RUNWORKER_TIMEOUT_GRACE_MS",
    "RUNWORKER_REPORT_MAX_ATTEMPTS",
    "RUNWORKER_CAPTURE_CONSOLE",
    "OTEL_EXPORTER_OTLP_ENDPOINT",
    "OTEL_SERVICE_NAME",
    "RUNWORKER_LOG_LEVEL",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}='{value}': {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{0} is required")]
    Missing(String),
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

/// Settings for [`crate::telemetry::TracingSdk`].
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
    pub log_level: LogLevel,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: "runworker".to_string(),
            log_level: LogLevel::Info,
        }
    }
}

impl TelemetryConfig {
    /// `EnvFilter` directive for the configured level.
    pub fn filter_directive(&self) -> &'static str {
        match self.log_level {
            LogLevel::Debug => "debug",
            LogLevel::Log | LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Configuration of one worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub mode: ExecutionMode,
    pub worker_id: String,
    /// Usage limit for tasks that do not set their own.
    pub default_max_duration: Option<Duration>,
    pub engine_url: Option<String>,
    /// Per-request timeout of the Run Engine client.
    pub engine_timeout: Duration,
    pub warm_start_url: Option<String>,
    pub heartbeat_interval: Duration,
    pub metadata_flush_interval: Duration,
    pub drain_timeout: Duration,
    /// Time a timed-out handler gets to observe cancellation before it is dropped.
    pub timeout_grace: Duration,
    pub report_max_attempts: u32,
    /// Redirect the process's stdout/stderr into attempt logs while a task runs.
    pub capture_console: bool,
    pub telemetry: TelemetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Dev,
            worker_id: uuid::Uuid::new_v4().to_string(),
            default_max_duration: None,
            engine_url: None,
            engine_timeout: Duration::from_millis(30_000),
            warm_start_url: None,
            heartbeat_interval: Duration::from_millis(20_000),
            metadata_flush_interval: Duration::from_millis(1_000),
            drain_timeout: Duration::from_millis(30_000),
            timeout_grace: Duration::ZERO,
            report_max_attempts: 5,
            capture_console: true,
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut envs = HashMap::new();
        for key in KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            envs.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |key: &str| -> Result<Option<u64>, ConfigError> {
            get(key).map(|v| parse_value::<u64>(key, &v)).transpose()
        };
        let millis = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(number(key)?.map(Duration::from_millis).unwrap_or(default))
        };

        let defaults = Self::default();

        let mode = match get("RUNWORKER_EXECUTION_MODE") {
            Some(v) => v.parse().map_err(|reason| ConfigError::Invalid {
                key: "RUNWORKER_EXECUTION_MODE".to_string(),
                value: v.clone(),
                reason,
            })?,
            None => ExecutionMode::Dev,
        };

        let log_level = match get("RUNWORKER_LOG_LEVEL") {
            Some(v) => v.parse().map_err(|reason| ConfigError::Invalid {
                key: "RUNWORKER_LOG_LEVEL".to_string(),
                value: v.clone(),
                reason,
            })?,
            None => LogLevel::Info,
        };

        let report_max_attempts = match get("RUNWORKER_REPORT_MAX_ATTEMPTS") {
            Some(v) => parse_value::<u32>("RUNWORKER_REPORT_MAX_ATTEMPTS", &v)?,
            None => defaults.report_max_attempts,
        };
        if report_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "RUNWORKER_REPORT_MAX_ATTEMPTS".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let capture_console = match get("RUNWORKER_CAPTURE_CONSOLE") {
            Some(v) => parse_flag("RUNWORKER_CAPTURE_CONSOLE", &v)?,
            None => defaults.capture_console,
        };

        let engine_url = get("RUNWORKER_ENGINE_URL");
        if mode == ExecutionMode::Managed && engine_url.is_none() {
            return Err(ConfigError::Missing(
                "RUNWORKER_ENGINE_URL (managed execution mode)".to_string(),
            ));
        }

        Ok(Self {
            mode,
            worker_id: get("RUNWORKER_WORKER_ID").unwrap_or(defaults.worker_id),
            default_max_duration: number("RUNWORKER_MAX_DURATION_SECS")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            engine_url,
            engine_timeout: millis("RUNWORKER_ENGINE_TIMEOUT_MS", defaults.engine_timeout)?,
            warm_start_url: get("RUNWORKER_WARM_START_URL"),
            heartbeat_interval: millis("RUNWORKER_HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval)?,
            metadata_flush_interval: millis("RUNWORKER_METADATA_FLUSH_MS", defaults.metadata_flush_interval)?,
            drain_timeout: millis("RUNWORKER_DRAIN_TIMEOUT_MS", defaults.drain_timeout)?,
            timeout_grace: millis("RUNWORKER_TIMEOUT_GRACE_MS", defaults.timeout_grace)?,
            report_max_attempts,
            capture_console,
            telemetry: TelemetryConfig {
                otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT"),
                service_name: get("OTEL_SERVICE_NAME").unwrap_or(defaults.telemetry.service_name),
                log_level,
            },
        })
    }
}
