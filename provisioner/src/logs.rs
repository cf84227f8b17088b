//! Logging configuration
//!
//! Process logs only. Per-run log lines shown to operators go through the
//! progress hub instead.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::errors::ProvisionError;
use crate::settings::Settings;

/// HTTP client internals log every connection at debug; keep them quiet
/// unless asked for explicitly through `RUST_LOG`.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls"];

const LOG_FILE_PREFIX: &str = "fleet-provisioner.log";

/// Verbosity of the provisioner's own modules and the request trace layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub level: LogLevel,

    /// Daily rolling JSON files; stdout only when unset
    pub log_dir: Option<PathBuf>,

    /// JSON lines on stdout, for log shippers
    pub json_stdout: bool,
}

impl From<&Settings> for LogOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            level: settings.log_level,
            log_dir: settings.log_dir.clone(),
            json_stdout: settings.json_logs,
        }
    }
}

impl LogOptions {
    /// Filter used when `RUST_LOG` is not set
    pub fn directives(&self) -> String {
        let level = self.level.as_str();
        let mut directives = vec![
            "warn".to_string(),
            format!("fleet_provisioner={}", level),
            format!("tower_http={}", level),
        ];
        directives.extend(QUIET_TARGETS.iter().map(|target| format!("{}=warn", target)));
        directives.join(",")
    }
}

/// Install the global subscriber. The returned guard flushes the file writer
/// on drop and must live as long as the process.
pub fn init_logging(options: &LogOptions) -> Result<Option<WorkerGuard>, ProvisionError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(options.directives()))
        .map_err(|e| ProvisionError::ConfigError(format!("invalid log filter: {}", e)))?;

    let stdout_layer = if options.json_stdout {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| ProvisionError::ConfigError(e.to_string()))?;

    Ok(guard)
}
