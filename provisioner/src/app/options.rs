//! Application configuration options

use std::time::Duration;

use crate::provisioning::orchestrator::TrackerOptions;
use crate::provisioning::runner::RunnerOptions;
use crate::settings::{ServerSettings, Settings};
use crate::workers::reconciler;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Enable the status server
    pub enable_server: bool,

    /// Enable the fleet reconciler
    pub enable_reconciler: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Reconciler worker options
    pub reconciler: reconciler::Options,

    /// Timeout and retention of provisioning runs
    pub tracker: TrackerOptions,

    /// Polling and health check options
    pub runner: RunnerOptions,

    /// Log lines replayed to late subscribers
    pub log_replay_lines: usize,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for AppOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            enable_server: settings.server.enabled,
            enable_reconciler: settings.reconciler.enabled,
            server: ServerOptions::from(&settings.server),
            reconciler: reconciler::Options::from(&settings.reconciler),
            tracker: TrackerOptions::from(&settings.provisioning),
            runner: RunnerOptions::from(&settings.provisioning),
            log_replay_lines: settings.provisioning.log_replay_lines,
        }
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for ServerOptions {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
        }
    }
}
