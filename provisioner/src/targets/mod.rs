//! Deployment targets
//!
//! A [`DeploymentTarget`] drives one gateway instance on one execution
//! backend. Adapters are bound to a profile at construction and derive every
//! resource name from it, so they hold no state that needs persisting.

pub mod command;
pub mod container_group;
pub mod local;
pub mod naming;
pub mod serverless;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ProvisionError;
use crate::models::instance::InstanceRecord;
use crate::settings::Settings;

use self::command::ProcessRunner;
use self::container_group::ContainerGroupTarget;
use self::local::LocalTarget;
use self::naming::ResourceNames;
use self::serverless::ServerlessTarget;

/// Execution backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    ServerlessContainer,
    ContainerGroup,
    LocalService,
}

impl TargetKind {
    pub const ALL: [TargetKind; 3] = [
        TargetKind::ServerlessContainer,
        TargetKind::ContainerGroup,
        TargetKind::LocalService,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::ServerlessContainer => "serverless-container",
            TargetKind::ContainerGroup => "container-group",
            TargetKind::LocalService => "local-service",
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TargetKind {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProvisionError::ValidationError(format!("unknown target kind: {}", s)))
    }
}

/// Install request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallOptions {
    pub profile_name: String,
    pub port: u16,
    #[serde(default)]
    pub version_tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallResult {
    pub success: bool,
    pub instance_id: String,
    pub message: String,
}

/// Configuration pushed to a running or installed gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurePayload {
    pub profile_name: String,
    pub gateway_port: u16,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureResult {
    pub success: bool,
    pub message: String,

    /// The workload keeps the old configuration until restarted
    pub requires_restart: bool,
}

/// Coarse workload state as seen by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetState {
    NotInstalled,
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetStatus {
    pub state: TargetState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetStatus {
    pub fn not_installed() -> Self {
        Self {
            state: TargetState::NotInstalled,
            gateway_port: None,
            error: None,
        }
    }

    pub fn running(port: u16) -> Self {
        Self {
            state: TargetState::Running,
            gateway_port: Some(port),
            error: None,
        }
    }

    pub fn stopped(port: u16) -> Self {
        Self {
            state: TargetState::Stopped,
            gateway_port: Some(port),
            error: None,
        }
    }

    pub fn error(port: u16, message: impl Into<String>) -> Self {
        Self {
            state: TargetState::Error,
            gateway_port: Some(port),
            error: Some(message.into()),
        }
    }
}

/// Log retrieval options
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub lines: Option<usize>,
    pub since: Option<Duration>,
    pub filter: Option<String>,
}

impl LogQuery {
    pub const DEFAULT_LINES: usize = 100;

    pub fn lines(&self) -> usize {
        self.lines.unwrap_or(Self::DEFAULT_LINES)
    }
}

/// Externally reachable gateway address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub protocol: String,
}

impl Endpoint {
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Outcome of a best-effort teardown
#[derive(Debug, Clone, Default, Serialize)]
pub struct DestroyReport {
    /// Resource classes removed or already absent
    pub removed: Vec<String>,

    /// Resource classes whose deletion failed, with the reason
    pub failed: Vec<(String, String)>,
}

impl DestroyReport {
    /// Fold one resource class's deletion result into the report.
    /// An absent resource counts as removed.
    pub fn record(&mut self, resource: &str, result: Result<(), ProvisionError>) {
        match result {
            Ok(()) => self.removed.push(resource.to_string()),
            Err(e) if e.is_not_found() => self.removed.push(resource.to_string()),
            Err(e) => {
                tracing::warn!("Failed to delete {}: {}", resource, e);
                self.failed.push((resource.to_string(), e.to_string()));
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Operations every execution backend implements
#[async_trait]
pub trait DeploymentTarget: Send + Sync {
    fn kind(&self) -> TargetKind;

    /// Resource names derived from the bound profile
    fn names(&self) -> &ResourceNames;

    /// Create every resource the gateway needs. Re-entrant: shared resources
    /// are created or verified, per-instance resources are named deterministically.
    async fn install(&self, options: &InstallOptions) -> Result<InstallResult, ProvisionError>;

    /// Upsert gateway configuration without restarting the workload
    async fn configure(&self, payload: &ConfigurePayload)
        -> Result<ConfigureResult, ProvisionError>;

    async fn start(&self) -> Result<(), ProvisionError>;

    async fn stop(&self) -> Result<(), ProvisionError>;

    /// Force a new deployment so updated configuration or image is picked up
    async fn restart(&self) -> Result<(), ProvisionError>;

    /// Never fails on a missing resource; that is `NotInstalled`
    async fn get_status(&self) -> Result<TargetStatus, ProvisionError>;

    /// Best-effort; any remote failure yields an empty list
    async fn get_logs(&self, query: &LogQuery) -> Vec<String>;

    /// Fails when any lookup along the way comes back empty
    async fn get_endpoint(&self) -> Result<Endpoint, ProvisionError>;

    /// Remove every resource class independently; absent resources are fine
    async fn destroy(&self) -> DestroyReport;

    /// Reject requests addressed to a different profile than the one bound
    fn check_profile(&self, profile_name: &str) -> Result<(), ProvisionError> {
        if self.names().profile == profile_name {
            Ok(())
        } else {
            Err(ProvisionError::ValidationError(format!(
                "target bound to profile '{}' cannot act on '{}'",
                self.names().profile,
                profile_name
            )))
        }
    }
}

/// Builds the target for a stored instance
pub trait TargetFactory: Send + Sync {
    fn create(&self, record: &InstanceRecord) -> Result<Arc<dyn DeploymentTarget>, ProvisionError>;
}

/// Builds targets from the settings file
pub struct SettingsTargetFactory {
    settings: Arc<Settings>,
}

impl SettingsTargetFactory {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }
}

impl TargetFactory for SettingsTargetFactory {
    fn create(&self, record: &InstanceRecord) -> Result<Arc<dyn DeploymentTarget>, ProvisionError> {
        create_target(record.target, &record.profile_name, record.port, &self.settings)
    }
}

/// Select and construct the concrete adapter for `kind`
pub fn create_target(
    kind: TargetKind,
    profile_name: &str,
    port: u16,
    settings: &Settings,
) -> Result<Arc<dyn DeploymentTarget>, ProvisionError> {
    let names = ResourceNames::for_profile(profile_name)?;
    let target: Arc<dyn DeploymentTarget> = match kind {
        TargetKind::ServerlessContainer => Arc::new(ServerlessTarget::new(
            names,
            port,
            settings.serverless.clone(),
            Arc::new(ProcessRunner),
        )),
        TargetKind::ContainerGroup => Arc::new(ContainerGroupTarget::from_settings(
            names,
            port,
            &settings.container_group,
        )?),
        TargetKind::LocalService => Arc::new(LocalTarget::new(
            names,
            port,
            settings.local.clone(),
            Arc::new(ProcessRunner),
        )),
    };
    Ok(target)
}
