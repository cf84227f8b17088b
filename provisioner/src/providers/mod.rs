//! Cloud providers
//!
//! A [`CloudProvider`] is an account-scoped view of a container platform:
//! shared scaffolding, container instances, secrets and logs. It is coarser
//! than a deployment target and knows nothing about gateway profiles.

pub mod container_group;
pub mod unimplemented;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::ProvisionError;
use crate::settings::Settings;
use crate::targets::LogQuery;

use self::container_group::ContainerGroupProvider;
use self::unimplemented::UnimplementedProvider;

/// Known provider kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    ContainerGroup,
    CloudRun,
    FlyMachines,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::ContainerGroup,
        ProviderKind::CloudRun,
        ProviderKind::FlyMachines,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::ContainerGroup => "container-group",
            ProviderKind::CloudRun => "cloud-run",
            ProviderKind::FlyMachines => "fly-machines",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProvisionError::ValidationError(format!("unknown provider: {}", s)))
    }
}

/// Per-call overrides applied by [`CloudProvider::initialize`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub region: Option<String>,
    pub resource_group: Option<String>,
    pub vault_url: Option<String>,
    pub log_workspace_id: Option<String>,
}

/// Result of a non-throwing configuration check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Build from accumulated findings; valid iff there are no errors
    pub fn from_findings(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    pub tags: BTreeMap<String, String>,
}

/// Shared account-level scaffolding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloudResources {
    pub provider: ProviderKind,
    pub region: String,
    pub resource_group: String,
    pub vault_url: Option<String>,
    pub log_workspace_id: Option<String>,
}

/// What to run
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cpu: f64,
    pub memory_gb: f64,
    pub ports: Vec<u16>,
    pub environment: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, SecretString>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerStatus {
    Pending,
    Creating,
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Read model projected from the platform on every query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInstance {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub health: HealthStatus,
    pub provider: ProviderKind,
    pub region: String,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-side narrowing of a listing
#[derive(Debug, Clone, Default)]
pub struct ContainerFilters {
    pub status: Option<ContainerStatus>,
    pub name_prefix: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ContainerFilters {
    pub fn matches(&self, instance: &ContainerInstance) -> bool {
        if let Some(status) = self.status {
            if instance.status != status {
                return false;
            }
        }
        if let Some(prefix) = &self.name_prefix {
            if !instance.name.starts_with(prefix.as_str()) {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(key, value)| instance.metadata.get(key) == Some(value))
    }
}

/// Account-scoped container platform
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Apply overrides on top of the settings the provider was built from
    async fn initialize(&mut self, config: ProviderConfig) -> Result<(), ProvisionError>;

    /// Never fails; findings are returned for the caller to weigh
    async fn validate(&self) -> ValidationResult;

    /// Create or verify shared scaffolding. Idempotent.
    async fn bootstrap(&self, options: &BootstrapOptions) -> Result<CloudResources, ProvisionError>;

    async fn deploy_container(&self, spec: &ContainerSpec)
        -> Result<ContainerInstance, ProvisionError>;

    async fn update_container(
        &self,
        id: &str,
        spec: &ContainerSpec,
    ) -> Result<ContainerInstance, ProvisionError>;

    async fn stop_container(&self, id: &str) -> Result<(), ProvisionError>;

    async fn start_container(&self, id: &str) -> Result<(), ProvisionError>;

    async fn delete_container(&self, id: &str) -> Result<(), ProvisionError>;

    async fn get_container(&self, id: &str) -> Result<ContainerInstance, ProvisionError>;

    /// Only instances managed by this system, narrowed by `filters`
    async fn list_containers(
        &self,
        filters: Option<&ContainerFilters>,
    ) -> Result<Vec<ContainerInstance>, ProvisionError>;

    async fn get_logs(&self, id: &str, query: &LogQuery) -> Result<Vec<String>, ProvisionError>;

    /// Returns a reference the platform can resolve at deploy time
    async fn store_secret(&self, name: &str, value: &SecretString)
        -> Result<String, ProvisionError>;

    /// `None` when the secret does not exist
    async fn get_secret(&self, name: &str) -> Result<Option<SecretString>, ProvisionError>;

    async fn delete_secret(&self, name: &str) -> Result<(), ProvisionError>;

    /// Web console link for the account, or for one instance
    fn console_url(&self, id: Option<&str>) -> String;
}

/// Construct the provider for `kind` from the settings file
pub fn create_provider(
    kind: ProviderKind,
    settings: &Settings,
) -> Result<Box<dyn CloudProvider>, ProvisionError> {
    let provider: Box<dyn CloudProvider> = match kind {
        ProviderKind::ContainerGroup => {
            Box::new(ContainerGroupProvider::from_settings(&settings.container_group)?)
        }
        ProviderKind::CloudRun | ProviderKind::FlyMachines => {
            Box::new(UnimplementedProvider::new(kind))
        }
    };
    Ok(provider)
}
