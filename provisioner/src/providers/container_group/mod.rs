//! Container-group provider
//!
//! Each container instance is a single-container group. Secrets go to the
//! vault when one is configured and inline as secure values otherwise.

pub mod client;
pub mod models;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::errors::ProvisionError;
use crate::providers::{
    BootstrapOptions, CloudProvider, CloudResources, ContainerFilters, ContainerInstance,
    ContainerSpec, ContainerStatus, HealthStatus, ProviderConfig, ProviderKind, ValidationResult,
};
use crate::settings::ContainerGroupSettings;
use crate::targets::naming::{MANAGED_BY_TAG, MANAGED_BY_VALUE};
use crate::targets::LogQuery;

use self::client::{
    http_client, ArmClient, ContainerGroupApi, LogAnalytics, LogAnalyticsClient, SecretVault,
    TokenSource, VaultClient,
};
use self::models::{
    Container, ContainerGroup, ContainerProperties, EnvironmentVariable, GroupProperties,
    Identity, IpAddress, Port, ResourceRequests, Resources,
};

/// Suffix of the variable carrying a vault reference instead of a value
pub const SECRET_URI_SUFFIX: &str = "_SECRET_URI";

const DEFAULT_LOG_WINDOW: Duration = Duration::from_secs(60 * 60);

pub struct ContainerGroupProvider {
    settings: ContainerGroupSettings,
    tokens: Option<Arc<TokenSource>>,
    api: Arc<dyn ContainerGroupApi>,
    vault: Option<Arc<dyn SecretVault>>,
    log_analytics: Option<Arc<dyn LogAnalytics>>,
}

impl ContainerGroupProvider {
    /// Build HTTP clients from settings. Performs no network I/O.
    pub fn from_settings(settings: &ContainerGroupSettings) -> Result<Self, ProvisionError> {
        let http = http_client()?;
        let tokens = Arc::new(TokenSource::new(http.clone(), settings));

        let api: Arc<dyn ContainerGroupApi> =
            Arc::new(ArmClient::new(http.clone(), tokens.clone(), settings));
        let vault: Option<Arc<dyn SecretVault>> = settings
            .key_vault_url
            .as_deref()
            .map(|url| Arc::new(VaultClient::new(http.clone(), tokens.clone(), url)) as Arc<dyn SecretVault>);
        let log_analytics: Option<Arc<dyn LogAnalytics>> = settings
            .log_analytics_workspace_id
            .as_deref()
            .map(|id| Arc::new(LogAnalyticsClient::new(http, tokens.clone(), id)) as Arc<dyn LogAnalytics>);

        Ok(Self {
            settings: settings.clone(),
            tokens: Some(tokens),
            api,
            vault,
            log_analytics,
        })
    }

    /// Build around caller-supplied clients
    pub fn with_clients(
        settings: ContainerGroupSettings,
        api: Arc<dyn ContainerGroupApi>,
        vault: Option<Arc<dyn SecretVault>>,
        log_analytics: Option<Arc<dyn LogAnalytics>>,
    ) -> Self {
        Self {
            settings,
            tokens: None,
            api,
            vault,
            log_analytics,
        }
    }

    pub fn settings(&self) -> &ContainerGroupSettings {
        &self.settings
    }

    pub fn has_vault(&self) -> bool {
        self.vault.is_some()
    }

    /// Address of a vault secret, whether or not it exists yet
    pub fn secret_uri(&self, name: &str) -> Option<String> {
        self.vault
            .as_ref()
            .map(|vault| format!("{}/secrets/{}", vault.vault_url(), name))
    }

    fn resource_group(&self) -> &str {
        &self.settings.resource_group
    }

    /// Force a restart of every container in the group
    pub async fn restart_container(&self, id: &str) -> Result<(), ProvisionError> {
        info!("Restarting container group {}", id);
        self.api.restart_group(self.resource_group(), id).await
    }

    async fn build_group(&self, spec: &ContainerSpec) -> Result<ContainerGroup, ProvisionError> {
        let mut environment: Vec<EnvironmentVariable> = spec
            .environment
            .iter()
            .map(|(name, value)| EnvironmentVariable {
                name: name.clone(),
                value: Some(value.clone()),
                secure_value: None,
            })
            .collect();

        for (key, value) in &spec.secrets {
            match &self.vault {
                Some(_) => {
                    let secret_name = vault_secret_name(&spec.name, key);
                    let reference = self.store_secret(&secret_name, value).await?;
                    environment.push(EnvironmentVariable {
                        name: format!("{}{}", key, SECRET_URI_SUFFIX),
                        value: Some(reference),
                        secure_value: None,
                    });
                }
                None => environment.push(EnvironmentVariable {
                    name: key.clone(),
                    value: None,
                    secure_value: Some(value.expose_secret().to_string()),
                }),
            }
        }

        let ports: Vec<Port> = spec.ports.iter().copied().map(Port::tcp).collect();
        let mut tags = spec.labels.clone();
        tags.insert(MANAGED_BY_TAG.to_string(), MANAGED_BY_VALUE.to_string());

        Ok(ContainerGroup {
            location: self.settings.location.clone(),
            tags,
            identity: self.vault.as_ref().map(|_| Identity::system_assigned()),
            properties: GroupProperties {
                containers: vec![Container {
                    name: crate::targets::naming::GATEWAY_CONTAINER.to_string(),
                    properties: ContainerProperties {
                        image: spec.image.clone(),
                        ports: ports.clone(),
                        environment_variables: environment,
                        resources: Resources {
                            requests: ResourceRequests {
                                cpu: spec.cpu,
                                memory_in_gb: spec.memory_gb,
                            },
                        },
                        instance_view: None,
                    },
                }],
                os_type: "Linux".to_string(),
                restart_policy: "Always".to_string(),
                ip_address: (!ports.is_empty()).then(|| IpAddress {
                    kind: "Public".to_string(),
                    ports,
                    dns_name_label: Some(spec.name.clone()),
                    ip: None,
                    fqdn: None,
                }),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn project(&self, group: ContainerGroup) -> ContainerInstance {
        let status = container_status(&group);
        let health = match status {
            ContainerStatus::Running if group.restart_count() == 0 => HealthStatus::Healthy,
            ContainerStatus::Running | ContainerStatus::Error => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        };

        let mut metadata = group.tags.clone();
        if let Some(fqdn) = group.fqdn() {
            metadata.insert("fqdn".to_string(), fqdn.to_string());
        }
        if let Some(ip) = group.ip() {
            metadata.insert("ip".to_string(), ip.to_string());
        }
        if let Some(container) = group.properties.containers.first() {
            metadata.insert("image".to_string(), container.properties.image.clone());
            metadata.insert("container".to_string(), container.name.clone());
        }
        if let Some(state) = group.state() {
            metadata.insert("state".to_string(), state.to_string());
        }

        let now = Utc::now();
        let created_at = group
            .system_data
            .as_ref()
            .and_then(|d| d.created_at)
            .unwrap_or(now);
        let updated_at = group
            .system_data
            .as_ref()
            .and_then(|d| d.last_modified_at)
            .unwrap_or(created_at);
        let name = if group.name.is_empty() {
            group.id.rsplit('/').next().unwrap_or_default().to_string()
        } else {
            group.name.clone()
        };

        ContainerInstance {
            id: name.clone(),
            name,
            status,
            health,
            provider: ProviderKind::ContainerGroup,
            region: group.location,
            metadata,
            created_at,
            updated_at,
        }
    }

    async fn direct_logs(&self, id: &str, query: &LogQuery) -> Result<Vec<String>, ProvisionError> {
        let group = self.api.get_group(self.resource_group(), id).await?;
        let container = group
            .properties
            .containers
            .first()
            .map(|c| c.name.clone())
            .ok_or_else(|| ProvisionError::NotFound(format!("group {} has no containers", id)))?;

        let content = self
            .api
            .container_logs(self.resource_group(), id, &container, query.lines())
            .await?;
        Ok(content
            .lines()
            .filter(|line| query.filter.as_deref().map_or(true, |f| line.contains(f)))
            .map(str::to_string)
            .collect())
    }

    async fn analytics_logs(
        &self,
        log_analytics: &dyn LogAnalytics,
        id: &str,
        query: &LogQuery,
    ) -> Result<Vec<String>, ProvisionError> {
        let mut kql = format!(
            "ContainerInstanceLog_CL | where ContainerGroup_s == '{}'",
            escape_kql(id)
        );
        if let Some(filter) = &query.filter {
            kql.push_str(&format!(" | where Message contains '{}'", escape_kql(filter)));
        }
        kql.push_str(&format!(
            " | project TimeGenerated, Message | order by TimeGenerated desc | take {}",
            query.lines()
        ));

        let rows = log_analytics
            .query(&kql, query.since.unwrap_or(DEFAULT_LOG_WINDOW))
            .await?;
        // Newest first from the query; callers expect chronological order
        Ok(rows
            .into_iter()
            .rev()
            .filter_map(|row| row.get(1).and_then(|m| m.as_str()).map(str::to_string))
            .collect())
    }
}

#[async_trait]
impl CloudProvider for ContainerGroupProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ContainerGroup
    }

    async fn initialize(&mut self, config: ProviderConfig) -> Result<(), ProvisionError> {
        if let Some(region) = config.region {
            self.settings.location = region;
        }
        if let Some(resource_group) = config.resource_group {
            self.settings.resource_group = resource_group;
        }

        let tokens = self.tokens.clone();
        if let Some(url) = config.vault_url {
            let tokens = tokens.clone().ok_or_else(|| {
                ProvisionError::ConfigError("cannot attach a vault to injected clients".into())
            })?;
            self.vault = Some(Arc::new(VaultClient::new(http_client()?, tokens, &url)));
            self.settings.key_vault_url = Some(url);
        }
        if let Some(workspace) = config.log_workspace_id {
            let tokens = tokens.ok_or_else(|| {
                ProvisionError::ConfigError("cannot attach a log workspace to injected clients".into())
            })?;
            self.log_analytics = Some(Arc::new(LogAnalyticsClient::new(http_client()?, tokens, &workspace)));
            self.settings.log_analytics_workspace_id = Some(workspace);
        }
        Ok(())
    }

    async fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let s = &self.settings;

        for (value, field) in [
            (&s.subscription_id, "subscription_id"),
            (&s.tenant_id, "tenant_id"),
            (&s.client_id, "client_id"),
            (&s.resource_group, "resource_group"),
            (&s.location, "location"),
            (&s.image, "image"),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("{} is required", field));
            }
        }
        if s.client_secret.is_none() {
            errors.push("client_secret is required".to_string());
        }
        if s.cpu <= 0.0 || s.memory_gb <= 0.0 {
            errors.push("cpu and memory_gb must be positive".to_string());
        }
        if self.vault.is_none() {
            warnings.push("no key vault configured; secrets are passed as inline secure values".to_string());
        }
        if self.log_analytics.is_none() {
            warnings.push("no log-analytics workspace configured; no fallback when direct logs fail".to_string());
        }

        ValidationResult::from_findings(errors, warnings)
    }

    async fn bootstrap(&self, options: &BootstrapOptions) -> Result<CloudResources, ProvisionError> {
        let mut tags = options.tags.clone();
        tags.insert(MANAGED_BY_TAG.to_string(), MANAGED_BY_VALUE.to_string());

        debug!("Ensuring resource group {}", self.resource_group());
        self.api
            .ensure_resource_group(self.resource_group(), &self.settings.location, &tags)
            .await?;

        Ok(CloudResources {
            provider: ProviderKind::ContainerGroup,
            region: self.settings.location.clone(),
            resource_group: self.settings.resource_group.clone(),
            vault_url: self.vault.as_ref().map(|v| v.vault_url().to_string()),
            log_workspace_id: self.settings.log_analytics_workspace_id.clone(),
        })
    }

    async fn deploy_container(&self, spec: &ContainerSpec) -> Result<ContainerInstance, ProvisionError> {
        info!("Deploying container group {} from {}", spec.name, spec.image);
        let group = self.build_group(spec).await?;
        let created = self
            .api
            .create_or_update_group(self.resource_group(), &spec.name, &group)
            .await?;
        Ok(self.project(created))
    }

    async fn update_container(
        &self,
        id: &str,
        _spec: &ContainerSpec,
    ) -> Result<ContainerInstance, ProvisionError> {
        Err(ProvisionError::Unsupported(format!(
            "container group {} cannot be updated in place; delete and redeploy it",
            id
        )))
    }

    async fn stop_container(&self, id: &str) -> Result<(), ProvisionError> {
        info!("Stopping container group {}", id);
        self.api.stop_group(self.resource_group(), id).await
    }

    async fn start_container(&self, id: &str) -> Result<(), ProvisionError> {
        info!("Starting container group {}", id);
        self.api.start_group(self.resource_group(), id).await
    }

    async fn delete_container(&self, id: &str) -> Result<(), ProvisionError> {
        info!("Deleting container group {}", id);
        self.api.delete_group(self.resource_group(), id).await
    }

    async fn get_container(&self, id: &str) -> Result<ContainerInstance, ProvisionError> {
        let group = self.api.get_group(self.resource_group(), id).await?;
        Ok(self.project(group))
    }

    async fn list_containers(
        &self,
        filters: Option<&ContainerFilters>,
    ) -> Result<Vec<ContainerInstance>, ProvisionError> {
        let groups = self.api.list_groups(self.resource_group()).await?;
        Ok(groups
            .into_iter()
            .filter(|g| g.tags.get(MANAGED_BY_TAG).map(String::as_str) == Some(MANAGED_BY_VALUE))
            .map(|g| self.project(g))
            .filter(|instance| filters.map_or(true, |f| f.matches(instance)))
            .collect())
    }

    async fn get_logs(&self, id: &str, query: &LogQuery) -> Result<Vec<String>, ProvisionError> {
        match self.direct_logs(id, query).await {
            Ok(lines) => Ok(lines),
            Err(e) => match &self.log_analytics {
                Some(log_analytics) => {
                    warn!("Direct logs for {} failed ({}), querying workspace", id, e);
                    self.analytics_logs(log_analytics.as_ref(), id, query).await
                }
                None => Err(e),
            },
        }
    }

    async fn store_secret(&self, name: &str, value: &SecretString) -> Result<String, ProvisionError> {
        let vault = self
            .vault
            .as_ref()
            .ok_or_else(|| ProvisionError::Unsupported("no key vault configured".into()))?;

        match vault.create_secret(name, value).await {
            Ok(id) => Ok(id),
            Err(e) if e.is_conflict() => {
                debug!("Secret {} exists in a deleted state, updating", name);
                vault.update_secret(name, value).await
            }
            Err(e) => Err(e),
        }
    }

    async fn get_secret(&self, name: &str) -> Result<Option<SecretString>, ProvisionError> {
        match &self.vault {
            Some(vault) => vault.get_secret(name).await,
            None => Err(ProvisionError::Unsupported("no key vault configured".into())),
        }
    }

    async fn delete_secret(&self, name: &str) -> Result<(), ProvisionError> {
        match &self.vault {
            Some(vault) => vault.delete_secret(name).await,
            None => Err(ProvisionError::Unsupported("no key vault configured".into())),
        }
    }

    fn console_url(&self, id: Option<&str>) -> String {
        let s = &self.settings;
        let base = format!(
            "https://portal.azure.com/#@{}/resource/subscriptions/{}/resourceGroups/{}",
            s.tenant_id, s.subscription_id, s.resource_group
        );
        match id {
            Some(id) => format!(
                "{}/providers/Microsoft.ContainerInstance/containerGroups/{}/overview",
                base, id
            ),
            None => format!("{}/overview", base),
        }
    }
}

fn container_status(group: &ContainerGroup) -> ContainerStatus {
    match group.properties.provisioning_state.as_deref() {
        Some("Failed") => return ContainerStatus::Error,
        Some("Creating") | Some("Updating") => return ContainerStatus::Creating,
        Some("Pending") => return ContainerStatus::Pending,
        _ => {}
    }
    match group.state() {
        Some("Running") => ContainerStatus::Running,
        Some("Stopped") | Some("Terminated") | Some("Succeeded") => ContainerStatus::Stopped,
        Some("Pending") | Some("Waiting") | None => ContainerStatus::Pending,
        Some(_) => ContainerStatus::Error,
    }
}

/// Vault names allow alphanumerics and dashes only
fn vault_secret_name(group: &str, key: &str) -> String {
    let key: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("{}-{}", group, key.trim_matches('-'))
}

fn escape_kql(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Labels to attach to every group for a given profile
pub fn profile_labels(profile_slug: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        crate::targets::naming::PROFILE_TAG.to_string(),
        profile_slug.to_string(),
    )])
}
