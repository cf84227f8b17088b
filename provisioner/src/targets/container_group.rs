//! Container-group target
//!
//! One gateway per container group, driven through the container-group
//! provider. Gateway configuration is kept in the secret vault and the group
//! carries only a reference to it; without a vault it is an inline secure
//! variable on the group.

use std::collections::BTreeMap;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::errors::ProvisionError;
use crate::providers::container_group::{profile_labels, ContainerGroupProvider};
use crate::providers::{BootstrapOptions, CloudProvider, ContainerSpec, ContainerStatus};
use crate::settings::ContainerGroupSettings;
use crate::targets::naming::ResourceNames;
use crate::targets::serverless::image_reference;
use crate::targets::{
    ConfigurePayload, ConfigureResult, DeploymentTarget, DestroyReport, Endpoint, InstallOptions,
    InstallResult, LogQuery, TargetKind, TargetStatus,
};

/// Variable pointing the gateway at its configuration secret
pub const CONFIG_SECRET_URI_ENV: &str = "GATEWAY_CONFIG_SECRET_URI";

/// Secure variable carrying the configuration when no vault is configured
pub const CONFIG_SECRET_ENV: &str = "GATEWAY_CONFIG";

pub struct ContainerGroupTarget {
    names: ResourceNames,
    port: u16,
    provider: ContainerGroupProvider,
}

impl ContainerGroupTarget {
    pub fn from_settings(
        names: ResourceNames,
        port: u16,
        settings: &ContainerGroupSettings,
    ) -> Result<Self, ProvisionError> {
        Ok(Self::with_provider(
            names,
            port,
            ContainerGroupProvider::from_settings(settings)?,
        ))
    }

    pub fn with_provider(names: ResourceNames, port: u16, provider: ContainerGroupProvider) -> Self {
        Self {
            names,
            port,
            provider,
        }
    }

    fn group(&self) -> &str {
        &self.names.container_group
    }

    fn container_spec(&self, version_tag: Option<&str>) -> ContainerSpec {
        let settings = self.provider.settings();
        let mut environment = BTreeMap::from([
            ("GATEWAY_PORT".to_string(), self.port.to_string()),
            ("GATEWAY_PROFILE".to_string(), self.names.profile.clone()),
        ]);
        if let Some(uri) = self.provider.secret_uri(&self.names.vault_secret()) {
            environment.insert(CONFIG_SECRET_URI_ENV.to_string(), uri);
        }

        ContainerSpec {
            name: self.names.container_group.clone(),
            image: image_reference(&settings.image, version_tag),
            cpu: settings.cpu,
            memory_gb: settings.memory_gb,
            ports: vec![self.port],
            environment,
            secrets: BTreeMap::new(),
            labels: profile_labels(&self.names.slug),
        }
    }

    /// Without a vault the configuration travels as an inline secure value.
    /// Groups cannot be updated in place, so the group is replaced keeping
    /// its current image.
    async fn redeploy_inline(
        &self,
        document: SecretString,
    ) -> Result<ConfigureResult, ProvisionError> {
        let mut spec = self.container_spec(None);
        match self.provider.get_container(self.group()).await {
            Ok(existing) => {
                if let Some(image) = existing.metadata.get("image") {
                    spec.image = image.clone();
                }
                self.provider.delete_container(self.group()).await?;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        spec.secrets.insert(CONFIG_SECRET_ENV.to_string(), document);
        self.provider.deploy_container(&spec).await?;
        info!("Redeployed {} with inline configuration", self.group());

        Ok(ConfigureResult {
            success: true,
            message: format!(
                "Container group {} redeployed with inline configuration",
                self.group()
            ),
            requires_restart: false,
        })
    }
}

#[async_trait]
impl DeploymentTarget for ContainerGroupTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::ContainerGroup
    }

    fn names(&self) -> &ResourceNames {
        &self.names
    }

    async fn install(&self, options: &InstallOptions) -> Result<InstallResult, ProvisionError> {
        self.check_profile(&options.profile_name)?;
        if self.provider.settings().image.is_empty() {
            return Err(ProvisionError::ConfigError("container-group image is not set".into()));
        }

        let resources = self.provider.bootstrap(&BootstrapOptions::default()).await?;
        debug!("Resource group {} ready in {}", resources.resource_group, resources.region);

        let instance = match self.provider.get_container(self.group()).await {
            Ok(existing) => {
                info!("Container group {} already exists", self.group());
                existing
            }
            Err(e) if e.is_not_found() => {
                let spec = self.container_spec(options.version_tag.as_deref());
                self.provider.deploy_container(&spec).await?
            }
            Err(e) => return Err(e),
        };

        Ok(InstallResult {
            success: true,
            instance_id: instance.id,
            message: format!("Container group {} deployed", self.group()),
        })
    }

    async fn configure(
        &self,
        payload: &ConfigurePayload,
    ) -> Result<ConfigureResult, ProvisionError> {
        self.check_profile(&payload.profile_name)?;

        let document = json!({
            "gatewayPort": payload.gateway_port,
            "environment": payload.environment,
            "config": payload.config,
        });
        let document = SecretString::from(document.to_string());

        if !self.provider.has_vault() {
            return self.redeploy_inline(document).await;
        }

        let reference = self
            .provider
            .store_secret(&self.names.vault_secret(), &document)
            .await?;

        Ok(ConfigureResult {
            success: true,
            message: format!("Configuration stored at {}", reference),
            requires_restart: true,
        })
    }

    async fn start(&self) -> Result<(), ProvisionError> {
        self.provider.start_container(self.group()).await
    }

    async fn stop(&self) -> Result<(), ProvisionError> {
        self.provider.stop_container(self.group()).await
    }

    async fn restart(&self) -> Result<(), ProvisionError> {
        self.provider.restart_container(self.group()).await
    }

    async fn get_status(&self) -> Result<TargetStatus, ProvisionError> {
        let instance = match self.provider.get_container(self.group()).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => return Ok(TargetStatus::not_installed()),
            Err(e) => return Err(e),
        };

        let state = instance
            .metadata
            .get("state")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        Ok(match instance.status {
            ContainerStatus::Running => TargetStatus::running(self.port),
            ContainerStatus::Stopped => TargetStatus::stopped(self.port),
            ContainerStatus::Pending | ContainerStatus::Creating | ContainerStatus::Error => {
                TargetStatus::error(self.port, format!("container group state is {}", state))
            }
        })
    }

    async fn get_logs(&self, query: &LogQuery) -> Vec<String> {
        match self.provider.get_logs(self.group(), query).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Log retrieval for {} failed: {}", self.group(), e);
                Vec::new()
            }
        }
    }

    async fn get_endpoint(&self) -> Result<Endpoint, ProvisionError> {
        let instance = self.provider.get_container(self.group()).await.map_err(|e| {
            if e.is_not_found() {
                ProvisionError::Endpoint(format!("container group {} does not exist", self.group()))
            } else {
                e
            }
        })?;

        let host = instance
            .metadata
            .get("fqdn")
            .or_else(|| instance.metadata.get("ip"))
            .cloned()
            .ok_or_else(|| {
                ProvisionError::Endpoint(format!("container group {} has no public address", self.group()))
            })?;

        Ok(Endpoint {
            host,
            port: self.port,
            protocol: "http".to_string(),
        })
    }

    async fn destroy(&self) -> DestroyReport {
        info!("Destroying container group {}", self.group());
        let mut report = DestroyReport::default();
        report.record("container-group", self.provider.delete_container(self.group()).await);
        if self.provider.has_vault() {
            report.record(
                "secret",
                self.provider.delete_secret(&self.names.vault_secret()).await,
            );
        }
        report
    }
}
