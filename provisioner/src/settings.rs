//! Settings file management

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::ProvisionError;
use crate::logs::LogLevel;

/// Default location of the settings file
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/fleet-provisioner/settings.json";

/// Provisioner settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log level
    pub log_level: LogLevel,

    /// Directory for rolling log files
    pub log_dir: Option<PathBuf>,

    /// Emit stdout logs as JSON
    pub json_logs: bool,

    /// JSON array of instance records seeding the in-process store
    pub instances_file: Option<PathBuf>,

    /// Status server configuration
    pub server: ServerSettings,

    /// Provisioning run configuration
    pub provisioning: ProvisioningSettings,

    /// Fleet reconciler configuration
    pub reconciler: ReconcilerSettings,

    /// Serverless-container backend inputs
    pub serverless: ServerlessSettings,

    /// Container-group backend inputs
    pub container_group: ContainerGroupSettings,

    /// Local docker backend inputs
    pub local: LocalSettings,
}

impl Settings {
    /// Load settings from a JSON file. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self, ProvisionError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let settings = serde_json::from_str(&contents)?;
                info!("Loaded settings from {}", path.display());
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Settings file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Status server settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Provisioning run settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisioningSettings {
    /// Overall deadline for one provisioning run
    pub timeout_secs: u64,

    /// How long a completed run stays queryable
    pub completed_retention_secs: u64,

    /// How long a failed or timed-out run stays queryable
    pub failed_retention_secs: u64,

    /// Log lines kept per instance for late subscribers
    pub log_replay_lines: usize,

    /// Status polls while waiting for the workload to run
    pub running_poll_attempts: u32,
    pub running_poll_base_delay_secs: u64,
    pub running_poll_max_delay_secs: u64,

    /// Health check
    pub health_check_timeout_secs: u64,
    pub health_path: String,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 15 * 60,
            completed_retention_secs: 60,
            failed_retention_secs: 5 * 60,
            log_replay_lines: 200,
            running_poll_attempts: 8,
            running_poll_base_delay_secs: 2,
            running_poll_max_delay_secs: 30,
            health_check_timeout_secs: 5,
            health_path: "/health".to_string(),
        }
    }
}

/// Fleet reconciler settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcilerSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub initial_delay_secs: u64,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            initial_delay_secs: 5,
        }
    }
}

/// Serverless-container backend settings.
///
/// Credentials and region are injected into every CLI call; nothing is read
/// from the ambient environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerlessSettings {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: Option<SecretString>,
    pub session_token: Option<SecretString>,

    /// Shared cluster, created on first install
    pub cluster: String,

    pub image: String,
    pub cpu: String,
    pub memory: String,

    /// Network placement
    pub subnets: Vec<String>,
    pub security_group: Option<String>,
    pub assign_public_ip: bool,

    pub execution_role_arn: Option<String>,
    pub task_role_arn: Option<String>,

    /// Path to the platform CLI
    pub cli_path: String,
}

impl Default for ServerlessSettings {
    fn default() -> Self {
        Self {
            region: String::new(),
            access_key_id: String::new(),
            secret_access_key: None,
            session_token: None,
            cluster: "gateway-fleet".to_string(),
            image: String::new(),
            cpu: "1024".to_string(),
            memory: "2048".to_string(),
            subnets: Vec::new(),
            security_group: None,
            assign_public_ip: true,
            execution_role_arn: None,
            task_role_arn: None,
            cli_path: "aws".to_string(),
        }
    }
}

/// Container-group backend settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerGroupSettings {
    pub subscription_id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Option<SecretString>,

    /// Resource group holding every managed container group
    pub resource_group: String,
    pub location: String,

    pub image: String,
    pub cpu: f64,
    pub memory_gb: f64,

    /// Secret vault; secrets are inlined as secure values when unset
    pub key_vault_url: Option<String>,

    /// Log-analytics workspace used when direct log retrieval fails
    pub log_analytics_workspace_id: Option<String>,

    pub management_endpoint: String,
    pub login_endpoint: String,
}

impl Default for ContainerGroupSettings {
    fn default() -> Self {
        Self {
            subscription_id: String::new(),
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: None,
            resource_group: "gateway-fleet".to_string(),
            location: "westeurope".to_string(),
            image: String::new(),
            cpu: 1.0,
            memory_gb: 2.0,
            key_vault_url: None,
            log_analytics_workspace_id: None,
            management_endpoint: "https://management.azure.com".to_string(),
            login_endpoint: "https://login.microsoftonline.com".to_string(),
        }
    }
}

/// Local docker backend settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    pub image: String,
    pub docker_path: String,
    pub data_dir: PathBuf,
    pub bind_host: String,

    /// Token for `docker login` against the image registry
    pub registry_token: Option<SecretString>,
    pub registry_user: String,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            image: String::new(),
            docker_path: "docker".to_string(),
            data_dir: PathBuf::from("/var/lib/fleet-provisioner/instances"),
            bind_host: "127.0.0.1".to_string(),
            registry_token: None,
            registry_user: "fleet-provisioner".to_string(),
        }
    }
}
