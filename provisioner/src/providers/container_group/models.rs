//! Wire models for the container-group management API

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerGroup {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub location: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    pub properties: GroupProperties,
    #[serde(default, skip_serializing)]
    pub system_data: Option<SystemData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Identity {
    pub fn system_assigned() -> Self {
        Self {
            kind: "SystemAssigned".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupProperties {
    #[serde(default, skip_serializing)]
    pub provisioning_state: Option<String>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default = "default_os_type")]
    pub os_type: String,
    #[serde(default = "default_restart_policy")]
    pub restart_policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<IpAddress>,
    #[serde(default, skip_serializing)]
    pub instance_view: Option<GroupInstanceView>,
}

fn default_os_type() -> String {
    "Linux".to_string()
}

fn default_restart_policy() -> String {
    "Always".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub properties: ContainerProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerProperties {
    pub image: String,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub environment_variables: Vec<EnvironmentVariable>,
    pub resources: Resources,
    #[serde(default, skip_serializing)]
    pub instance_view: Option<ContainerInstanceView>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

impl Port {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: default_protocol(),
        }
    }
}

/// Exactly one of `value` / `secure_value` is set
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentVariable {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_value: Option<String>,
}

impl std::fmt::Debug for EnvironmentVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentVariable")
            .field("name", &self.name)
            .field("value", &self.value)
            .field("secure_value", &self.secure_value.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub requests: ResourceRequests,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequests {
    pub cpu: f64,
    #[serde(rename = "memoryInGB")]
    pub memory_in_gb: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpAddress {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_name_label: Option<String>,
    #[serde(default, skip_serializing)]
    pub ip: Option<String>,
    #[serde(default, skip_serializing)]
    pub fqdn: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupInstanceView {
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInstanceView {
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub current_state: Option<ContainerState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub detail_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemData {
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modified_at: Option<DateTime<Utc>>,
}

/// Paged listing
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupList {
    #[serde(default)]
    pub value: Vec<ContainerGroup>,
    #[serde(default)]
    pub next_link: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContainerLogs {
    #[serde(default)]
    pub content: String,
}

impl ContainerGroup {
    /// Group-level state, falling back to the first container's state
    pub fn state(&self) -> Option<&str> {
        self.properties
            .instance_view
            .as_ref()
            .and_then(|view| view.state.as_deref())
            .or_else(|| {
                self.properties
                    .containers
                    .first()
                    .and_then(|c| c.properties.instance_view.as_ref())
                    .and_then(|view| view.current_state.as_ref())
                    .and_then(|state| state.state.as_deref())
            })
    }

    pub fn restart_count(&self) -> u32 {
        self.properties
            .containers
            .iter()
            .filter_map(|c| c.properties.instance_view.as_ref())
            .map(|view| view.restart_count)
            .sum()
    }

    pub fn fqdn(&self) -> Option<&str> {
        self.properties
            .ip_address
            .as_ref()
            .and_then(|ip| ip.fqdn.as_deref())
            .filter(|fqdn| !fqdn.is_empty())
    }

    pub fn ip(&self) -> Option<&str> {
        self.properties
            .ip_address
            .as_ref()
            .and_then(|ip| ip.ip.as_deref())
            .filter(|ip| !ip.is_empty())
    }
}
