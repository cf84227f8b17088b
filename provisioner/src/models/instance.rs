//! Gateway instance records
//!
//! Records are owned by the persistence layer; this crate only reads them and
//! reports status transitions back through [`InstanceStore`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ProvisionError;
use crate::targets::naming::slugify;
use crate::targets::TargetKind;

/// Persisted instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Requested, provisioning not yet started
    Pending,
    Provisioning,
    Running,
    Stopped,
    Error,
    Destroyed,
}

/// What the operator wants the instance to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Running,
    Stopped,
    Destroyed,
}

/// A gateway instance as stored by the persistence layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,

    /// Profile name; every backend resource name derives from it
    pub profile_name: String,

    /// Backend kind the instance runs on
    pub target: TargetKind,

    pub status: InstanceStatus,

    #[serde(default)]
    pub desired: DesiredState,

    /// Gateway listen port
    pub port: u16,

    #[serde(default)]
    pub version_tag: Option<String>,

    /// Plain environment for the gateway process
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Gateway configuration document
    #[serde(default)]
    pub config: serde_json::Value,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Read/write access to persisted instance records
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, ProvisionError>;

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, ProvisionError>;

    /// Record a status transition. Unknown ids are a `NotFound` error.
    async fn update_status(
        &self,
        id: &str,
        status: InstanceStatus,
        error: Option<String>,
    ) -> Result<(), ProvisionError>;
}

/// Process-local instance store
#[derive(Debug, Default)]
pub struct MemoryInstanceStore {
    records: RwLock<HashMap<String, InstanceRecord>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store from a JSON array of records
    pub async fn load_json(path: &Path) -> Result<Self, ProvisionError> {
        Ok(Self::read_records(path).await?)
    }

    async fn read_records(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let records: Vec<InstanceRecord> = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;

        // Resource names derive from the profile slug, so two profiles that
        // slug alike on one backend would share every resource
        let mut owners: HashMap<(TargetKind, String), String> = HashMap::new();
        let store = Self::new();
        for record in records {
            let slug = slugify(&record.profile_name);
            if let Some(owner) = owners.insert((record.target, slug.clone()), record.id.clone()) {
                bail!(
                    "instances {} and {} both map to {} resources named '{}'",
                    owner,
                    record.id,
                    record.target,
                    slug
                );
            }
            store.insert(record);
        }
        Ok(store)
    }

    /// Insert or replace a record
    pub fn insert(&self, record: InstanceRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(record.id.clone(), record);
    }

    pub fn len(&self) -> usize {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, ProvisionError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<InstanceRecord> = records.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, ProvisionError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &str,
        status: InstanceStatus,
        error: Option<String>,
    ) -> Result<(), ProvisionError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = records
            .get_mut(id)
            .ok_or_else(|| ProvisionError::NotFound(format!("instance {}", id)))?;
        record.status = status;
        record.error = error;
        record.updated_at = Utc::now();
        Ok(())
    }
}
