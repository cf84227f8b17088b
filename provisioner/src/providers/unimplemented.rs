//! Placeholder for providers that are registered but not built yet.
//! Validation reports the gap; every mutating call fails with `NotImplemented`.

use async_trait::async_trait;
use secrecy::SecretString;

use crate::errors::ProvisionError;
use crate::providers::{
    BootstrapOptions, CloudProvider, CloudResources, ContainerFilters, ContainerInstance,
    ContainerSpec, ProviderConfig, ProviderKind, ValidationResult,
};
use crate::targets::LogQuery;

pub struct UnimplementedProvider {
    kind: ProviderKind,
}

impl UnimplementedProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self { kind }
    }

    fn not_implemented<T>(&self, operation: &str) -> Result<T, ProvisionError> {
        Err(ProvisionError::NotImplemented {
            provider: self.kind.to_string(),
            operation: operation.to_string(),
        })
    }
}

#[async_trait]
impl CloudProvider for UnimplementedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn initialize(&mut self, _config: ProviderConfig) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn validate(&self) -> ValidationResult {
        ValidationResult::from_findings(
            vec![format!("provider '{}' is not implemented", self.kind)],
            Vec::new(),
        )
    }

    async fn bootstrap(&self, _options: &BootstrapOptions) -> Result<CloudResources, ProvisionError> {
        self.not_implemented("bootstrap")
    }

    async fn deploy_container(
        &self,
        _spec: &ContainerSpec,
    ) -> Result<ContainerInstance, ProvisionError> {
        self.not_implemented("deploy_container")
    }

    async fn update_container(
        &self,
        _id: &str,
        _spec: &ContainerSpec,
    ) -> Result<ContainerInstance, ProvisionError> {
        self.not_implemented("update_container")
    }

    async fn stop_container(&self, _id: &str) -> Result<(), ProvisionError> {
        self.not_implemented("stop_container")
    }

    async fn start_container(&self, _id: &str) -> Result<(), ProvisionError> {
        self.not_implemented("start_container")
    }

    async fn delete_container(&self, _id: &str) -> Result<(), ProvisionError> {
        self.not_implemented("delete_container")
    }

    async fn get_container(&self, _id: &str) -> Result<ContainerInstance, ProvisionError> {
        self.not_implemented("get_container")
    }

    async fn list_containers(
        &self,
        _filters: Option<&ContainerFilters>,
    ) -> Result<Vec<ContainerInstance>, ProvisionError> {
        self.not_implemented("list_containers")
    }

    async fn get_logs(&self, _id: &str, _query: &LogQuery) -> Result<Vec<String>, ProvisionError> {
        self.not_implemented("get_logs")
    }

    async fn store_secret(
        &self,
        _name: &str,
        _value: &SecretString,
    ) -> Result<String, ProvisionError> {
        self.not_implemented("store_secret")
    }

    async fn get_secret(&self, _name: &str) -> Result<Option<SecretString>, ProvisionError> {
        self.not_implemented("get_secret")
    }

    async fn delete_secret(&self, _name: &str) -> Result<(), ProvisionError> {
        self.not_implemented("delete_secret")
    }

    fn console_url(&self, _id: Option<&str>) -> String {
        String::new()
    }
}
