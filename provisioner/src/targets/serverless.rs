//! Serverless-container target
//!
//! Drives a managed serverless container platform (cluster, task-definition
//! revisions, services) entirely through its CLI. Credentials and region are
//! passed on every call; ambient profiles are stripped from the environment.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::errors::ProvisionError;
use crate::settings::ServerlessSettings;
use crate::targets::command::{run_checked, CommandOutput, CommandRunner, CommandSpec};
use crate::targets::naming::{ResourceNames, MANAGED_BY_TAG, MANAGED_BY_VALUE, PROFILE_TAG};
use crate::targets::{
    ConfigurePayload, ConfigureResult, DeploymentTarget, DestroyReport, Endpoint, InstallOptions,
    InstallResult, LogQuery, TargetKind, TargetStatus,
};

/// Environment variable carrying the gateway configuration secret
pub const CONFIG_SECRET_ENV: &str = "GATEWAY_CONFIG";

const AMBIENT_CREDENTIAL_VARS: &[&str] = &[
    "AWS_PROFILE",
    "AWS_DEFAULT_PROFILE",
    "AWS_SHARED_CREDENTIALS_FILE",
    "AWS_CONFIG_FILE",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
];

const DEFAULT_LOG_WINDOW: Duration = Duration::from_secs(60 * 60);

// ============================== CLI OUTPUT SHAPES ================================ //

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Failure {
    arn: Option<String>,
    reason: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DescribeClustersOutput {
    clusters: Vec<ClusterInfo>,
    failures: Vec<Failure>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ClusterInfo {
    cluster_name: String,
    status: String,
}

#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
#[serde(default)]
struct NameValue {
    name: String,
    value: String,
}

#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase", default)]
struct SecretReference {
    name: String,
    value_from: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ContainerDefinitionInfo {
    name: String,
    environment: Vec<NameValue>,
    secrets: Vec<SecretReference>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TaskDefinitionInfo {
    task_definition_arn: String,
    revision: u32,
    container_definitions: Vec<ContainerDefinitionInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TaskDefinitionOutput {
    task_definition: TaskDefinitionInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ListTaskDefinitionsOutput {
    task_definition_arns: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DescribeServicesOutput {
    services: Vec<ServiceInfo>,
    failures: Vec<Failure>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ServiceInfo {
    service_name: String,
    status: String,
    desired_count: i64,
    running_count: i64,
    pending_count: i64,
    task_definition: String,
    events: Vec<ServiceEvent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceEvent {
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ListTasksOutput {
    task_arns: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DescribeTasksOutput {
    tasks: Vec<TaskInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TaskInfo {
    task_arn: String,
    attachments: Vec<Attachment>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Attachment {
    #[serde(rename = "type")]
    kind: String,
    details: Vec<NameValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct DescribeNetworkInterfacesOutput {
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct NetworkInterface {
    association: Option<NetworkAssociation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct NetworkAssociation {
    public_ip: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SecretOutput {
    #[serde(rename = "ARN")]
    arn: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FilterLogEventsOutput {
    events: Vec<LogEvent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogEvent {
    message: String,
}

// ================================== TARGET ====================================== //

/// Serverless-container deployment target
pub struct ServerlessTarget {
    names: ResourceNames,
    port: u16,
    settings: ServerlessSettings,
    runner: Arc<dyn CommandRunner>,
}

impl ServerlessTarget {
    pub fn new(
        names: ResourceNames,
        port: u16,
        settings: ServerlessSettings,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            names,
            port,
            settings,
            runner,
        }
    }

    /// Build one CLI call with explicit credentials and region
    fn cli<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = CommandSpec::new(self.settings.cli_path.as_str()).args(args);
        spec = spec.args(["--region", self.settings.region.as_str(), "--output", "json"]);

        for var in AMBIENT_CREDENTIAL_VARS {
            spec = spec.env_remove(*var);
        }
        spec = spec
            .env("AWS_PAGER", "")
            .env("AWS_REGION", self.settings.region.as_str())
            .env("AWS_ACCESS_KEY_ID", self.settings.access_key_id.as_str());
        if let Some(secret) = &self.settings.secret_access_key {
            spec = spec.env("AWS_SECRET_ACCESS_KEY", secret.expose_secret());
        }
        if let Some(token) = &self.settings.session_token {
            spec = spec.env("AWS_SESSION_TOKEN", token.expose_secret());
        }
        spec
    }

    async fn call(&self, spec: CommandSpec) -> Result<CommandOutput, ProvisionError> {
        run_checked(self.runner.as_ref(), spec).await
    }

    async fn call_json<T: DeserializeOwned>(&self, spec: CommandSpec) -> Result<T, ProvisionError> {
        self.call(spec).await?.json()
    }

    fn check_inputs(&self) -> Result<(), ProvisionError> {
        if self.settings.region.is_empty() {
            return Err(ProvisionError::ConfigError("serverless region is not set".into()));
        }
        if self.settings.image.is_empty() {
            return Err(ProvisionError::ConfigError("serverless image is not set".into()));
        }
        if self.settings.subnets.is_empty() {
            return Err(ProvisionError::ConfigError(
                "serverless network placement needs at least one subnet".into(),
            ));
        }
        Ok(())
    }

    // ----------------------------- cluster / log sink ----------------------------- //

    async fn ensure_cluster(&self) -> Result<(), ProvisionError> {
        let cluster = &self.settings.cluster;
        let described: DescribeClustersOutput = self
            .call_json(self.cli(["ecs", "describe-clusters", "--clusters", cluster.as_str()]))
            .await?;

        if described
            .clusters
            .iter()
            .any(|c| c.cluster_name == *cluster && c.status == "ACTIVE")
        {
            debug!("Cluster {} already active", cluster);
            return Ok(());
        }
        for failure in &described.failures {
            debug!("Cluster lookup failure {:?}: {}", failure.arn, failure.reason);
        }

        info!("Creating cluster {}", cluster);
        match self
            .call(self.cli(["ecs", "create-cluster", "--cluster-name", cluster.as_str()]))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ensure_log_group(&self) -> Result<(), ProvisionError> {
        let tags = format!("{}={},{}={}", MANAGED_BY_TAG, MANAGED_BY_VALUE, PROFILE_TAG, self.names.slug);
        match self
            .call(self.cli([
                "logs",
                "create-log-group",
                "--log-group-name",
                self.names.log_group.as_str(),
                "--tags",
                tags.as_str(),
            ]))
            .await
        {
            Ok(_) => {
                info!("Created log group {}", self.names.log_group);
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!("Log group {} already exists", self.names.log_group);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------ task definitions ------------------------------ //

    /// Environment and secret references of the latest revision, if any
    async fn latest_container_settings(
        &self,
    ) -> Result<Option<(Vec<NameValue>, Vec<SecretReference>)>, ProvisionError> {
        let result: Result<TaskDefinitionOutput, _> = self
            .call_json(self.cli([
                "ecs",
                "describe-task-definition",
                "--task-definition",
                self.names.task_family.as_str(),
            ]))
            .await;

        match result {
            Ok(output) => Ok(output
                .task_definition
                .container_definitions
                .into_iter()
                .find(|c| c.name == self.names.container)
                .map(|c| (c.environment, c.secrets))),
            // A never-registered family is reported as a client exception
            Err(e) if e.is_not_found() || is_unknown_task_definition(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn task_definition_document(
        &self,
        image: &str,
        environment: &[NameValue],
        secrets: &[SecretReference],
    ) -> serde_json::Value {
        let mut document = json!({
            "family": self.names.task_family,
            "networkMode": "awsvpc",
            "requiresCompatibilities": ["FARGATE"],
            "cpu": self.settings.cpu,
            "memory": self.settings.memory,
            "containerDefinitions": [{
                "name": self.names.container,
                "image": image,
                "essential": true,
                "portMappings": [{ "containerPort": self.port, "protocol": "tcp" }],
                "environment": environment,
                "secrets": secrets,
                "logConfiguration": {
                    "logDriver": "awslogs",
                    "options": {
                        "awslogs-group": self.names.log_group,
                        "awslogs-region": self.settings.region,
                        "awslogs-stream-prefix": "gateway"
                    }
                }
            }],
            "tags": [
                { "key": MANAGED_BY_TAG, "value": MANAGED_BY_VALUE },
                { "key": PROFILE_TAG, "value": self.names.slug }
            ]
        });
        if let Some(role) = &self.settings.execution_role_arn {
            document["executionRoleArn"] = json!(role);
        }
        if let Some(role) = &self.settings.task_role_arn {
            document["taskRoleArn"] = json!(role);
        }
        document
    }

    /// Register a new immutable revision; returns its ARN
    async fn register_task_definition(
        &self,
        image: &str,
        environment: &[NameValue],
        secrets: &[SecretReference],
    ) -> Result<String, ProvisionError> {
        let document = self.task_definition_document(image, environment, secrets);
        let output: TaskDefinitionOutput = self
            .call_json(self.cli([
                "ecs".to_string(),
                "register-task-definition".to_string(),
                "--cli-input-json".to_string(),
                document.to_string(),
            ]))
            .await?;

        info!(
            "Registered task definition {} revision {}",
            self.names.task_family, output.task_definition.revision
        );
        Ok(output.task_definition.task_definition_arn)
    }

    fn base_environment(&self) -> Vec<NameValue> {
        vec![
            NameValue {
                name: "GATEWAY_PORT".to_string(),
                value: self.port.to_string(),
            },
            NameValue {
                name: "GATEWAY_PROFILE".to_string(),
                value: self.names.profile.clone(),
            },
        ]
    }

    // ---------------------------------- service ----------------------------------- //

    fn network_configuration(&self) -> String {
        let mut awsvpc = json!({
            "subnets": self.settings.subnets,
            "assignPublicIp": if self.settings.assign_public_ip { "ENABLED" } else { "DISABLED" },
        });
        if let Some(group) = &self.settings.security_group {
            awsvpc["securityGroups"] = json!([group]);
        }
        json!({ "awsvpcConfiguration": awsvpc }).to_string()
    }

    /// Create the service bound to `task_definition_arn`; rebind it if it exists
    async fn upsert_service(&self, task_definition_arn: &str) -> Result<(), ProvisionError> {
        let network = self.network_configuration();
        let managed_tag = format!("key={},value={}", MANAGED_BY_TAG, MANAGED_BY_VALUE);
        let profile_tag = format!("key={},value={}", PROFILE_TAG, self.names.slug);
        let created = self
            .call(self.cli([
                "ecs",
                "create-service",
                "--cluster",
                self.settings.cluster.as_str(),
                "--service-name",
                self.names.service.as_str(),
                "--task-definition",
                task_definition_arn,
                "--desired-count",
                "0",
                "--launch-type",
                "FARGATE",
                "--network-configuration",
                network.as_str(),
                "--tags",
                managed_tag.as_str(),
                profile_tag.as_str(),
            ]))
            .await;

        match created {
            Ok(_) => {
                info!("Created service {}", self.names.service);
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!("Service {} exists, rebinding task definition", self.names.service);
                self.call(self.cli([
                    "ecs",
                    "update-service",
                    "--cluster",
                    self.settings.cluster.as_str(),
                    "--service",
                    self.names.service.as_str(),
                    "--task-definition",
                    task_definition_arn,
                    "--network-configuration",
                    network.as_str(),
                ]))
                .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_desired_count(&self, count: u32) -> Result<(), ProvisionError> {
        let count = count.to_string();
        self.call(self.cli([
            "ecs",
            "update-service",
            "--cluster",
            self.settings.cluster.as_str(),
            "--service",
            self.names.service.as_str(),
            "--desired-count",
            count.as_str(),
        ]))
        .await?;
        Ok(())
    }

    async fn describe_service(&self) -> Result<Option<ServiceInfo>, ProvisionError> {
        let output: DescribeServicesOutput = self
            .call_json(self.cli([
                "ecs",
                "describe-services",
                "--cluster",
                self.settings.cluster.as_str(),
                "--services",
                self.names.service.as_str(),
            ]))
            .await?;

        if let Some(failure) = output.failures.first() {
            debug!("Service lookup failure: {}", failure.reason);
        }
        Ok(output
            .services
            .into_iter()
            .find(|s| s.service_name == self.names.service && s.status != "INACTIVE"))
    }

    // ---------------------------------- secrets ----------------------------------- //

    /// Create the config secret; on conflict write a new version. Returns the ARN.
    async fn upsert_secret(&self, value: &str) -> Result<String, ProvisionError> {
        let tags = format!("Key={},Value={}", MANAGED_BY_TAG, MANAGED_BY_VALUE);
        let created: Result<SecretOutput, _> = self
            .call_json(
                self.cli([
                    "secretsmanager",
                    "create-secret",
                    "--name",
                    self.names.secret.as_str(),
                    "--secret-string",
                    "file:///dev/stdin",
                    "--tags",
                    tags.as_str(),
                ])
                .stdin(value),
            )
            .await;

        match created {
            Ok(output) => Ok(output.arn),
            Err(e) if e.is_conflict() => {
                debug!("Secret {} exists, writing new version", self.names.secret);
                let output: SecretOutput = self
                    .call_json(
                        self.cli([
                            "secretsmanager",
                            "put-secret-value",
                            "--secret-id",
                            self.names.secret.as_str(),
                            "--secret-string",
                            "file:///dev/stdin",
                        ])
                        .stdin(value),
                    )
                    .await?;
                Ok(output.arn)
            }
            Err(e) => Err(e),
        }
    }

    // --------------------------------- teardown ----------------------------------- //

    async fn delete_service(&self) -> Result<(), ProvisionError> {
        if let Err(e) = self.set_desired_count(0).await {
            if !e.is_not_found() {
                warn!("Failed to drain service {}: {}", self.names.service, e);
            }
        }
        self.call(self.cli([
            "ecs",
            "delete-service",
            "--cluster",
            self.settings.cluster.as_str(),
            "--service",
            self.names.service.as_str(),
            "--force",
        ]))
        .await?;
        Ok(())
    }

    async fn deregister_task_definitions(&self) -> Result<(), ProvisionError> {
        let listed: ListTaskDefinitionsOutput = self
            .call_json(self.cli([
                "ecs",
                "list-task-definitions",
                "--family-prefix",
                self.names.task_family.as_str(),
                "--status",
                "ACTIVE",
            ]))
            .await?;

        let mut first_error = None;
        for arn in listed
            .task_definition_arns
            .iter()
            .filter(|arn| task_family_of(arn) == Some(self.names.task_family.as_str()))
        {
            debug!("Deregistering {}", arn);
            let result = self
                .call(self.cli(["ecs", "deregister-task-definition", "--task-definition", arn.as_str()]))
                .await;
            if let Err(e) = result {
                warn!("Failed to deregister {}: {}", arn, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn delete_secret(&self) -> Result<(), ProvisionError> {
        self.call(self.cli([
            "secretsmanager",
            "delete-secret",
            "--secret-id",
            self.names.secret.as_str(),
            "--force-delete-without-recovery",
        ]))
        .await?;
        Ok(())
    }

    async fn delete_log_group(&self) -> Result<(), ProvisionError> {
        self.call(self.cli([
            "logs",
            "delete-log-group",
            "--log-group-name",
            self.names.log_group.as_str(),
        ]))
        .await?;
        Ok(())
    }

    async fn fetch_logs(&self, query: &LogQuery) -> Result<Vec<String>, ProvisionError> {
        let since = query.since.unwrap_or(DEFAULT_LOG_WINDOW);
        let mut args = vec![
            "logs".to_string(),
            "filter-log-events".to_string(),
            "--log-group-name".to_string(),
            self.names.log_group.clone(),
            "--start-time".to_string(),
            epoch_millis_ago(since).to_string(),
        ];
        if let Some(filter) = &query.filter {
            args.push("--filter-pattern".to_string());
            args.push(filter.clone());
        }

        let output: FilterLogEventsOutput = self.call_json(self.cli(args)).await?;
        let lines: Vec<String> = output
            .events
            .into_iter()
            .map(|e| e.message.trim_end().to_string())
            .collect();
        let skip = lines.len().saturating_sub(query.lines());
        Ok(lines.into_iter().skip(skip).collect())
    }
}

#[async_trait]
impl DeploymentTarget for ServerlessTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::ServerlessContainer
    }

    fn names(&self) -> &ResourceNames {
        &self.names
    }

    async fn install(&self, options: &InstallOptions) -> Result<InstallResult, ProvisionError> {
        self.check_profile(&options.profile_name)?;
        self.check_inputs()?;
        info!("Installing {} on cluster {}", self.names.service, self.settings.cluster);

        self.ensure_cluster().await?;
        self.ensure_log_group().await?;

        // Carry configuration from the previous revision so a repeated install
        // does not drop what `configure` wrote.
        let (environment, secrets) = match self.latest_container_settings().await? {
            Some(previous) => previous,
            None => (self.base_environment(), Vec::new()),
        };
        let image = image_reference(&self.settings.image, options.version_tag.as_deref());
        let arn = self.register_task_definition(&image, &environment, &secrets).await?;
        self.upsert_service(&arn).await?;

        Ok(InstallResult {
            success: true,
            instance_id: self.names.service.clone(),
            message: format!("Service {} bound to {}", self.names.service, arn),
        })
    }

    async fn configure(
        &self,
        payload: &ConfigurePayload,
    ) -> Result<ConfigureResult, ProvisionError> {
        self.check_profile(&payload.profile_name)?;

        let secret_arn = self.upsert_secret(&payload.config.to_string()).await?;

        let mut environment: BTreeMap<String, String> = self
            .base_environment()
            .into_iter()
            .map(|nv| (nv.name, nv.value))
            .collect();
        environment.insert("GATEWAY_PORT".to_string(), payload.gateway_port.to_string());
        environment.extend(payload.environment.clone());
        let environment: Vec<NameValue> = environment
            .into_iter()
            .map(|(name, value)| NameValue { name, value })
            .collect();
        let secrets = vec![SecretReference {
            name: CONFIG_SECRET_ENV.to_string(),
            value_from: secret_arn,
        }];

        let image = match self.describe_service().await? {
            Some(service) => self.image_of(&service.task_definition).await?,
            None => self.settings.image.clone(),
        };
        let arn = self.register_task_definition(&image, &environment, &secrets).await?;

        Ok(ConfigureResult {
            success: true,
            message: format!("Configuration stored; revision {} registered", arn),
            requires_restart: true,
        })
    }

    /// Scale to one task on the family's latest revision, so configuration
    /// registered since install is what starts
    async fn start(&self) -> Result<(), ProvisionError> {
        info!("Starting service {}", self.names.service);
        self.call(self.cli([
            "ecs",
            "update-service",
            "--cluster",
            self.settings.cluster.as_str(),
            "--service",
            self.names.service.as_str(),
            "--task-definition",
            self.names.task_family.as_str(),
            "--desired-count",
            "1",
        ]))
        .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProvisionError> {
        info!("Stopping service {}", self.names.service);
        self.set_desired_count(0).await
    }

    async fn restart(&self) -> Result<(), ProvisionError> {
        info!("Forcing new deployment of {}", self.names.service);
        self.call(self.cli([
            "ecs",
            "update-service",
            "--cluster",
            self.settings.cluster.as_str(),
            "--service",
            self.names.service.as_str(),
            "--task-definition",
            self.names.task_family.as_str(),
            "--force-new-deployment",
        ]))
        .await?;
        Ok(())
    }

    async fn get_status(&self) -> Result<TargetStatus, ProvisionError> {
        let service = match self.describe_service().await {
            Ok(Some(service)) => service,
            Ok(None) => return Ok(TargetStatus::not_installed()),
            Err(e) if e.is_not_found() => return Ok(TargetStatus::not_installed()),
            Err(e) => return Err(e),
        };
        Ok(service_status(&service, self.port))
    }

    async fn get_logs(&self, query: &LogQuery) -> Vec<String> {
        match self.fetch_logs(query).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Log retrieval for {} failed: {}", self.names.service, e);
                Vec::new()
            }
        }
    }

    async fn get_endpoint(&self) -> Result<Endpoint, ProvisionError> {
        let tasks: ListTasksOutput = self
            .call_json(self.cli([
                "ecs",
                "list-tasks",
                "--cluster",
                self.settings.cluster.as_str(),
                "--service-name",
                self.names.service.as_str(),
                "--desired-status",
                "RUNNING",
            ]))
            .await?;
        let task_arn = tasks.task_arns.first().ok_or_else(|| {
            ProvisionError::Endpoint(format!("no running tasks for {}", self.names.service))
        })?;

        let described: DescribeTasksOutput = self
            .call_json(self.cli([
                "ecs",
                "describe-tasks",
                "--cluster",
                self.settings.cluster.as_str(),
                "--tasks",
                task_arn.as_str(),
            ]))
            .await?;
        let task = described
            .tasks
            .first()
            .ok_or_else(|| ProvisionError::Endpoint(format!("task {} not described", task_arn)))?;
        let eni = network_interface_of(task).ok_or_else(|| {
            ProvisionError::Endpoint(format!("task {} has no network interface", task.task_arn))
        })?;

        let interfaces: DescribeNetworkInterfacesOutput = self
            .call_json(self.cli([
                "ec2",
                "describe-network-interfaces",
                "--network-interface-ids",
                eni.as_str(),
            ]))
            .await?;
        let public_ip = interfaces
            .network_interfaces
            .into_iter()
            .next()
            .and_then(|ni| ni.association)
            .and_then(|a| a.public_ip)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                ProvisionError::Endpoint(format!("network interface {} has no public IP", eni))
            })?;

        Ok(Endpoint {
            host: public_ip,
            port: self.port,
            protocol: "http".to_string(),
        })
    }

    async fn destroy(&self) -> DestroyReport {
        info!("Destroying {}", self.names.service);
        let mut report = DestroyReport::default();
        report.record("service", self.delete_service().await);
        report.record("task-definitions", self.deregister_task_definitions().await);
        report.record("secret", self.delete_secret().await);
        report.record("log-group", self.delete_log_group().await);
        report
    }
}

impl ServerlessTarget {
    /// Image of the container in a registered revision
    async fn image_of(&self, task_definition: &str) -> Result<String, ProvisionError> {
        #[derive(Deserialize, Default)]
        #[serde(rename_all = "camelCase", default)]
        struct ImageOnly {
            task_definition: ImageDefinition,
        }
        #[derive(Deserialize, Default)]
        #[serde(rename_all = "camelCase", default)]
        struct ImageDefinition {
            container_definitions: Vec<ImageContainer>,
        }
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct ImageContainer {
            name: String,
            image: String,
        }

        let output: ImageOnly = self
            .call_json(self.cli(["ecs", "describe-task-definition", "--task-definition", task_definition]))
            .await?;
        Ok(output
            .task_definition
            .container_definitions
            .into_iter()
            .find(|c| c.name == self.names.container)
            .map(|c| c.image)
            .unwrap_or_else(|| self.settings.image.clone()))
    }
}

/// Map service counters to a target status.
///
/// Nonzero desired with zero running is reported as an error rather than as
/// starting; callers poll and a persistent zero indicates a crash loop.
fn service_status(service: &ServiceInfo, port: u16) -> TargetStatus {
    if service.running_count > 0 {
        TargetStatus::running(port)
    } else if service.desired_count == 0 {
        TargetStatus::stopped(port)
    } else {
        let detail = service
            .events
            .first()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "no recent service events".to_string());
        TargetStatus::error(
            port,
            format!(
                "desired {} task(s) but none running ({} pending): {}",
                service.desired_count, service.pending_count, detail
            ),
        )
    }
}

fn network_interface_of(task: &TaskInfo) -> Option<String> {
    task.attachments
        .iter()
        .filter(|a| a.kind == "ElasticNetworkInterface")
        .flat_map(|a| a.details.iter())
        .find(|d| d.name == "networkInterfaceId" && !d.value.is_empty())
        .map(|d| d.value.clone())
}

/// `arn:...:task-definition/<family>:<revision>` → `<family>`
fn task_family_of(arn: &str) -> Option<&str> {
    let tail = arn.rsplit('/').next()?;
    tail.rsplit_once(':').map(|(family, _)| family)
}

fn is_unknown_task_definition(e: &ProvisionError) -> bool {
    matches!(e, ProvisionError::Command { stderr, .. } if stderr.contains("Unable to describe task definition"))
}

/// Milliseconds since the Unix epoch at `since` before now
fn epoch_millis_ago(since: Duration) -> i64 {
    let delta = chrono::Duration::from_std(since).unwrap_or_else(|_| chrono::Duration::zero());
    (chrono::Utc::now() - delta).timestamp_millis()
}

/// Apply `tag` to `image`, replacing any tag it already carries. Digest
/// references are pinned and returned unchanged.
pub fn image_reference(image: &str, tag: Option<&str>) -> String {
    let tag = match tag.filter(|t| !t.is_empty()) {
        Some(tag) if !image.contains('@') => tag,
        _ => return image.to_string(),
    };
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    let repository = match image[name_start..].find(':') {
        Some(i) => &image[..name_start + i],
        None => image,
    };
    format!("{}:{}", repository, tag)
}
