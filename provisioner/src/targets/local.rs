//! Local container target
//!
//! Runs the gateway as a container on the provisioner's own host through the
//! docker CLI. Configuration lives in a per-profile directory mounted into
//! the container.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use secrecy::ExposeSecret;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::errors::ProvisionError;
use crate::settings::LocalSettings;
use crate::targets::command::{run_checked, CommandOutput, CommandRunner, CommandSpec};
use crate::targets::naming::{ResourceNames, MANAGED_BY_TAG, MANAGED_BY_VALUE, PROFILE_TAG};
use crate::targets::serverless::image_reference;
use crate::targets::{
    ConfigurePayload, ConfigureResult, DeploymentTarget, DestroyReport, Endpoint, InstallOptions,
    InstallResult, LogQuery, TargetKind, TargetStatus,
};

const CONFIG_FILE: &str = "gateway.json";
const ENV_FILE: &str = "gateway.env";
const CONTAINER_CONFIG_DIR: &str = "/config";

/// Name the live container is moved to while its replacement is created
const PREVIOUS_SUFFIX: &str = "-previous";

/// Gateway container on the local docker daemon
pub struct LocalTarget {
    names: ResourceNames,
    port: u16,
    settings: LocalSettings,
    runner: Arc<dyn CommandRunner>,
}

impl LocalTarget {
    pub fn new(
        names: ResourceNames,
        port: u16,
        settings: LocalSettings,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            names,
            port,
            settings,
            runner,
        }
    }

    /// Per-profile configuration directory
    pub fn instance_dir(&self) -> PathBuf {
        self.settings.data_dir.join(&self.names.slug)
    }

    fn docker<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.settings.docker_path.as_str()).args(args)
    }

    async fn call(&self, spec: CommandSpec) -> Result<CommandOutput, ProvisionError> {
        run_checked(self.runner.as_ref(), spec).await
    }

    /// Log in to the image's registry when a token is configured. A failed
    /// login falls through to an anonymous pull.
    async fn registry_login(&self, image: &str) {
        let token = match &self.settings.registry_token {
            Some(token) => token,
            None => return,
        };
        let registry = match registry_of(image) {
            Some(registry) => registry,
            None => return,
        };

        debug!("Authenticating with registry {}", registry);
        let spec = self
            .docker([
                "login",
                registry,
                "-u",
                self.settings.registry_user.as_str(),
                "--password-stdin",
            ])
            .stdin(token.expose_secret());
        match self.call(spec).await {
            Ok(_) => debug!("Authenticated with {}", registry),
            Err(e) => debug!("Registry login failed ({}), attempting anonymous pull", e),
        }
    }

    async fn inspect(&self, format: &str) -> Result<String, ProvisionError> {
        let output = self
            .call(self.docker([
                "inspect",
                "--type",
                "container",
                "--format",
                format,
                self.names.local_container.as_str(),
            ]))
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn create_container(&self, image: &str) -> Result<(), ProvisionError> {
        let dir = self.instance_dir();
        let publish = format!("{}:{}:{}", self.settings.bind_host, self.port, self.port);
        let mount = format!("{}:{}", dir.display(), CONTAINER_CONFIG_DIR);
        let env_file = dir.join(ENV_FILE).display().to_string();
        let port_env = format!("GATEWAY_PORT={}", self.port);
        let profile_env = format!("GATEWAY_PROFILE={}", self.names.profile);
        let config_env = format!("GATEWAY_CONFIG_FILE={}/{}", CONTAINER_CONFIG_DIR, CONFIG_FILE);
        let managed = format!("{}={}", MANAGED_BY_TAG, MANAGED_BY_VALUE);
        let profile = format!("{}={}", PROFILE_TAG, self.names.slug);

        self.call(self.docker([
            "create",
            "--name",
            self.names.local_container.as_str(),
            "--restart",
            "unless-stopped",
            "-p",
            publish.as_str(),
            "-v",
            mount.as_str(),
            "--env-file",
            env_file.as_str(),
            "-e",
            port_env.as_str(),
            "-e",
            profile_env.as_str(),
            "-e",
            config_env.as_str(),
            "--label",
            managed.as_str(),
            "--label",
            profile.as_str(),
            image,
        ]))
        .await?;
        Ok(())
    }

    async fn fetch_logs(&self, query: &LogQuery) -> Result<Vec<String>, ProvisionError> {
        let tail = query.lines().to_string();
        let mut args = vec![
            "logs".to_string(),
            "--timestamps".to_string(),
            "--tail".to_string(),
            tail,
        ];
        if let Some(since) = query.since {
            args.push("--since".to_string());
            args.push(format!("{}s", since.as_secs()));
        }
        args.push(self.names.local_container.clone());

        // The daemon relays the container's stderr on stderr
        let output = self.call(self.docker(args)).await?;
        let lines = merge_streams(&output.stdout, &output.stderr)
            .into_iter()
            .filter(|line| match &query.filter {
                Some(filter) => line.contains(filter.as_str()),
                None => true,
            })
            .collect();
        Ok(keep_last(lines, query.lines()))
    }

    /// `docker rm -f`; a missing container is fine
    async fn remove_container(&self, name: &str) -> Result<(), ProvisionError> {
        match self.call(self.docker(["rm", "-f", name])).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Put the renamed container back under its own name and start it
    async fn restore_previous(&self, previous: &str) {
        let name = self.names.local_container.as_str();
        warn!("Restoring {} from {}", name, previous);
        if let Err(e) = self.call(self.docker(["rename", previous, name])).await {
            error!("Unable to restore {} from {}: {}", name, previous, e);
            return;
        }
        if let Err(e) = self.start().await {
            error!("Restored {} but it did not start: {}", name, e);
        }
    }
}

#[async_trait]
impl DeploymentTarget for LocalTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::LocalService
    }

    fn names(&self) -> &ResourceNames {
        &self.names
    }

    async fn install(&self, options: &InstallOptions) -> Result<InstallResult, ProvisionError> {
        self.check_profile(&options.profile_name)?;
        if self.settings.image.is_empty() {
            return Err(ProvisionError::ConfigError("local image is not set".into()));
        }
        let image = image_reference(&self.settings.image, options.version_tag.as_deref());
        info!("Installing {} from {}", self.names.local_container, image);

        let dir = self.instance_dir();
        fs::create_dir_all(&dir).await?;
        let env_path = dir.join(ENV_FILE);
        if fs::metadata(&env_path).await.is_err() {
            write_private(&env_path, b"").await?;
        }

        self.registry_login(&image).await;
        self.call(self.docker(["pull", image.as_str()])).await?;

        match self.create_container(&image).await {
            Ok(()) => info!("Created container {}", self.names.local_container),
            Err(e) if e.is_conflict() => {
                debug!("Container {} already exists", self.names.local_container)
            }
            Err(e) => return Err(e),
        }

        Ok(InstallResult {
            success: true,
            instance_id: self.names.local_container.clone(),
            message: format!("Container {} ready", self.names.local_container),
        })
    }

    async fn configure(
        &self,
        payload: &ConfigurePayload,
    ) -> Result<ConfigureResult, ProvisionError> {
        self.check_profile(&payload.profile_name)?;

        let env = render_env_file(&payload.environment)?;

        let dir = self.instance_dir();
        fs::create_dir_all(&dir).await?;

        let config = serde_json::to_vec_pretty(&payload.config)?;
        write_private(&dir.join(CONFIG_FILE), &config).await?;
        write_private(&dir.join(ENV_FILE), env.as_bytes()).await?;

        Ok(ConfigureResult {
            success: true,
            message: format!("Configuration written to {}", dir.display()),
            requires_restart: true,
        })
    }

    async fn start(&self) -> Result<(), ProvisionError> {
        self.call(self.docker(["start", self.names.local_container.as_str()]))
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProvisionError> {
        self.call(self.docker(["stop", self.names.local_container.as_str()]))
            .await?;
        Ok(())
    }

    /// Recreate the container so a rewritten env file takes effect. The
    /// current container is kept aside until its replacement has started.
    async fn restart(&self) -> Result<(), ProvisionError> {
        let name = self.names.local_container.as_str();
        let previous = format!("{}{}", name, PREVIOUS_SUFFIX);
        let image = self.inspect("{{.Config.Image}}").await?;
        info!("Recreating {} from {}", name, image);

        // Leftover from an interrupted restart
        self.remove_container(&previous).await?;
        self.call(self.docker(["rename", name, previous.as_str()]))
            .await?;

        if let Err(e) = self.create_container(&image).await {
            self.restore_previous(&previous).await;
            return Err(e);
        }

        // Frees the published port for the replacement
        if let Err(e) = self.call(self.docker(["stop", previous.as_str()])).await {
            warn!("Unable to stop {}: {}", previous, e);
        }

        if let Err(e) = self.start().await {
            if let Err(rm) = self.remove_container(name).await {
                error!("Unable to remove failed replacement {}: {}", name, rm);
            } else {
                self.restore_previous(&previous).await;
            }
            return Err(e);
        }

        if let Err(e) = self.remove_container(&previous).await {
            warn!("Unable to remove {}: {}", previous, e);
        }
        Ok(())
    }

    async fn get_status(&self) -> Result<TargetStatus, ProvisionError> {
        let state = match self.inspect("{{.State.Status}}").await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => return Ok(TargetStatus::not_installed()),
            Err(e) => return Err(e),
        };

        Ok(match state.as_str() {
            "running" => TargetStatus::running(self.port),
            "created" | "exited" | "paused" => TargetStatus::stopped(self.port),
            other => TargetStatus::error(self.port, format!("container is {}", other)),
        })
    }

    async fn get_logs(&self, query: &LogQuery) -> Vec<String> {
        match self.fetch_logs(query).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Log retrieval for {} failed: {}", self.names.local_container, e);
                Vec::new()
            }
        }
    }

    async fn get_endpoint(&self) -> Result<Endpoint, ProvisionError> {
        match self.inspect("{{.State.Status}}").await {
            Ok(_) => Ok(Endpoint {
                host: self.settings.bind_host.clone(),
                port: self.port,
                protocol: "http".to_string(),
            }),
            Err(e) if e.is_not_found() => Err(ProvisionError::Endpoint(format!(
                "container {} does not exist",
                self.names.local_container
            ))),
            Err(e) => Err(e),
        }
    }

    async fn destroy(&self) -> DestroyReport {
        let mut report = DestroyReport::default();
        let removed = self.remove_container(&self.names.local_container).await;
        report.record("container", removed);
        report.record("config-dir", remove_dir(&self.instance_dir()).await);
        report
    }
}

/// Registry host of an image reference, if it names one explicitly
fn registry_of(image: &str) -> Option<&str> {
    let (head, _) = image.split_once('/')?;
    if head.contains('.') || head.contains(':') || head == "localhost" {
        Some(head)
    } else {
        None
    }
}

/// Render the env file. Keys must be plain names and values single-line,
/// otherwise one entry could smuggle in further variables.
fn render_env_file(environment: &BTreeMap<String, String>) -> Result<String, ProvisionError> {
    let mut contents = String::new();
    for (key, value) in environment {
        let key_ok = !key.is_empty()
            && !key.starts_with(|c: char| c.is_ascii_digit())
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !key_ok {
            return Err(ProvisionError::ValidationError(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }
        if value.contains(['\n', '\r', '\0']) {
            return Err(ProvisionError::ValidationError(format!(
                "environment variable {} must be a single line",
                key
            )));
        }
        contents.push_str(&format!("{}={}\n", key, value));
    }
    Ok(contents)
}

/// Interleave `docker logs --timestamps` output from both streams in time
/// order and strip the timestamps. Lines without one sort first.
fn merge_streams(stdout: &str, stderr: &str) -> Vec<String> {
    let mut entries: Vec<(Option<DateTime<FixedOffset>>, &str)> = stdout
        .lines()
        .chain(stderr.lines())
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(' ') {
            Some((stamp, rest)) => match DateTime::parse_from_rfc3339(stamp) {
                Ok(at) => (Some(at), rest),
                Err(_) => (None, line),
            },
            None => (None, line),
        })
        .collect();
    entries.sort_by_key(|(at, _)| *at);
    entries.into_iter().map(|(_, line)| line.to_string()).collect()
}

fn keep_last(mut lines: Vec<String>, count: usize) -> Vec<String> {
    if lines.len() > count {
        lines.drain(..lines.len() - count);
    }
    lines
}

/// Write through a temp file, owner read/write only
async fn write_private(path: &Path, contents: &[u8]) -> Result<(), ProvisionError> {
    let temp_path = path.with_extension("tmp");

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    fs::rename(&temp_path, path).await?;
    Ok(())
}

async fn remove_dir(path: &Path) -> Result<(), ProvisionError> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
