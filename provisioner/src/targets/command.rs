//! External command invocation

use std::process::Stdio;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::ProvisionError;

/// One CLI invocation with its full environment contract
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,

    /// Variables set for this call only
    pub env: Vec<(String, String)>,

    /// Variables stripped from the inherited environment
    pub env_remove: Vec<String>,

    /// Written to the child's stdin, then closed
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program and arguments, for logs. Never includes env or stdin.
    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Decode stdout as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProvisionError> {
        Ok(serde_json::from_str(self.stdout.trim())?)
    }
}

/// Runs external commands. Non-zero exits are returned, not raised.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, ProvisionError>;
}

/// Runs commands as child processes
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, ProvisionError> {
        debug!("Running: {}", spec.display());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &spec.env_remove {
            command.env_remove(key);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| ProvisionError::Command {
            program: spec.program.clone(),
            status: -1,
            stderr: format!("failed to spawn: {}", e),
        })?;

        if let Some(input) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
            }
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

const NOT_FOUND_MARKERS: &[&str] = &[
    "NotFoundException",
    "ResourceNotFound",
    "ServiceNotActiveException",
    "InvalidNetworkInterfaceID.NotFound",
    "No such object",
    "No such container",
    "does not exist",
];

const CONFLICT_MARKERS: &[&str] = &[
    "ResourceAlreadyExistsException",
    "ResourceExistsException",
    "already exists",
    "already in use",
    "not idempotent",
];

/// Classify a failed command by the error codes in its stderr
pub fn classify_failure(spec: &CommandSpec, output: &CommandOutput) -> ProvisionError {
    let stderr = output.stderr.trim().to_string();
    if NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m)) {
        ProvisionError::NotFound(stderr)
    } else if CONFLICT_MARKERS.iter().any(|m| stderr.contains(m)) {
        ProvisionError::Conflict(stderr)
    } else {
        ProvisionError::Command {
            program: spec.display(),
            status: output.status,
            stderr,
        }
    }
}

/// Run and turn a non-zero exit into a classified error
pub async fn run_checked(
    runner: &dyn CommandRunner,
    spec: CommandSpec,
) -> Result<CommandOutput, ProvisionError> {
    let output = runner.run(spec.clone()).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(classify_failure(&spec, &output))
    }
}
