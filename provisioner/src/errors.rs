//! Error types for the fleet provisioner

use thiserror::Error;

/// Main error type for the fleet provisioner
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Command `{program}` failed (status {status}): {stderr}")]
    Command {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("Remote API error ({status}): {body}")]
    Remote { status: u16, body: String },

    #[error("Endpoint resolution failed: {0}")]
    Endpoint(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Provider '{provider}' does not implement '{operation}'")]
    NotImplemented { provider: String, operation: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProvisionError {
    /// True when the remote side reported the resource as absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProvisionError::NotFound(_))
    }

    /// True when the remote side rejected a create because the resource exists
    pub fn is_conflict(&self) -> bool {
        matches!(self, ProvisionError::Conflict(_))
    }

    /// Map an HTTP status and body from a typed client onto the error taxonomy
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            404 => ProvisionError::NotFound(body),
            409 => ProvisionError::Conflict(body),
            _ => ProvisionError::Remote { status, body },
        }
    }
}

impl From<anyhow::Error> for ProvisionError {
    fn from(err: anyhow::Error) -> Self {
        // Alternate form keeps the context chain
        ProvisionError::Internal(format!("{:#}", err))
    }
}
