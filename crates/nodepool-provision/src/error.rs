//! Provisioning error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while creating or destroying nodes.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The backend refused to create instances because a quota is used up.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("{fqdn} never became ready: {reason}")]
    Readiness { fqdn: String, reason: String },

    #[error("failed to create volume {0}")]
    VolumeCreate(String),

    #[error("volume {id} did not reach status {status}")]
    VolumeTimeout { id: String, status: String },

    #[error("timed out after {0:?} waiting for the server create lock")]
    CreateLockTimeout(Duration),

    #[error("expected {expected} instances tagged {tag}, found {found}")]
    BatchMismatch {
        tag: String,
        expected: u32,
        found: usize,
    },

    #[error("`{command}` failed: {message}")]
    Backend { command: String, message: String },

    #[error("unexpected output from `{command}`: {message}")]
    BackendOutput { command: String, message: String },

    #[error("no image named {0}")]
    ImageNotFound(String),

    #[error("no flavor satisfies {0}")]
    FlavorNotFound(String),

    #[error("no address found for instance {0}")]
    NoAddress(String),

    #[error("invalid IPv4 address: {0}")]
    InvalidIp(String),

    #[error("user-data template {}: {message}", path.display())]
    Template { path: PathBuf, message: String },

    #[error("unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("unsupported driver: {0}")]
    UnsupportedDriver(String),

    #[error("config error: {0}")]
    Config(#[from] nodepool_core::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    pub fn backend(command: impl Into<String>, message: impl Into<String>) -> Self {
        ProvisionError::Backend {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// Does backend error text report quota exhaustion?
pub fn is_quota_error(message: &str) -> bool {
    message.to_lowercase().contains("quota exceeded")
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
