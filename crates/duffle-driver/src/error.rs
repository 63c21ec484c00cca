//! Error types for duffle-driver

use thiserror::Error;

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors that can occur while running an invocation image
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DriverError {
    /// No built-in driver and no `duffle-<name>` plugin on PATH
    #[error("unsupported driver or driver not found in PATH: {name}")]
    NotFound { name: String },

    /// The driver cannot run this kind of image
    #[error("driver for {driver} does not handle type {image_type:?}")]
    UnsupportedImageType { driver: String, image_type: String },

    /// Invalid driver configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation carries something this driver cannot deliver
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Plugin process exited unsuccessfully
    #[error("{program} failed ({status}): {output}")]
    CommandFailed {
        program: String,
        status: String,
        output: String,
    },

    /// Container exited with a non-zero status
    #[error("container exited with status {code}")]
    ContainerFailed { code: i64 },

    /// Kubernetes pod or job failed
    #[error("{kind} {name} failed: {reason}")]
    RunFailed {
        kind: &'static str,
        name: String,
        reason: String,
    },

    /// Kubernetes pod or job vanished before finishing
    #[error("{kind} {name} was deleted unexpectedly")]
    Deleted { kind: &'static str, name: String },

    /// Waited too long for a terminal state
    #[error("timeout waiting for {what} after {after:?}")]
    Timeout {
        what: String,
        after: std::time::Duration,
    },

    /// Watching a pod or job broke off
    #[error("watch failed: {0}")]
    Watch(String),

    /// Azure Resource Manager or login failure
    #[error("Azure error: {0}")]
    Azure(String),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Docker daemon error
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for DriverError {
    fn from(e: serde_json::Error) -> Self {
        DriverError::Serialization(e.to_string())
    }
}

impl DriverError {
    pub(crate) fn unsupported_image(driver: &str, image_type: &str) -> Self {
        DriverError::UnsupportedImageType {
            driver: driver.to_string(),
            image_type: image_type.to_string(),
        }
    }
}
