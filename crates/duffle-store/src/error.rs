//! Error types for duffle-store

use thiserror::Error;

/// Result type for claim storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while persisting claims
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No claim is stored under this name
    #[error("claim '{name}' not found")]
    ClaimNotFound { name: String },

    /// Name cannot be used as a storage key
    #[error("invalid claim name {name:?}")]
    InvalidName { name: String },

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Document database error
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// Stored payload could not be read back
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid backend configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl StoreError {
    /// Check if this is the distinguished "no such installation" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::ClaimNotFound { .. })
    }

    pub(crate) fn not_found(name: &str) -> Self {
        StoreError::ClaimNotFound {
            name: name.to_string(),
        }
    }
}
