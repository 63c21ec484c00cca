//! Claim storage backends
//!
//! Duffle keeps one claim per installation name. Backends:
//! - **File** (default): one `<name>.json` file per claim in a local directory
//! - **ConfigMap**: one ConfigMap per claim in a Kubernetes namespace
//! - **MongoDB**: one document per claim in a collection
//! - **Memory**: in-process map, for tests
//!
//! All backends persist the claim as JSON and overwrite blindly on `store`.
//! No locking is performed; callers must serialize actions per installation.

mod configmap;
mod error;
mod file;
mod memory;
mod mongo;

pub use configmap::ConfigMapStore;
pub use error::{Result, StoreError};
pub use file::FileStore;
pub use memory::{MemoryClaimStore, OperationCounts};
pub use mongo::MongoStore;

use async_trait::async_trait;
use duffle_core::Claim;

/// Persistent key-value store holding one claim per installation name
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Names of all stored claims
    async fn list(&self) -> Result<Vec<String>>;

    /// Insert or fully overwrite the claim stored under `claim.name`
    async fn store(&self, claim: &Claim) -> Result<()>;

    /// Read a claim, failing with `ClaimNotFound` if absent
    async fn read(&self, name: &str) -> Result<Claim>;

    /// Delete a claim, failing with `ClaimNotFound` if absent
    async fn delete(&self, name: &str) -> Result<()>;

    /// Check if a claim exists
    async fn exists(&self, name: &str) -> Result<bool> {
        match self.read(name).await {
            Ok(_) => Ok(true),
            Err(StoreError::ClaimNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Serialize a claim for storage
pub(crate) fn encode_claim(claim: &Claim) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(claim)?)
}

/// Deserialize a stored claim
pub(crate) fn decode_claim(data: &[u8]) -> Result<Claim> {
    Ok(serde_json::from_slice(data)?)
}
