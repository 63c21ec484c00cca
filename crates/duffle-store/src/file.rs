//! File-based claim store
//!
//! Stores each claim as `<name>.<ext>` in a base directory. The directory is
//! created on the first write, so pointing the store at a fresh home is cheap.

use async_trait::async_trait;
use duffle_core::Claim;
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::{ClaimStore, decode_claim, encode_claim};

const DEFAULT_EXTENSION: &str = "json";

/// File-based claim store
pub struct FileStore {
    base_dir: PathBuf,
    extension: String,
}

impl FileStore {
    /// Create a store rooted at `base_dir`, using the `json` extension
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_extension(base_dir, DEFAULT_EXTENSION)
    }

    /// Create a store with a custom file extension
    pub fn with_extension(base_dir: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            base_dir: base_dir.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the claim file; names that could escape `base_dir` are refused
    fn claim_path(&self, name: &str) -> Result<PathBuf> {
        duffle_core::validate_name(name).map_err(|_| StoreError::InvalidName {
            name: name.to_string(),
        })?;
        Ok(self.base_dir.join(format!("{}.{}", name, self.extension)))
    }
}

#[async_trait]
impl ClaimStore for FileStore {
    async fn list(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == self.extension.as_str()).unwrap_or(false)
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn store(&self, claim: &Claim) -> Result<()> {
        let path = self.claim_path(&claim.name)?;
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let data = encode_claim(claim)?;
        tokio::fs::write(path, data).await?;
        tracing::debug!(claim = %claim.name, revision = %claim.revision, "stored claim");
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Claim> {
        match tokio::fs::read(self.claim_path(name)?).await {
            Ok(data) => decode_claim(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::not_found(name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.claim_path(name)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::not_found(name)),
            Err(e) => Err(e.into()),
        }
    }
}
