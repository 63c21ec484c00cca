//! In-memory claim store for testing
//!
//! Keeps claims in a map and counts operations so tests can assert that a
//! `store` call did, or did not, happen.

use async_trait::async_trait;
use duffle_core::Claim;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::ClaimStore;
use crate::error::{Result, StoreError};

/// In-memory claim store
#[derive(Clone, Default)]
pub struct MemoryClaimStore {
    claims: Arc<RwLock<BTreeMap<String, Claim>>>,
    operations: Arc<RwLock<OperationCounts>>,
    fail_stores: bool,
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub lists: usize,
    pub stores: usize,
    pub reads: usize,
    pub deletes: usize,
}

impl MemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with pre-populated claims
    pub fn with_claims(claims: Vec<Claim>) -> Self {
        let store = Self::new();
        {
            let mut map = store.claims.write().unwrap_or_else(PoisonError::into_inner);
            for claim in claims {
                map.insert(claim.name.clone(), claim);
            }
        }
        store
    }

    /// A store whose `store` calls always fail, for exercising persistence errors
    pub fn failing() -> Self {
        Self {
            fail_stores: true,
            ..Self::default()
        }
    }

    pub fn operation_counts(&self) -> OperationCounts {
        self.operations.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn reset_counts(&self) {
        *self.operations.write().unwrap_or_else(PoisonError::into_inner) = OperationCounts::default();
    }

    /// Snapshot of a stored claim without touching the counters
    pub fn peek(&self, name: &str) -> Option<Claim> {
        self.claims
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn record(&self, f: impl FnOnce(&mut OperationCounts)) {
        f(&mut self.operations.write().unwrap_or_else(PoisonError::into_inner));
    }
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn list(&self) -> Result<Vec<String>> {
        self.record(|ops| ops.lists += 1);
        let claims = self.claims.read().unwrap_or_else(PoisonError::into_inner);
        Ok(claims.keys().cloned().collect())
    }

    async fn store(&self, claim: &Claim) -> Result<()> {
        self.record(|ops| ops.stores += 1);
        if self.fail_stores {
            return Err(StoreError::Storage("store is read-only".to_string()));
        }
        self.claims
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(claim.name.clone(), claim.clone());
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Claim> {
        self.record(|ops| ops.reads += 1);
        self.peek(name).ok_or_else(|| StoreError::not_found(name))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.record(|ops| ops.deletes += 1);
        self.claims
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(name))
    }
}
