//! MongoDB claim store
//!
//! Each claim is a document keyed by claim name, carrying the claim JSON as a
//! string payload so the stored form matches the other backends.

use async_trait::async_trait;
use duffle_core::Claim;
use mongodb::bson::{Bson, doc};
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::{ClaimStore, decode_claim, encode_claim};

const DEFAULT_DATABASE: &str = "duffle";
const DEFAULT_COLLECTION: &str = "claims";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ClaimDocument {
    #[serde(rename = "_id")]
    name: String,
    data: String,
}

impl ClaimDocument {
    fn from_claim(claim: &Claim) -> Result<Self> {
        let data = String::from_utf8(encode_claim(claim)?)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self {
            name: claim.name.clone(),
            data,
        })
    }

    fn into_claim(self) -> Result<Claim> {
        decode_claim(self.data.as_bytes())
    }
}

/// MongoDB-backed claim store
pub struct MongoStore {
    collection: Collection<ClaimDocument>,
}

impl MongoStore {
    /// Connect to `uri`
    ///
    /// Uses the database named in the URI, or `duffle` when none is given.
    pub async fn connect(uri: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        let database = client
            .default_database()
            .unwrap_or_else(|| client.database(DEFAULT_DATABASE));
        Ok(Self {
            collection: database.collection(DEFAULT_COLLECTION),
        })
    }
}

#[async_trait]
impl ClaimStore for MongoStore {
    async fn list(&self) -> Result<Vec<String>> {
        let ids = self.collection.distinct("_id", doc! {}).await?;
        let mut names: Vec<String> = ids
            .into_iter()
            .filter_map(|id| match id {
                Bson::String(s) => Some(s),
                _ => None,
            })
            .collect();
        names.sort();
        Ok(names)
    }

    async fn store(&self, claim: &Claim) -> Result<()> {
        let document = ClaimDocument::from_claim(claim)?;
        self.collection
            .replace_one(doc! { "_id": &claim.name }, &document)
            .upsert(true)
            .await?;
        tracing::debug!(claim = %claim.name, "stored claim");
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Claim> {
        self.collection
            .find_one(doc! { "_id": name })
            .await?
            .ok_or_else(|| StoreError::not_found(name))?
            .into_claim()
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let result = self.collection.delete_one(doc! { "_id": name }).await?;
        if result.deleted_count == 0 {
            return Err(StoreError::not_found(name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_round_trip() {
        let claim = Claim::new("myrelease").unwrap();
        let document = ClaimDocument::from_claim(&claim).unwrap();
        assert_eq!(document.name, "myrelease");

        let as_bson = mongodb::bson::to_document(&document).unwrap();
        assert_eq!(as_bson.get_str("_id").unwrap(), "myrelease");

        let back: ClaimDocument = mongodb::bson::from_document(as_bson).unwrap();
        assert_eq!(back.into_claim().unwrap(), claim);
    }
}
