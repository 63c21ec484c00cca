//! Kubernetes ConfigMap claim store
//!
//! One ConfigMap per claim. The claim JSON lives under the `claim` binary key.
//! Claim names allow characters Kubernetes object names do not (uppercase,
//! underscores), so the object name is a sanitized, hash-suffixed form and the
//! real claim name is kept in an annotation.

use async_trait::async_trait;
use duffle_core::Claim;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{Result, StoreError};
use crate::{ClaimStore, decode_claim, encode_claim};

const NAME_PREFIX: &str = "duffle-claim-";
const DATA_KEY: &str = "claim";
const CLAIM_NAME_ANNOTATION: &str = "duffle.sh/claim-name";
const SELECTOR: &str = "heritage=duffle,duffle.sh/type=claim";

/// ConfigMap-backed claim store
pub struct ConfigMapStore {
    client: Client,
    namespace: String,
}

impl ConfigMapStore {
    /// Connect using the default kubeconfig / in-cluster configuration
    pub async fn new(namespace: &str) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::with_client(client, namespace))
    }

    /// Create with an existing client
    pub fn with_client(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Kubernetes object name for a claim
pub(crate) fn object_name(claim_name: &str) -> String {
    let sanitized: String = claim_name
        .chars()
        .take(40)
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();
    let digest = Sha256::digest(claim_name.as_bytes());
    format!("{NAME_PREFIX}{}-{}", sanitized.trim_matches('-'), hex::encode(&digest[..4]))
}

fn claim_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("heritage".to_string(), "duffle".to_string());
    labels.insert("duffle.sh/type".to_string(), "claim".to_string());
    labels
}

fn build_configmap(claim: &Claim, namespace: &str) -> Result<ConfigMap> {
    let mut annotations = BTreeMap::new();
    annotations.insert(CLAIM_NAME_ANNOTATION.to_string(), claim.name.clone());

    let mut binary_data = BTreeMap::new();
    binary_data.insert(DATA_KEY.to_string(), ByteString(encode_claim(claim)?));

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(object_name(&claim.name)),
            namespace: Some(namespace.to_string()),
            labels: Some(claim_labels()),
            annotations: Some(annotations),
            ..Default::default()
        },
        binary_data: Some(binary_data),
        ..Default::default()
    })
}

fn parse_configmap(cm: &ConfigMap) -> Result<Claim> {
    let data = cm
        .binary_data
        .as_ref()
        .and_then(|d| d.get(DATA_KEY))
        .ok_or_else(|| StoreError::Storage("ConfigMap missing 'claim' data".to_string()))?;
    decode_claim(&data.0)
}

#[async_trait]
impl ClaimStore for ConfigMapStore {
    async fn list(&self) -> Result<Vec<String>> {
        let cms = self.api().list(&ListParams::default().labels(SELECTOR)).await?;
        let mut names: Vec<String> = cms
            .items
            .iter()
            .filter_map(|cm| cm.metadata.annotations.as_ref()?.get(CLAIM_NAME_ANNOTATION).cloned())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn store(&self, claim: &Claim) -> Result<()> {
        let api = self.api();
        let cm = build_configmap(claim, &self.namespace)?;
        let key = object_name(&claim.name);

        match api.get(&key).await {
            Ok(_) => {
                api.replace(&key, &PostParams::default(), &cm).await?;
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                api.create(&PostParams::default(), &cm).await?;
            }
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(claim = %claim.name, configmap = %key, "stored claim");
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Claim> {
        match self.api().get(&object_name(name)).await {
            Ok(cm) => parse_configmap(&cm),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(StoreError::not_found(name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api().delete(&object_name(name), &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(StoreError::not_found(name)),
            Err(e) => Err(e.into()),
        }
    }
}
