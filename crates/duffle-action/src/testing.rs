//! Test doubles shared by the unit tests of this crate

use async_trait::async_trait;
use duffle_core::Bundle;
use duffle_driver::{Driver, DriverError, Operation};
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};

/// Driver that records every run instead of executing anything
#[derive(Clone, Default)]
pub(crate) struct SpyDriver {
    refused: Vec<String>,
    fail: bool,
    runs: Arc<Mutex<Vec<Operation>>>,
}

impl SpyDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A driver that claims not to handle the given image types
    pub fn refusing(types: &[&str]) -> Self {
        Self {
            refused: types.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    /// A driver whose runs always fail
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn runs(&self) -> Vec<Operation> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Driver for SpyDriver {
    async fn run(&self, op: &Operation) -> duffle_driver::Result<()> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(op.clone());
        if self.fail {
            return Err(DriverError::ContainerFailed { code: 1 });
        }
        Ok(())
    }

    async fn handles(&self, image_type: &str) -> bool {
        !self.refused.iter().any(|t| t == image_type)
    }
}

pub(crate) fn sample_bundle() -> Bundle {
    serde_json::from_value(json!({
        "name": "foo",
        "version": "1.0.0",
        "invocationImages": [
            { "imageType": "docker", "image": "technosophos/foo:1.0.0" }
        ],
        "images": {
            "web": { "image": "nginx:1.25" }
        },
        "actions": {
            "migrate": { "modifies": true },
            "logs": { "stateless": true },
            "dry-run": { "modifies": true, "stateless": true }
        },
        "parameters": {
            "replicas": {
                "type": "int",
                "defaultValue": 1,
                "destination": { "path": "/cnab/app/replicas" }
            },
            "region": {
                "type": "string",
                "required": true,
                "destination": { "env": "REGION" },
                "apply-to": ["install", "upgrade"]
            }
        },
        "credentials": {
            "kubeconfig": { "path": "/root/.kube/config" }
        }
    }))
    .unwrap()
}
