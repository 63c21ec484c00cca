//! Debug driver
//!
//! Handles every image type and never runs anything: it prints the operation
//! it received. Useful for dry runs and tests.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::{Configurable, Driver, Operation, flag};

#[derive(Debug, Default)]
pub struct DebugDriver {
    verbose: bool,
}

impl DebugDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Driver for DebugDriver {
    async fn run(&self, op: &Operation) -> Result<()> {
        let data = serde_json::to_string_pretty(op)?;
        op.out.line(data)?;
        if self.verbose {
            tracing::info!(installation = %op.installation, action = %op.action, "debug driver printed operation");
        }
        Ok(())
    }

    async fn handles(&self, _image_type: &str) -> bool {
        true
    }

    fn as_configurable(&self) -> Option<&dyn Configurable> {
        Some(self)
    }

    fn as_configurable_mut(&mut self) -> Option<&mut dyn Configurable> {
        Some(self)
    }
}

impl Configurable for DebugDriver {
    fn config(&self) -> BTreeMap<&'static str, &'static str> {
        BTreeMap::from([("VERBOSE", "Increase verbosity. true, false are supported values")])
    }

    fn set_config(&mut self, settings: &BTreeMap<String, String>) {
        if let Some(v) = settings.get("VERBOSE") {
            self.verbose = flag(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Output;

    #[tokio::test]
    async fn test_prints_operation() {
        let (out, capture) = Output::capture();
        let op = Operation {
            installation: "myrelease".to_string(),
            action: "install".to_string(),
            image: "foo:1.0".to_string(),
            image_type: "qcow".to_string(),
            out,
            ..Default::default()
        };

        let driver = DebugDriver::new();
        assert!(driver.handles("qcow").await);
        driver.run(&op).await.unwrap();

        let printed: serde_json::Value = serde_json::from_str(&capture.contents()).unwrap();
        assert_eq!(printed["installation_name"], "myrelease");
        assert_eq!(printed["image_type"], "qcow");
    }

    #[test]
    fn test_config() {
        let mut driver = DebugDriver::new();
        assert!(driver.config().contains_key("VERBOSE"));
        driver.set_config(&BTreeMap::from([("VERBOSE".to_string(), "true".to_string())]));
        assert!(driver.verbose);
    }
}
