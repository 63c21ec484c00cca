//! Driver lookup
//!
//! Built-in drivers are registered by name. Any other name resolves to a
//! `duffle-<name>` executable on PATH; if none exists the lookup fails before
//! anything is built or run.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::{AciDriver, CommandDriver, DebugDriver, DockerDriver, Driver, KubernetesDriver};

/// Constructor for a registered driver
pub type DriverFactory = Box<dyn Fn() -> Box<dyn Driver> + Send + Sync>;

/// Maps driver names to constructors
pub struct DriverRegistry {
    factories: BTreeMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// An empty registry; only plugins on PATH resolve
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in drivers
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("docker", || Box::new(DockerDriver::new()));
        registry.register("kubernetes", || Box::new(KubernetesDriver::new()));
        registry.register("k8s", || Box::new(KubernetesDriver::new()));
        registry.register("aci", || Box::new(AciDriver::new()));
        registry.register("debug", || Box::new(DebugDriver::new()));
        registry
    }

    /// Register (or replace) a driver under `name`
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Driver> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Resolve a driver by name
    pub fn lookup(&self, name: &str) -> Result<Box<dyn Driver>> {
        if let Some(factory) = self.factories.get(name) {
            return Ok(factory());
        }

        let plugin = CommandDriver::find(name)?;
        tracing::debug!(driver = %name, program = %plugin.program().display(), "using plugin driver");
        Ok(Box::new(plugin))
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a driver using the built-in registry
pub fn lookup(name: &str) -> Result<Box<dyn Driver>> {
    DriverRegistry::new().lookup(name)
}

/// Feed a configurable driver the values of its recognized settings
///
/// `source` is typically the process environment. Settings `source` knows
/// nothing about are left unset. Drivers without the capability are untouched.
pub fn configure_from<F>(driver: &mut dyn Driver, source: F)
where
    F: Fn(&str) -> Option<String>,
{
    let Some(configurable) = driver.as_configurable_mut() else {
        return;
    };

    let settings: BTreeMap<String, String> = configurable
        .config()
        .keys()
        .filter_map(|key| source(key).map(|value| (key.to_string(), value)))
        .collect();
    configurable.set_config(&settings);
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry").field("drivers", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtins() {
        let registry = DriverRegistry::new();
        assert_eq!(registry.names(), vec!["aci", "debug", "docker", "k8s", "kubernetes"]);

        let docker = registry.lookup("docker").unwrap();
        assert!(docker.handles("oci").await);
        assert!(!docker.handles("qcow").await);

        let debug = registry.lookup("debug").unwrap();
        assert!(debug.handles("qcow").await);
    }

    #[test]
    fn test_unknown_driver() {
        let err = lookup("no-such-driver-abc").err().unwrap();
        assert_eq!(
            err.to_string(),
            "unsupported driver or driver not found in PATH: no-such-driver-abc"
        );
    }

    #[tokio::test]
    async fn test_register_custom() {
        let mut registry = DriverRegistry::empty();
        registry.register("mine", || Box::new(DebugDriver::new()));
        assert!(registry.lookup("mine").is_ok());
        assert!(registry.lookup("docker").is_err());
    }

    #[test]
    fn test_configure_from() {
        let mut driver = KubernetesDriver::new();
        let env = BTreeMap::from([
            ("KUBE_NAMESPACE".to_string(), "cnab".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ]);
        configure_from(&mut driver, |k| env.get(k).cloned());
        assert_eq!(driver.namespace(), "cnab");
    }
}
