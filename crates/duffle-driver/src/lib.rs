//! Duffle Driver - runs CNAB invocation images
//!
//! This crate provides:
//! - **Operation**: the request handed from the engine to a driver
//! - **Driver**: the minimal execution contract, plus the optional `Configurable` capability
//! - **Registry**: name-to-driver lookup with a `duffle-<name>` plugin fallback
//! - **Backends**: Debug, Command (plugin), Docker, Kubernetes and Azure Container Instances

pub mod aci;
pub mod command;
pub mod debug;
pub mod docker;
pub mod error;
pub mod kubernetes;
pub mod operation;
pub mod registry;

pub use aci::AciDriver;
pub use command::CommandDriver;
pub use debug::DebugDriver;
pub use docker::DockerDriver;
pub use error::{DriverError, Result};
pub use kubernetes::KubernetesDriver;
pub use operation::{Capture, Operation, Output};
pub use registry::{DriverFactory, DriverRegistry, configure_from, lookup};

pub use duffle_core::bundle::{IMAGE_TYPE_DOCKER, IMAGE_TYPE_OCI, IMAGE_TYPE_QCOW};

use async_trait::async_trait;
use std::collections::BTreeMap;

/// Executes invocation images
///
/// Implementations must be Send + Sync so one driver can serve an action
/// running on any task.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Run the operation inside the invocation image
    async fn run(&self, op: &Operation) -> Result<()>;

    /// Whether this driver can run images of the given type
    async fn handles(&self, image_type: &str) -> bool;

    /// Optional configuration capability
    fn as_configurable(&self) -> Option<&dyn Configurable> {
        None
    }

    /// Optional configuration capability, mutable
    fn as_configurable_mut(&mut self) -> Option<&mut dyn Configurable> {
        None
    }
}

/// Drivers that accept environment-style settings
pub trait Configurable {
    /// Recognized setting names and their descriptions
    fn config(&self) -> BTreeMap<&'static str, &'static str>;

    /// Apply settings; unknown names are ignored
    fn set_config(&mut self, settings: &BTreeMap<String, String>);
}

/// Interpret a boolean-ish setting (`1`, `true`)
pub(crate) fn flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true")
}

/// Docker and OCI images are the only kinds container runtimes accept
pub(crate) fn is_container_image(image_type: &str) -> bool {
    let t = image_type.to_lowercase();
    t == IMAGE_TYPE_DOCKER || t == IMAGE_TYPE_OCI
}
