//! Duffle Core - Core types for the CNAB lifecycle engine
//!
//! This crate provides the foundational types used throughout Duffle:
//! - `Bundle`: The CNAB bundle definition (invocation images, parameters, credentials, actions)
//! - `Claim`: The durable record of one installation
//! - `CredentialSet`: Declarative recipe for obtaining secrets at run time

pub mod bundle;
pub mod claim;
pub mod credentials;
pub mod error;

pub use bundle::{
    Action, Bundle, CredentialLocation, Image, InvocationImage, Location, Maintainer,
    ParameterDefinition,
};
pub use claim::{
    ACTION_INSTALL, ACTION_STATUS, ACTION_UNINSTALL, ACTION_UNKNOWN, ACTION_UPGRADE, Claim,
    ClaimResult, Status, validate_name,
};
pub use credentials::{CredentialSet, CredentialStrategy, Destination, Set, Source};
pub use error::{CoreError, Result};
