//! Duffle Action - the CNAB lifecycle state machine
//!
//! This crate ties the other pieces together:
//! - **Operation builder**: turns a claim, an action and resolved credentials
//!   into the [`duffle_driver::Operation`] a driver runs
//! - **Executors**: Install, Upgrade, Uninstall, Status and custom actions
//! - **Lifecycle**: executors plus the single policy deciding what happens to
//!   the claim in the store after a run
//!
//! # Example
//!
//! ```no_run
//! use duffle_action::{Lifecycle, Request};
//! use duffle_core::Bundle;
//! use duffle_driver::DebugDriver;
//! use duffle_store::FileStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bundle = Bundle::load("bundle.json".as_ref())?;
//! let lifecycle = Lifecycle::new(
//!     Arc::new(FileStore::new("/tmp/claims")),
//!     Arc::new(DebugDriver::new()),
//! );
//! let claim = lifecycle.install(Request::new("myrelease").with_bundle(bundle)).await?;
//! println!("{} is {}", claim.name, claim.result.status);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod operation;

#[cfg(test)]
mod testing;

pub use error::{ActionError, Result};
pub use executor::{Executor, Install, RunCustom, StatusCheck, Uninstall, Upgrade};
pub use lifecycle::{Lifecycle, Persistence, Request, persist, persistence_for};
pub use operation::{IMAGE_MAP_PATH, build_operation, resolved_parameters, select_invocation_image};
