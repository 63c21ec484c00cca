//! Action executors
//!
//! Each executor runs one verb against a claim: it selects an invocation
//! image, builds the [`Operation`](duffle_driver::Operation), hands it to the
//! driver and records the outcome in the claim. Executors never touch the
//! claim store; see [`crate::lifecycle`] for that.

use async_trait::async_trait;
use duffle_core::claim::RESERVED_ACTIONS;
use duffle_core::{
    ACTION_INSTALL, ACTION_STATUS, ACTION_UNINSTALL, ACTION_UPGRADE, Claim, Set, Status,
};
use duffle_driver::{Driver, Output};
use std::sync::Arc;

use crate::error::{ActionError, Result};
use crate::operation::{build_operation, select_invocation_image};

/// Runs one lifecycle verb against a claim
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of the action this executor runs
    fn action(&self) -> &str;

    /// Run the action, recording the outcome in `claim`
    async fn run(&self, claim: &mut Claim, creds: &Set) -> Result<()>;
}

/// Select, build, gate and run; optionally record the outcome in the claim
async fn perform(
    driver: &dyn Driver,
    action: &str,
    claim: &mut Claim,
    creds: &Set,
    out: &Output,
    record: bool,
) -> Result<()> {
    let bundle = claim.bundle.as_ref().ok_or_else(|| ActionError::MissingBundle {
        name: claim.name.clone(),
    })?;
    let image = select_invocation_image(driver, bundle).await?;
    let op = build_operation(action, claim, &image, creds, out.clone())?;

    if !driver.handles(&op.image_type).await {
        return Err(ActionError::UnsupportedImageType {
            image_type: op.image_type,
        });
    }

    tracing::info!(
        installation = %op.installation,
        action,
        image = %op.image,
        revision = %op.revision,
        "running invocation image"
    );
    match driver.run(&op).await {
        Ok(()) => {
            if record {
                claim.update(action, Status::Success);
            }
            Ok(())
        }
        Err(e) => {
            if record {
                claim.fail(action, e.to_string());
            }
            Err(ActionError::Driver(e))
        }
    }
}

macro_rules! core_executor {
    ($(#[$doc:meta])* $name:ident, $action:expr, $record:expr) => {
        $(#[$doc])*
        pub struct $name {
            driver: Arc<dyn Driver>,
            out: Output,
        }

        impl $name {
            pub fn new(driver: Arc<dyn Driver>) -> Self {
                Self {
                    driver,
                    out: Output::stdout(),
                }
            }

            /// Send the run's output somewhere other than stdout
            pub fn with_output(mut self, out: Output) -> Self {
                self.out = out;
                self
            }
        }

        #[async_trait]
        impl Executor for $name {
            fn action(&self) -> &str {
                $action
            }

            async fn run(&self, claim: &mut Claim, creds: &Set) -> Result<()> {
                perform(self.driver.as_ref(), $action, claim, creds, &self.out, $record).await
            }
        }
    };
}

core_executor!(
    /// Installs a bundle
    Install,
    ACTION_INSTALL,
    true
);
core_executor!(
    /// Upgrades an existing installation
    Upgrade,
    ACTION_UPGRADE,
    true
);
core_executor!(
    /// Uninstalls an existing installation
    ///
    /// The claim is updated like any other action; removing it from the
    /// store is a separate step taken only after a successful run.
    Uninstall,
    ACTION_UNINSTALL,
    true
);
core_executor!(
    /// Queries the live status of an installation without changing its claim
    StatusCheck,
    ACTION_STATUS,
    false
);

/// Runs a custom action declared by the bundle
pub struct RunCustom {
    action: String,
    driver: Arc<dyn Driver>,
    out: Output,
}

impl RunCustom {
    pub fn new(action: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        Self {
            action: action.into(),
            driver,
            out: Output::stdout(),
        }
    }

    pub fn with_output(mut self, out: Output) -> Self {
        self.out = out;
        self
    }
}

#[async_trait]
impl Executor for RunCustom {
    fn action(&self) -> &str {
        &self.action
    }

    async fn run(&self, claim: &mut Claim, creds: &Set) -> Result<()> {
        if RESERVED_ACTIONS.contains(&self.action.as_str()) {
            return Err(ActionError::ReservedAction {
                action: self.action.clone(),
            });
        }
        let bundle = claim.bundle.as_ref().ok_or_else(|| ActionError::MissingBundle {
            name: claim.name.clone(),
        })?;
        let declared = bundle
            .actions
            .get(&self.action)
            .ok_or_else(|| ActionError::UnknownAction {
                action: self.action.clone(),
            })?;

        // Only state-modifying actions leave a new revision behind
        let record = declared.records_revision();
        perform(
            self.driver.as_ref(),
            &self.action,
            claim,
            creds,
            &self.out,
            record,
        )
        .await
    }
}
