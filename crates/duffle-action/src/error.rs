//! Error types for duffle-action

use duffle_core::CoreError;
use duffle_driver::DriverError;
use duffle_store::StoreError;
use thiserror::Error;

/// Result type for lifecycle actions
pub type Result<T> = std::result::Result<T, ActionError>;

/// Errors raised while running a lifecycle action
///
/// Only [`ActionError::Driver`] and [`ActionError::DriverAndPersistence`]
/// mean the invocation image actually ran; everything else is detected
/// before any side effect.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ActionError {
    /// The driver refuses the operation's image type
    #[error("driver does not handle image type {image_type:?}")]
    UnsupportedImageType { image_type: String },

    #[error("no invocation images are defined in the bundle")]
    NoInvocationImages,

    #[error("driver does not handle any available invocation image")]
    NoCompatibleInvocationImage,

    /// The claim carries no bundle to run
    #[error("claim {name:?} has no bundle")]
    MissingBundle { name: String },

    #[error("action {action:?} is reserved and cannot be run as a custom action")]
    ReservedAction { action: String },

    #[error("action {action:?} is not defined in the bundle")]
    UnknownAction { action: String },

    #[error("parameter {name:?} is not defined in the bundle")]
    UndefinedParameter { name: String },

    #[error("missing required parameter {name:?} for action {action:?}")]
    MissingParameter { name: String, action: String },

    /// Credential resolution or validation failed
    #[error(transparent)]
    Credentials(CoreError),

    /// Invalid input such as a bad claim name or parameter value
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The invocation image ran and failed
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The claim could not be read, stored or deleted
    #[error("claim storage failed: {0}")]
    Persistence(#[source] StoreError),

    /// The run failed and recording the failure failed too
    #[error("{driver} (the claim could not be saved either: {persistence})")]
    DriverAndPersistence {
        driver: DriverError,
        persistence: StoreError,
    },
}

impl ActionError {
    /// Whether this wraps the store's claim-not-found sentinel
    pub fn is_not_found(&self) -> bool {
        matches!(self, ActionError::Persistence(e) if e.is_not_found())
    }

    /// Whether the invocation image ran before the error
    pub fn ran(&self) -> bool {
        matches!(
            self,
            ActionError::Driver(_) | ActionError::DriverAndPersistence { .. }
        )
    }
}

impl From<StoreError> for ActionError {
    fn from(e: StoreError) -> Self {
        ActionError::Persistence(e)
    }
}
