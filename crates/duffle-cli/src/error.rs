//! CLI error types with exit code handling
//!
//! Library errors are converted into [`CliError`] at the command boundary;
//! only `main` turns one into a process exit.

use duffle_action::ActionError;
use duffle_core::CoreError;
use duffle_driver::DriverError;
use duffle_store::StoreError;
use miette::Diagnostic;
use thiserror::Error;

use crate::exit_codes;

/// CLI-specific error type that includes exit code information
#[derive(Error, Debug, Diagnostic, Clone)]
pub enum CliError {
    /// Bad bundle, parameter value or claim name
    #[error("Validation failed: {message}")]
    #[diagnostic(code(duffle::cli::validation))]
    Validation {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// The invocation image ran and failed
    #[error("Action failed: {message}")]
    #[diagnostic(code(duffle::cli::action))]
    Action {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// Credential set could not be loaded, resolved or matched
    #[error("Credentials error: {message}")]
    #[diagnostic(code(duffle::cli::credentials))]
    Credentials { message: String },

    /// Unknown driver or unsupported invocation image
    #[error("Driver error: {message}")]
    #[diagnostic(code(duffle::cli::driver))]
    Driver {
        message: String,
        #[help]
        help: Option<String>,
    },

    #[error("Storage error: {message}")]
    #[diagnostic(code(duffle::cli::storage))]
    Storage { message: String },

    #[error("Claim {name:?} not found")]
    #[diagnostic(
        code(duffle::cli::not_found),
        help("run `duffle claims list` to see known installations")
    )]
    NotFound { name: String },

    #[error("A claim with the name {name:?} already exists")]
    #[diagnostic(
        code(duffle::cli::exists),
        help("upgrade the existing installation or choose another name")
    )]
    AlreadyExists { name: String },

    /// Invalid combination of arguments
    #[error("{message}")]
    #[diagnostic(code(duffle::cli::usage))]
    Usage { message: String },

    /// IO error (file not found, permissions, etc.)
    #[error("IO error: {message}")]
    #[diagnostic(code(duffle::cli::io))]
    Io { message: String },

    #[error("{message}")]
    #[diagnostic(code(duffle::cli::error))]
    Other { message: String },
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Validation { .. } => exit_codes::VALIDATION_ERROR,
            CliError::Action { .. } => exit_codes::ACTION_FAILED,
            CliError::Credentials { .. } => exit_codes::CREDENTIALS_ERROR,
            CliError::Driver { .. } => exit_codes::DRIVER_ERROR,
            CliError::Storage { .. } => exit_codes::STORAGE_ERROR,
            CliError::NotFound { .. } => exit_codes::NOT_FOUND,
            CliError::AlreadyExists { .. } => exit_codes::VALIDATION_ERROR,
            CliError::Usage { .. } => exit_codes::USAGE_ERROR,
            CliError::Io { .. } => exit_codes::IO_ERROR,
            CliError::Other { .. } => exit_codes::ERROR,
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            help: None,
        }
    }

    /// Create a usage error
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    /// Create a credentials error
    pub fn credentials(message: impl Into<String>) -> Self {
        Self::Credentials {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io {
            message: err.to_string(),
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Credential { .. } | CoreError::MissingCredential { .. } => {
                CliError::credentials(err.to_string())
            }
            CoreError::Io(e) => CliError::from(e),
            other => CliError::validation(other.to_string()),
        }
    }
}

impl From<DriverError> for CliError {
    fn from(err: DriverError) -> Self {
        let help = match &err {
            DriverError::NotFound { name } => Some(format!(
                "built-in drivers are listed by `duffle drivers`; plugins must be on PATH as duffle-{name}"
            )),
            _ => None,
        };
        CliError::Driver {
            message: err.to_string(),
            help,
        }
    }
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ClaimNotFound { name } => CliError::NotFound { name },
            e @ StoreError::InvalidName { .. } => CliError::validation(e.to_string()),
            other => CliError::Storage {
                message: other.to_string(),
            },
        }
    }
}

impl From<ActionError> for CliError {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::Persistence(e) => CliError::from(e),
            ActionError::Credentials(e) => CliError::credentials(e.to_string()),
            ActionError::Core(e) => CliError::from(e),
            ActionError::UnsupportedImageType { .. }
            | ActionError::NoCompatibleInvocationImage => CliError::Driver {
                message: err.to_string(),
                help: Some("pick a driver that handles one of the bundle's invocation images".into()),
            },
            e @ (ActionError::Driver(_) | ActionError::DriverAndPersistence { .. }) => {
                let help = matches!(e, ActionError::Driver(_))
                    .then(|| "the failure was recorded in the claim; see `duffle claims show`".to_string());
                CliError::Action {
                    message: e.to_string(),
                    help,
                }
            }
            other => CliError::validation(other.to_string()),
        }
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_exit_code() {
        let err = CliError::from(ActionError::Persistence(StoreError::ClaimNotFound {
            name: "ghost".into(),
        }));
        assert!(matches!(err, CliError::NotFound { .. }));
        assert_eq!(err.exit_code(), exit_codes::NOT_FOUND);
    }

    #[test]
    fn test_invalid_store_key_is_validation_error() {
        let err = CliError::from(StoreError::InvalidName {
            name: "../x".into(),
        });
        assert_eq!(err.exit_code(), exit_codes::VALIDATION_ERROR);
    }

    #[test]
    fn test_driver_failure_is_action_error() {
        let err = CliError::from(ActionError::Driver(DriverError::ContainerFailed { code: 2 }));
        assert_eq!(err.exit_code(), exit_codes::ACTION_FAILED);
    }

    #[test]
    fn test_missing_credential_exit_code() {
        let err = CliError::from(ActionError::Credentials(CoreError::MissingCredential {
            name: "kubeconfig".into(),
        }));
        assert_eq!(err.exit_code(), exit_codes::CREDENTIALS_ERROR);
        assert!(err.to_string().contains("kubeconfig"));
    }

    #[test]
    fn test_unknown_driver_has_help() {
        let err = CliError::from(DriverError::NotFound { name: "nope".into() });
        let CliError::Driver { help, .. } = &err else {
            panic!("unexpected error: {err}");
        };
        assert!(help.as_deref().unwrap().contains("duffle-nope"));
        assert_eq!(err.exit_code(), exit_codes::DRIVER_ERROR);
    }
}
