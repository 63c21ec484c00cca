//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    #[error("invalid name {name:?}. Names must be [a-zA-Z0-9-_]+")]
    InvalidClaimName { name: String },

    #[error("invalid bundle: {message}")]
    InvalidBundle { message: String },

    #[error("can't use {value} as value of {name}: {reason}")]
    InvalidParameterValue {
        name: String,
        value: String,
        reason: String,
    },

    #[error("parameter {name:?} is not defined in the bundle")]
    UndefinedParameter { name: String },

    #[error("credential {name:?}: {message}")]
    Credential { name: String, message: String },

    #[error("bundle requires credential for {name}")]
    MissingCredential { name: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
