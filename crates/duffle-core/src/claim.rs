//! Claim - the durable record of one installation
//!
//! A claim embeds the bundle it was created from, the parameters used, and the
//! result of the last action that ran against the installation. Every update
//! generates a fresh revision so that changes stay observable even when two
//! updates land within the same clock tick.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::bundle::Bundle;
use crate::error::{CoreError, Result};

pub const ACTION_INSTALL: &str = "install";
pub const ACTION_UPGRADE: &str = "upgrade";
pub const ACTION_UNINSTALL: &str = "uninstall";
pub const ACTION_STATUS: &str = "status";
pub const ACTION_UNKNOWN: &str = "unknown";

/// Actions a bundle may not redeclare as custom actions
pub const RESERVED_ACTIONS: [&str; 3] = [ACTION_INSTALL, ACTION_UPGRADE, ACTION_UNINSTALL];

static VALID_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-zA-Z0-9_-]+$").expect("static regex"));

/// Outcome of the last action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
    Underway,
    Unknown,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::Failure => write!(f, "failure"),
            Status::Underway => write!(f, "underway"),
            Status::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result of the last action run against an installation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub action: String,
    pub status: Status,
}

/// Persisted record of one installation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub name: String,
    pub revision: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub bundle: Option<Bundle>,
    pub result: ClaimResult,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl Claim {
    /// Create a new claim with an unknown result
    pub fn new(name: &str) -> Result<Self> {
        validate_name(name)?;

        let now = Utc::now();
        Ok(Self {
            name: name.to_string(),
            revision: new_revision(),
            created: now,
            modified: now,
            bundle: None,
            result: ClaimResult {
                message: String::new(),
                action: ACTION_UNKNOWN.to_string(),
                status: Status::Unknown,
            },
            parameters: BTreeMap::new(),
        })
    }

    /// Attach the bundle this claim runs against
    pub fn with_bundle(mut self, bundle: Bundle) -> Self {
        self.bundle = Some(bundle);
        self
    }

    /// Record the outcome of an action
    ///
    /// Sets a fresh revision and bumps `modified`. The message of the previous
    /// result is cleared; callers recording a failure set it afterwards.
    pub fn update(&mut self, action: &str, status: Status) {
        self.result = ClaimResult {
            message: String::new(),
            action: action.to_string(),
            status,
        };
        // Never let `modified` run backwards if the wall clock does
        self.modified = Utc::now().max(self.modified);
        self.revision = new_revision();
    }

    /// Whether the last action was an install that failed
    ///
    /// Such an installation may be installed again under the same name.
    pub fn is_failed_install(&self) -> bool {
        self.result.action == ACTION_INSTALL && self.result.status == Status::Failure
    }

    /// Record a failed action along with its error text
    pub fn fail(&mut self, action: &str, message: impl Into<String>) {
        self.update(action, Status::Failure);
        self.result.message = message.into();
    }
}

/// Check a claim name against `^[a-zA-Z0-9_-]+$`
///
/// Storage backends use the name as a key, so it must never carry path or
/// separator characters.
pub fn validate_name(name: &str) -> Result<()> {
    if VALID_NAME.is_match(name) {
        Ok(())
    } else {
        Err(CoreError::InvalidClaimName {
            name: name.to_string(),
        })
    }
}

/// Time-ordered unique revision token
fn new_revision() -> String {
    Uuid::now_v7().to_string()
}
