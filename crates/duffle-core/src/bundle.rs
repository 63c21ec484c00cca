//! Bundle definition (bundle.json)

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{CoreError, Result};

/// Image type for Docker images
pub const IMAGE_TYPE_DOCKER: &str = "docker";
/// Image type for OCI images
pub const IMAGE_TYPE_OCI: &str = "oci";
/// Image type for QCOW virtual machine images
pub const IMAGE_TYPE_QCOW: &str = "qcow";

/// A CNAB bundle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub name: String,

    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintainers: Vec<Maintainer>,

    /// Images able to run the bundle's actions, in order of preference
    #[serde(default)]
    pub invocation_images: Vec<InvocationImage>,

    /// Component images, keyed by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub images: BTreeMap<String, Image>,

    /// Custom actions declared by the bundle
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, Action>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, ParameterDefinition>,

    /// Credentials the invocation image expects, keyed by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, CredentialLocation>,
}

/// Maintainer of a bundle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Maintainer {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Invocation image reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationImage {
    #[serde(default = "default_image_type")]
    pub image_type: String,

    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Component image used by the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub image: String,

    #[serde(default = "default_image_type")]
    pub image_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

fn default_image_type() -> String {
    IMAGE_TYPE_OCI.to_string()
}

/// Custom (non-core) action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Whether running the action may modify the installation
    #[serde(default)]
    pub modifies: bool,

    /// Whether the action can run without an existing installation
    #[serde(default)]
    pub stateless: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Action {
    /// Whether a run of this action results in a stored claim revision
    pub fn records_revision(&self) -> bool {
        self.modifies && !self.stateless
    }
}

/// Where a value is injected into the invocation image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

/// Location of a credential the invocation image needs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Definition of a single bundle parameter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDefinition {
    /// One of `string`, `int`, `bool`
    #[serde(rename = "type")]
    pub data_type: String,

    /// `Some(Value::Null)` when the bundle declares an explicit `null` default
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,

    #[serde(default)]
    pub required: bool,

    #[serde(default, alias = "enum", skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Location>,

    /// Actions this parameter applies to; empty means all actions
    #[serde(default, rename = "apply-to", skip_serializing_if = "Vec::is_empty")]
    pub apply_to: Vec<String>,
}

/// Keep an explicit `null` as `Some(Value::Null)`; an absent field stays `None`
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ParameterDefinition {
    /// The declared default, where an explicit `null` counts as none
    pub fn declared_default(&self) -> Option<&Value> {
        self.default_value.as_ref().filter(|v| !v.is_null())
    }

    /// Whether the parameter is used by the given action
    pub fn applies_to(&self, action: &str) -> bool {
        self.apply_to.is_empty() || self.apply_to.iter().any(|a| a == action)
    }

    /// Check a value against the declared type and constraints
    pub fn validate_value(&self, value: &Value) -> std::result::Result<(), String> {
        match self.data_type.as_str() {
            "string" => self.validate_string(value)?,
            "int" => self.validate_int(value)?,
            "bool" => {
                if !value.is_boolean() {
                    return Err("value is not a boolean".to_string());
                }
            }
            other => return Err(format!("invalid parameter type {other:?}")),
        }

        if !self.allowed_values.is_empty() && !self.allowed_values.contains(value) {
            return Err("value is not in the set of allowed values for this parameter".to_string());
        }
        Ok(())
    }

    fn validate_string(&self, value: &Value) -> std::result::Result<(), String> {
        let s = value.as_str().ok_or("value is not a string")?;
        let len = s.chars().count();
        if let Some(min) = self.min_length
            && len < min
        {
            return Err(format!("value is shorter than {min}"));
        }
        if let Some(max) = self.max_length
            && len > max
        {
            return Err(format!("value is longer than {max}"));
        }
        if let Some(pattern) = &self.pattern {
            let re = Regex::new(pattern).map_err(|e| e.to_string())?;
            if !re.is_match(s) {
                return Err(format!("{s:?} did not match pattern {pattern:?}"));
            }
        }
        Ok(())
    }

    fn validate_int(&self, value: &Value) -> std::result::Result<(), String> {
        let n = value.as_i64().ok_or("value is not an integer")?;
        if let Some(min) = self.minimum
            && n < min
        {
            return Err(format!("value is lower than {min}"));
        }
        if let Some(max) = self.maximum
            && n > max
        {
            return Err(format!("value is higher than {max}"));
        }
        Ok(())
    }

    /// Parse a command-line string into a value of the declared type
    pub fn convert_value(&self, raw: &str) -> std::result::Result<Value, String> {
        match self.data_type.as_str() {
            "string" => Ok(Value::String(raw.to_string())),
            "int" => raw
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("{raw:?} is not a valid integer")),
            "bool" => match raw.to_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(format!("{raw:?} is not a valid boolean")),
            },
            other => Err(format!("invalid parameter type {other:?}")),
        }
    }

    /// Coerce a numerically-integral float (as produced by some decoders) to an int
    fn coerce_value(&self, value: Value) -> Value {
        if self.data_type == "int"
            && let Some(f) = value.as_f64()
            && !value.is_i64()
            && f.fract() == 0.0
        {
            return Value::from(f as i64);
        }
        value
    }
}

impl Bundle {
    /// Parse a bundle from JSON bytes
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Load a bundle from a bundle.json file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_slice(&data)
    }

    /// Validate the bundle contents
    pub fn validate(&self) -> Result<()> {
        if self.invocation_images.is_empty() {
            return Err(CoreError::InvalidBundle {
                message: "at least one invocation image must be defined in the bundle".to_string(),
            });
        }

        for img in &self.invocation_images {
            let dockerish = matches!(img.image_type.as_str(), IMAGE_TYPE_DOCKER | IMAGE_TYPE_OCI);
            if dockerish && !has_tag_or_digest(&img.image) {
                return Err(CoreError::InvalidBundle {
                    message: format!("invocation image {:?}: tag is required", img.image),
                });
            }
        }

        for (name, def) in &self.parameters {
            if let Some(default) = def.declared_default() {
                def.validate_value(default)
                    .map_err(|reason| CoreError::InvalidBundle {
                        message: format!("default value of parameter {name:?}: {reason}"),
                    })?;
            }
        }
        Ok(())
    }

    /// Validate supplied parameter values and fill in defaults for the rest
    pub fn values_or_defaults(
        &self,
        values: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>> {
        if let Some(name) = values.keys().find(|k| !self.parameters.contains_key(*k)) {
            return Err(CoreError::UndefinedParameter { name: name.clone() });
        }

        let mut resolved = BTreeMap::new();
        for (name, def) in &self.parameters {
            match values.get(name) {
                Some(value) => {
                    let value = def.coerce_value(value.clone());
                    def.validate_value(&value)
                        .map_err(|reason| CoreError::InvalidParameterValue {
                            name: name.clone(),
                            value: value.to_string(),
                            reason,
                        })?;
                    resolved.insert(name.clone(), value);
                }
                None => {
                    if let Some(default) = def.declared_default() {
                        resolved.insert(name.clone(), default.clone());
                    }
                }
            }
        }
        Ok(resolved)
    }
}

/// A docker-style reference needs a tag or a digest after the last path segment
fn has_tag_or_digest(image: &str) -> bool {
    let last = image.rsplit('/').next().unwrap_or(image);
    last.contains(':') || last.contains('@')
}
