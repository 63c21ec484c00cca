//! Credential sets and their resolution
//!
//! A credential set is a YAML document listing, for each credential, where to
//! read the value on the local host (`source`) and where to inject it in the
//! invocation image (`destination`).
//!
//! ```yaml
//! name: production
//! credentials:
//!   - name: kubeconfig
//!     source:
//!       path: $HOME/.kube/config
//!     destination:
//!       path: /root/.kube/config
//!   - name: token
//!     source:
//!       env: API_TOKEN
//!       value: fallback-token
//!     destination:
//!       env: TOKEN
//! ```

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;

use crate::bundle::CredentialLocation;
use crate::error::{CoreError, Result};

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").expect("static regex")
});

/// Named collection of credential strategies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialSet {
    pub name: String,

    #[serde(default)]
    pub credentials: Vec<CredentialStrategy>,
}

/// How to obtain one credential and where to send it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialStrategy {
    pub name: String,

    #[serde(default)]
    pub source: Source,

    #[serde(default)]
    pub destination: Destination,
}

/// Where a credential value comes from on the local host
///
/// When several fields are set, the first of `command`, `path`, `env`, `value`
/// wins. An unset environment variable falls back to `value`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

/// Where a credential is injected in the invocation image, with its resolved value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

/// Resolved credentials, keyed by credential name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Set(BTreeMap<String, Destination>);

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, destination: Destination) {
        self.0.insert(name.into(), destination);
    }

    pub fn get(&self, name: &str) -> Option<&Destination> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Credential names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Merge another set into this one; later entries win on name collision
    pub fn merge(&mut self, other: Set) {
        self.0.extend(other.0);
    }

    /// Split into environment variables and files
    pub fn flatten(&self) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let mut env = BTreeMap::new();
        let mut files = BTreeMap::new();
        for dest in self.0.values() {
            if let Some(var) = dest.env.as_deref().filter(|v| !v.is_empty()) {
                env.insert(var.to_string(), dest.value.clone());
            }
            if let Some(path) = dest.path.as_deref().filter(|p| !p.is_empty()) {
                files.insert(path.to_string(), dest.value.clone());
            }
        }
        (env, files)
    }

    /// Check that every credential the bundle requires has a matching destination
    ///
    /// A requirement is met when some resolved credential targets the same
    /// environment variable or the same path. Extra credentials are ignored.
    pub fn validate(&self, required: &BTreeMap<String, CredentialLocation>) -> Result<()> {
        for (name, location) in required {
            if !self.satisfies(location) {
                return Err(CoreError::MissingCredential { name: name.clone() });
            }
        }
        Ok(())
    }

    fn satisfies(&self, location: &CredentialLocation) -> bool {
        let same = |want: &Option<String>, have: &Option<String>| match (want, have) {
            (Some(w), Some(h)) => !w.is_empty() && w == h,
            _ => false,
        };
        self.0
            .values()
            .any(|dest| same(&location.env, &dest.env) || same(&location.path, &dest.path))
    }
}

impl CredentialSet {
    /// Load a credential set from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    /// Resolve every strategy to a concrete value
    ///
    /// Fails on the first credential that cannot be resolved; no partial set
    /// is returned.
    pub fn resolve(&self) -> Result<Set> {
        let mut resolved = Set::new();
        for strategy in &self.credentials {
            let value = resolve_source(&strategy.source).map_err(|message| {
                CoreError::Credential {
                    name: strategy.name.clone(),
                    message,
                }
            })?;

            let mut dest = strategy.destination.clone();
            dest.value = value;
            resolved.insert(strategy.name.clone(), dest);
        }
        tracing::debug!(set = %self.name, count = resolved.len(), "resolved credentials");
        Ok(resolved)
    }
}

fn resolve_source(source: &Source) -> std::result::Result<String, String> {
    let non_empty = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_string);

    if let Some(command) = non_empty(&source.command) {
        return run_command(&command);
    }

    if let Some(path) = non_empty(&source.path) {
        let expanded = expand_env(&path);
        return std::fs::read_to_string(&expanded)
            .map_err(|e| format!("failed to read {expanded}: {e}"));
    }

    if let Some(var) = non_empty(&source.env)
        && let Ok(value) = std::env::var(&var)
    {
        return Ok(value);
    }

    Ok(source.value.clone().unwrap_or_default())
}

/// Run a command without a shell and return its combined output
fn run_command(command: &str) -> std::result::Result<String, String> {
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or("empty command")?;

    let output = Command::new(program)
        .args(parts)
        .output()
        .map_err(|e| format!("failed to run {program:?}: {e}"))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(format!("command {command:?} failed ({}): {}", output.status, combined.trim()));
    }
    Ok(combined)
}

/// Replace `$VAR` and `${VAR}` with values from the environment
fn expand_env(input: &str) -> String {
    ENV_REF
        .replace_all(input, |caps: &Captures| {
            let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or("");
            std::env::var(name).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strategy(name: &str, source: Source, destination: Destination) -> CredentialStrategy {
        CredentialStrategy {
            name: name.to_string(),
            source,
            destination,
        }
    }

    fn env_dest(var: &str) -> Destination {
        Destination {
            env: Some(var.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_load_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("creds.yaml");
        std::fs::write(
            &path,
            r#"
name: production
credentials:
  - name: kubeconfig
    source:
      path: /tmp/kubeconfig
    destination:
      path: /root/.kube/config
  - name: token
    source:
      value: abc
    destination:
      env: TOKEN
"#,
        )
        .unwrap();

        let set = CredentialSet::load(&path).unwrap();
        assert_eq!(set.name, "production");
        assert_eq!(set.credentials.len(), 2);
        assert_eq!(set.credentials[0].source.path.as_deref(), Some("/tmp/kubeconfig"));
        assert_eq!(set.credentials[1].destination.env.as_deref(), Some("TOKEN"));
    }

    #[test]
    #[cfg(unix)]
    fn test_command_wins_over_path() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("secret.txt");
        std::fs::write(&file, "from-file").unwrap();

        let set = CredentialSet {
            name: "test".to_string(),
            credentials: vec![strategy(
                "both",
                Source {
                    command: Some("echo from-command".to_string()),
                    path: Some(file.display().to_string()),
                    ..Default::default()
                },
                env_dest("BOTH"),
            )],
        };

        let resolved = set.resolve().unwrap();
        assert_eq!(resolved.get("both").unwrap().value, "from-command\n");
    }

    #[test]
    fn test_path_source_expands_env() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("token"), "s3cret").unwrap();
        // SAFETY: variable name is unique to this test
        unsafe { std::env::set_var("DUFFLE_TEST_CRED_DIR", tmp.path()) };

        let set = CredentialSet {
            name: "test".to_string(),
            credentials: vec![strategy(
                "token",
                Source {
                    path: Some("${DUFFLE_TEST_CRED_DIR}/token".to_string()),
                    ..Default::default()
                },
                env_dest("TOKEN"),
            )],
        };

        assert_eq!(set.resolve().unwrap().get("token").unwrap().value, "s3cret");
    }

    #[test]
    fn test_env_falls_back_to_value() {
        let set = CredentialSet {
            name: "test".to_string(),
            credentials: vec![strategy(
                "token",
                Source {
                    env: Some("DUFFLE_TEST_SURELY_UNSET_VAR".to_string()),
                    value: Some("fallback".to_string()),
                    ..Default::default()
                },
                env_dest("TOKEN"),
            )],
        };

        assert_eq!(set.resolve().unwrap().get("token").unwrap().value, "fallback");
    }

    #[test]
    fn test_env_source_reads_variable() {
        // SAFETY: variable name is unique to this test
        unsafe { std::env::set_var("DUFFLE_TEST_ENV_SOURCE", "from-env") };
        let set = CredentialSet {
            name: "test".to_string(),
            credentials: vec![strategy(
                "token",
                Source {
                    env: Some("DUFFLE_TEST_ENV_SOURCE".to_string()),
                    value: Some("fallback".to_string()),
                    ..Default::default()
                },
                env_dest("TOKEN"),
            )],
        };

        assert_eq!(set.resolve().unwrap().get("token").unwrap().value, "from-env");
    }

    #[test]
    fn test_missing_file_names_credential() {
        let set = CredentialSet {
            name: "test".to_string(),
            credentials: vec![strategy(
                "kubeconfig",
                Source {
                    path: Some("/nonexistent/duffle/kubeconfig".to_string()),
                    ..Default::default()
                },
                env_dest("KUBECONFIG"),
            )],
        };

        let err = set.resolve().unwrap_err();
        assert!(err.to_string().starts_with("credential \"kubeconfig\""));
    }

    #[test]
    #[cfg(unix)]
    fn test_failing_command_is_error() {
        let set = CredentialSet {
            name: "test".to_string(),
            credentials: vec![strategy(
                "bad",
                Source {
                    command: Some("false".to_string()),
                    ..Default::default()
                },
                env_dest("BAD"),
            )],
        };
        assert!(set.resolve().is_err());
    }

    #[test]
    fn test_flatten() {
        let mut set = Set::new();
        set.insert(
            "a",
            Destination {
                env: Some("A".to_string()),
                path: Some("/a".to_string()),
                value: "1".to_string(),
            },
        );
        set.insert(
            "b",
            Destination {
                env: Some("B".to_string()),
                value: "2".to_string(),
                ..Default::default()
            },
        );

        let (env, files) = set.flatten();
        assert_eq!(env.len(), 2);
        assert_eq!(env["A"], "1");
        assert_eq!(files.len(), 1);
        assert_eq!(files["/a"], "1");
    }

    #[test]
    fn test_validate() {
        let mut required = BTreeMap::new();
        required.insert(
            "kubeconfig".to_string(),
            CredentialLocation {
                path: Some("/root/.kube/config".to_string()),
                ..Default::default()
            },
        );

        let mut set = Set::new();
        set.insert("unused", env_dest("UNUSED"));
        let err = set.validate(&required).unwrap_err();
        assert_eq!(err.to_string(), "bundle requires credential for kubeconfig");

        set.insert(
            "kc",
            Destination {
                path: Some("/root/.kube/config".to_string()),
                ..Default::default()
            },
        );
        assert!(set.validate(&required).is_ok());
    }

    #[test]
    fn test_validate_does_not_match_empty_locations() {
        let mut required = BTreeMap::new();
        required.insert(
            "token".to_string(),
            CredentialLocation {
                env: Some("TOKEN".to_string()),
                ..Default::default()
            },
        );

        // Neither side has a path; that must not count as a match
        let mut set = Set::new();
        set.insert("other", env_dest("OTHER"));
        assert!(set.validate(&required).is_err());
    }
}
