//! CLI commands

pub mod claims;
pub mod credentials;
pub mod drivers;
pub mod install;
pub mod run;
pub mod status;
pub mod uninstall;
pub mod upgrade;

use clap::{Args, ValueEnum};
use console::style;
use duffle_action::{Lifecycle, Request};
use duffle_core::{Bundle, CredentialSet, Set};
use duffle_driver::{Driver, configure_from, lookup};
use duffle_store::{ClaimStore, ConfigMapStore, FileStore, MongoStore};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{CliError, Result};
use crate::home::DuffleHome;

/// Claim storage backends selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    File,
    Configmap,
    Mongodb,
}

/// Settings shared by every command
#[derive(Debug, Clone)]
pub struct Context {
    pub home: DuffleHome,
    pub storage: StorageKind,
    pub storage_url: Option<String>,
    pub namespace: String,
}

impl Context {
    /// Open the configured claim store
    pub async fn store(&self) -> Result<Arc<dyn ClaimStore>> {
        let store: Arc<dyn ClaimStore> = match self.storage {
            StorageKind::File => Arc::new(FileStore::new(self.home.claims())),
            StorageKind::Configmap => Arc::new(ConfigMapStore::new(&self.namespace).await?),
            StorageKind::Mongodb => {
                let url = self.storage_url.as_deref().ok_or_else(|| {
                    CliError::usage("--storage mongodb requires --storage-url (or DUFFLE_STORAGE_URL)")
                })?;
                Arc::new(MongoStore::connect(url).await?)
            }
        };
        tracing::debug!(storage = ?self.storage, "opened claim store");
        Ok(store)
    }
}

/// Options shared by commands that run an invocation image
#[derive(Debug, Clone, Args)]
pub struct ActionArgs {
    /// Driver that runs the invocation image
    #[arg(short, long, default_value = "docker")]
    pub driver: String,

    /// Credential set name or path (repeatable)
    #[arg(short, long = "credentials")]
    pub credentials: Vec<String>,

    /// YAML or JSON file of parameter values
    #[arg(short, long)]
    pub parameters: Option<PathBuf>,

    /// Set a parameter on the command line (NAME=VALUE, repeatable)
    #[arg(long = "set")]
    pub set: Vec<String>,
}

impl ActionArgs {
    /// Whether any parameter source was given
    fn has_parameters(&self) -> bool {
        self.parameters.is_some() || !self.set.is_empty()
    }
}

/// Look up and configure the driver before anything else happens
///
/// Each key the driver's `config()` recognizes is read from the process
/// environment.
pub fn prepare_driver(name: &str) -> Result<Arc<dyn Driver>> {
    let mut driver = lookup(name)?;
    configure_from(driver.as_mut(), |key| std::env::var(key).ok());
    Ok(Arc::from(driver))
}

/// Resolve and merge credential sets; later sets win on name collisions
pub fn load_credentials(home: &DuffleHome, names: &[String]) -> Result<Set> {
    let mut merged = Set::new();
    for name in names {
        let path = home.credential_set(name);
        let set = CredentialSet::load(&path).map_err(|e| {
            CliError::credentials(format!("cannot load credential set {}: {e}", path.display()))
        })?;
        tracing::debug!(set = %set.name, path = %path.display(), "resolving credentials");
        merged.merge(set.resolve()?);
    }
    Ok(merged)
}

/// Parameter values from `--parameters` and `--set`
///
/// `--set` values are converted to the type the bundle declares for the
/// parameter and override values from the file.
pub fn load_parameters(args: &ActionArgs, bundle: &Bundle) -> Result<BTreeMap<String, Value>> {
    let mut values: BTreeMap<String, Value> = match &args.parameters {
        Some(path) => {
            let data = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&data).map_err(|e| {
                CliError::validation(format!("cannot parse parameters file {}: {e}", path.display()))
            })?
        }
        None => BTreeMap::new(),
    };

    for entry in &args.set {
        let (name, raw) = entry
            .split_once('=')
            .ok_or_else(|| CliError::usage(format!("--set {entry:?}: expected NAME=VALUE")))?;
        let definition = bundle.parameters.get(name).ok_or_else(|| {
            CliError::validation(format!("parameter {name:?} is not defined in the bundle"))
        })?;
        let value = definition
            .convert_value(raw)
            .map_err(|reason| CliError::validation(format!("can't use {raw} as value of {name}: {reason}")))?;
        values.insert(name.to_string(), value);
    }
    Ok(values)
}

/// Build the request for a run against `name`
///
/// Parameters are only replaced when the user passed some; they are layered
/// over the values stored in an existing claim. Without any, the claim keeps
/// the values it was installed with.
pub async fn build_request(
    ctx: &Context,
    store: &dyn ClaimStore,
    name: &str,
    bundle: Option<Bundle>,
    args: &ActionArgs,
) -> Result<Request> {
    let mut request = Request::new(name).with_credentials(load_credentials(&ctx.home, &args.credentials)?);
    if args.has_parameters() {
        let existing = match store.read(name).await {
            Ok(claim) => Some(claim),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        let definitions = bundle
            .as_ref()
            .or_else(|| existing.as_ref().and_then(|c| c.bundle.as_ref()))
            .ok_or_else(|| CliError::NotFound {
                name: name.to_string(),
            })?;
        let overrides = load_parameters(args, definitions)?;

        let mut values = existing.map(|c| c.parameters).unwrap_or_default();
        values.extend(overrides);
        request = request.with_parameters(values);
    }
    if let Some(bundle) = bundle {
        request = request.with_bundle(bundle);
    }
    Ok(request)
}

pub fn load_bundle(path: &Path) -> Result<Bundle> {
    Bundle::load(path)
        .map_err(|e| CliError::validation(format!("cannot load bundle {}: {e}", path.display())))
}

/// Driver plus store, ready to run actions
pub async fn lifecycle(ctx: &Context, driver: Arc<dyn Driver>) -> Result<Lifecycle> {
    Ok(Lifecycle::new(ctx.store().await?, driver))
}

/// Everything up to the run: driver, lifecycle and request
///
/// The driver is looked up first so an unknown driver fails before the
/// store or any credential is touched.
pub async fn prepare(
    ctx: &Context,
    name: &str,
    bundle_file: Option<&Path>,
    args: &ActionArgs,
) -> Result<(Lifecycle, Request)> {
    let driver = prepare_driver(&args.driver)?;
    let bundle = bundle_file.map(load_bundle).transpose()?;
    let lifecycle = lifecycle(ctx, driver).await?;
    let request = build_request(ctx, lifecycle.store(), name, bundle, args).await?;
    Ok((lifecycle, request))
}

pub(crate) fn success(message: impl std::fmt::Display) {
    println!("{} {}", style("✓").green().bold(), message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn bundle() -> Bundle {
        serde_json::from_value(json!({
            "name": "foo",
            "version": "1.0.0",
            "invocationImages": [{ "imageType": "docker", "image": "foo:1.0.0" }],
            "parameters": {
                "replicas": { "type": "int", "defaultValue": 1 },
                "debug": { "type": "bool" },
                "region": { "type": "string" }
            }
        }))
        .unwrap()
    }

    fn args() -> ActionArgs {
        ActionArgs {
            driver: "debug".into(),
            credentials: vec![],
            parameters: None,
            set: vec![],
        }
    }

    #[test]
    fn test_set_values_use_declared_types() {
        let mut args = args();
        args.set = vec!["replicas=3".into(), "debug=true".into(), "region=eu=west".into()];

        let values = load_parameters(&args, &bundle()).unwrap();
        assert_eq!(values["replicas"], json!(3));
        assert_eq!(values["debug"], json!(true));
        assert_eq!(values["region"], json!("eu=west"));
    }

    #[test]
    fn test_set_rejects_unknown_and_malformed() {
        let mut args = args();
        args.set = vec!["nope=1".into()];
        assert!(load_parameters(&args, &bundle()).is_err());

        args.set = vec!["replicas".into()];
        let err = load_parameters(&args, &bundle()).unwrap_err();
        assert!(matches!(err, CliError::Usage { .. }));
    }

    #[test]
    fn test_parameters_file_then_set() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("params.yaml");
        std::fs::write(&path, "replicas: 2\nregion: us\n").unwrap();

        let mut args = args();
        args.parameters = Some(path);
        args.set = vec!["replicas=5".into()];

        let values = load_parameters(&args, &bundle()).unwrap();
        assert_eq!(values["replicas"], json!(5));
        assert_eq!(values["region"], json!("us"));
    }

    #[test]
    fn test_load_named_credentials() {
        let dir = TempDir::new().unwrap();
        let home = DuffleHome::new(dir.path());
        std::fs::create_dir_all(home.credentials()).unwrap();
        std::fs::write(
            home.credentials().join("dev.yaml"),
            "name: dev\ncredentials:\n  - name: token\n    source:\n      value: s3cret\n    destination:\n      env: TOKEN\n",
        )
        .unwrap();

        let set = load_credentials(&home, &["dev".to_string()]).unwrap();
        assert_eq!(set.get("token").unwrap().value, "s3cret");

        let err = load_credentials(&home, &["missing".to_string()]).unwrap_err();
        assert!(matches!(err, CliError::Credentials { .. }));
    }

    #[test]
    fn test_unknown_driver() {
        let err = prepare_driver("definitely-not-a-driver-xyz").err().unwrap();
        assert!(matches!(err, CliError::Driver { .. }));
    }
}
