//! Lifecycle facade: executors plus claim persistence
//!
//! Whether and how a claim is saved after a run is decided in one place,
//! [`persistence_for`], and carried out by [`persist`]. A claim is saved even
//! when the driver fails, since the run may have provisioned resources that
//! still need cleaning up.

use duffle_core::{
    ACTION_INSTALL, ACTION_STATUS, ACTION_UNINSTALL, ACTION_UPGRADE, Bundle, Claim, Set,
};
use duffle_driver::{Driver, Output};
use duffle_store::ClaimStore;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ActionError, Result};
use crate::executor::{Executor, Install, RunCustom, StatusCheck, Uninstall, Upgrade};
use crate::operation::resolved_parameters;

/// What happens to the claim once an action has run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Save the claim whatever the outcome
    Store,
    /// Delete the claim on success, save it on failure
    DeleteOnSuccess,
    /// Leave the store untouched
    Skip,
}

/// Persistence policy of an action
pub fn persistence_for(action: &str, bundle: Option<&Bundle>) -> Persistence {
    match action {
        ACTION_INSTALL | ACTION_UPGRADE => Persistence::Store,
        ACTION_UNINSTALL => Persistence::DeleteOnSuccess,
        ACTION_STATUS => Persistence::Skip,
        custom => match bundle.and_then(|b| b.actions.get(custom)) {
            Some(declared) if declared.records_revision() => Persistence::Store,
            _ => Persistence::Skip,
        },
    }
}

/// Apply `policy` to `claim` given the outcome of its run
///
/// Errors raised before the driver ran are returned untouched: nothing ran,
/// so there is nothing to record. When both the run and the save fail, the
/// driver error stays primary.
pub async fn persist(
    store: &dyn ClaimStore,
    claim: &Claim,
    outcome: Result<()>,
    policy: Persistence,
) -> Result<()> {
    match outcome {
        Ok(()) => {
            match policy {
                Persistence::Store => store.store(claim).await?,
                Persistence::DeleteOnSuccess => store.delete(&claim.name).await?,
                Persistence::Skip => {}
            }
            Ok(())
        }
        Err(ActionError::Driver(driver)) if policy != Persistence::Skip => {
            match store.store(claim).await {
                Ok(()) => Err(ActionError::Driver(driver)),
                Err(persistence) => {
                    tracing::warn!(
                        claim = %claim.name,
                        error = %persistence,
                        "failed to save claim after failed run"
                    );
                    Err(ActionError::DriverAndPersistence {
                        driver,
                        persistence,
                    })
                }
            }
        }
        Err(e) => Err(e),
    }
}

/// Inputs to one lifecycle call
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Installation (claim) name
    pub name: String,

    /// Bundle to run; replaces the claim's bundle when given
    pub bundle: Option<Bundle>,

    /// Parameter values; replaces the claim's parameters when given
    pub parameters: Option<BTreeMap<String, Value>>,

    /// Resolved credentials
    pub credentials: Set,
}

impl Request {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_bundle(mut self, bundle: Bundle) -> Self {
        self.bundle = Some(bundle);
        self
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, Value>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_credentials(mut self, credentials: Set) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Runs actions with an explicit claim store and driver
pub struct Lifecycle {
    store: Arc<dyn ClaimStore>,
    driver: Arc<dyn Driver>,
    out: Output,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn ClaimStore>, driver: Arc<dyn Driver>) -> Self {
        Self {
            store,
            driver,
            out: Output::stdout(),
        }
    }

    pub fn with_output(mut self, out: Output) -> Self {
        self.out = out;
        self
    }

    pub fn store(&self) -> &dyn ClaimStore {
        self.store.as_ref()
    }

    /// Install a bundle under a new claim
    ///
    /// Existing claims with the same name are overwritten; callers that must
    /// not clobber an installation check [`ClaimStore::exists`] first. Retrying
    /// a failed install keeps the original `created` time.
    pub async fn install(&self, request: Request) -> Result<Claim> {
        let bundle = request.bundle.ok_or_else(|| ActionError::MissingBundle {
            name: request.name.clone(),
        })?;
        bundle.validate()?;

        let mut claim = Claim::new(&request.name)?;
        match self.store.read(&claim.name).await {
            Ok(previous) if previous.is_failed_install() => {
                tracing::info!(claim = %claim.name, "retrying failed install");
                claim.created = previous.created;
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        claim.parameters = resolved_parameters(&bundle, &request.parameters.unwrap_or_default())?;
        claim.bundle = Some(bundle);

        let install = Install::new(self.driver.clone()).with_output(self.out.clone());
        self.execute(&install, claim, &request.credentials).await
    }

    /// Upgrade an existing installation
    pub async fn upgrade(&self, request: Request) -> Result<Claim> {
        let (claim, creds) = self.load(request).await?;
        let upgrade = Upgrade::new(self.driver.clone()).with_output(self.out.clone());
        self.execute(&upgrade, claim, &creds).await
    }

    /// Uninstall an installation; its claim is deleted only if the run succeeds
    pub async fn uninstall(&self, request: Request) -> Result<Claim> {
        let (claim, creds) = self.load(request).await?;
        let uninstall = Uninstall::new(self.driver.clone()).with_output(self.out.clone());
        self.execute(&uninstall, claim, &creds).await
    }

    /// Query live status; the claim is never written
    pub async fn status(&self, request: Request) -> Result<()> {
        let (claim, creds) = self.load(request).await?;
        let status = StatusCheck::new(self.driver.clone()).with_output(self.out.clone());
        self.execute(&status, claim, &creds).await.map(|_| ())
    }

    /// Run a custom action declared by the bundle
    ///
    /// With a bundle in the request and no stored claim, a fresh claim is
    /// used, so stateless actions can run before anything is installed.
    pub async fn run_custom(&self, action: &str, request: Request) -> Result<Claim> {
        let custom = RunCustom::new(action, self.driver.clone()).with_output(self.out.clone());

        let fresh = request.bundle.is_some() && !self.store.exists(&request.name).await?;
        let (claim, creds) = match request {
            Request {
                name,
                bundle: Some(bundle),
                parameters,
                credentials,
            } if fresh => {
                bundle.validate()?;
                let mut claim = Claim::new(&name)?;
                claim.parameters = resolved_parameters(&bundle, &parameters.unwrap_or_default())?;
                claim.bundle = Some(bundle);
                (claim, credentials)
            }
            request => self.load(request).await?,
        };
        self.execute(&custom, claim, &creds).await
    }

    /// Read the stored claim and apply the request's overrides
    async fn load(&self, request: Request) -> Result<(Claim, Set)> {
        let mut claim = self.store.read(&request.name).await?;

        if let Some(bundle) = request.bundle {
            bundle.validate()?;
            claim.bundle = Some(bundle);
        }
        let bundle = claim.bundle.as_ref().ok_or_else(|| ActionError::MissingBundle {
            name: claim.name.clone(),
        })?;
        let supplied = request.parameters.unwrap_or_else(|| claim.parameters.clone());
        claim.parameters = resolved_parameters(bundle, &supplied)?;

        Ok((claim, request.credentials))
    }

    async fn execute(&self, executor: &dyn Executor, mut claim: Claim, creds: &Set) -> Result<Claim> {
        let policy = persistence_for(executor.action(), claim.bundle.as_ref());
        tracing::debug!(claim = %claim.name, action = executor.action(), ?policy, "starting action");

        let outcome = executor.run(&mut claim, creds).await;
        persist(self.store.as_ref(), &claim, outcome, policy).await?;
        Ok(claim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SpyDriver, sample_bundle};
    use duffle_core::{Destination, Status};
    use duffle_driver::DebugDriver;
    use duffle_store::MemoryClaimStore;
    use serde_json::json;

    fn creds() -> Set {
        let mut set = Set::new();
        set.insert(
            "kubeconfig",
            Destination {
                path: Some("/root/.kube/config".to_string()),
                env: None,
                value: "config".to_string(),
            },
        );
        set
    }

    fn request(name: &str) -> Request {
        Request::new(name)
            .with_bundle(sample_bundle())
            .with_parameters(BTreeMap::from([("region".to_string(), json!("eu"))]))
            .with_credentials(creds())
    }

    fn lifecycle(store: &MemoryClaimStore, driver: SpyDriver) -> Lifecycle {
        Lifecycle::new(Arc::new(store.clone()), Arc::new(driver)).with_output(Output::capture().0)
    }

    async fn installed(store: &MemoryClaimStore) -> Claim {
        let claim = lifecycle(store, SpyDriver::new())
            .install(request("myrelease"))
            .await
            .unwrap();
        store.reset_counts();
        claim
    }

    #[test]
    fn test_persistence_policy() {
        let bundle = sample_bundle();
        assert_eq!(persistence_for("install", None), Persistence::Store);
        assert_eq!(persistence_for("upgrade", None), Persistence::Store);
        assert_eq!(persistence_for("uninstall", None), Persistence::DeleteOnSuccess);
        assert_eq!(persistence_for("status", Some(&bundle)), Persistence::Skip);
        assert_eq!(persistence_for("migrate", Some(&bundle)), Persistence::Store);
        assert_eq!(persistence_for("logs", Some(&bundle)), Persistence::Skip);
        assert_eq!(persistence_for("dry-run", Some(&bundle)), Persistence::Skip);
        assert_eq!(persistence_for("undeclared", Some(&bundle)), Persistence::Skip);
    }

    #[tokio::test]
    async fn test_install_with_debug_driver() {
        let store = MemoryClaimStore::new();
        let (out, capture) = Output::capture();
        let lifecycle = Lifecycle::new(Arc::new(store.clone()), Arc::new(DebugDriver::new())).with_output(out);

        let claim = lifecycle.install(request("myrelease")).await.unwrap();

        assert_eq!(claim.name, "myrelease");
        assert_eq!(claim.bundle.as_ref().unwrap().name, "foo");
        assert_eq!(claim.result.action, "install");
        assert_eq!(claim.result.status, Status::Success);
        assert_eq!(claim.parameters["replicas"], json!(1));
        assert_eq!(store.peek("myrelease"), Some(claim));
        assert!(capture.contents().contains("\"installation_name\": \"myrelease\""));
    }

    #[tokio::test]
    async fn test_failed_runs_still_persist() {
        let store = MemoryClaimStore::new();
        let failing = lifecycle(&store, SpyDriver::failing());

        let err = failing.install(request("myrelease")).await.unwrap_err();
        assert!(matches!(err, ActionError::Driver(_)));
        let saved = store.peek("myrelease").unwrap();
        assert_eq!(saved.result.status, Status::Failure);
        assert!(!saved.result.message.is_empty());

        let err = failing.upgrade(Request::new("myrelease").with_credentials(creds())).await.unwrap_err();
        assert!(matches!(err, ActionError::Driver(_)));
        assert_eq!(store.peek("myrelease").unwrap().result.action, "upgrade");

        let err = failing.uninstall(Request::new("myrelease").with_credentials(creds())).await.unwrap_err();
        assert!(matches!(err, ActionError::Driver(_)));
        let saved = store.peek("myrelease").unwrap();
        assert_eq!(saved.result.action, "uninstall");
        assert_eq!(saved.result.status, Status::Failure);
    }

    #[tokio::test]
    async fn test_uninstall_deletes_claim() {
        let store = MemoryClaimStore::new();
        installed(&store).await;

        let claim = lifecycle(&store, SpyDriver::new())
            .uninstall(Request::new("myrelease").with_credentials(creds()))
            .await
            .unwrap();
        assert_eq!(claim.result.action, "uninstall");
        assert!(store.peek("myrelease").is_none());
        assert_eq!(store.operation_counts().deletes, 1);
    }

    #[tokio::test]
    async fn test_upgrade_replaces_parameters() {
        let store = MemoryClaimStore::new();
        let before = installed(&store).await;

        let request = Request::new("myrelease")
            .with_parameters(BTreeMap::from([
                ("region".to_string(), json!("us")),
                ("replicas".to_string(), json!(4)),
            ]))
            .with_credentials(creds());
        let claim = lifecycle(&store, SpyDriver::new()).upgrade(request).await.unwrap();

        assert_eq!(claim.parameters["replicas"], json!(4));
        assert_eq!(claim.created, before.created);
        assert_ne!(claim.revision, before.revision);
        assert_eq!(store.peek("myrelease"), Some(claim));
    }

    #[tokio::test]
    async fn test_upgrade_missing_claim() {
        let store = MemoryClaimStore::new();
        let spy = SpyDriver::new();
        let err = lifecycle(&store, spy.clone())
            .upgrade(Request::new("ghost").with_credentials(creds()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(spy.runs().is_empty());
    }

    #[tokio::test]
    async fn test_status_does_not_store() {
        let store = MemoryClaimStore::new();
        let before = installed(&store).await;

        lifecycle(&store, SpyDriver::new())
            .status(Request::new("myrelease").with_credentials(creds()))
            .await
            .unwrap();
        assert_eq!(store.operation_counts().stores, 0);
        assert_eq!(store.peek("myrelease"), Some(before));
    }

    #[tokio::test]
    async fn test_stateless_custom_action_keeps_revision() {
        let store = MemoryClaimStore::new();
        let before = installed(&store).await;
        let spy = SpyDriver::new();

        lifecycle(&store, spy.clone())
            .run_custom("logs", Request::new("myrelease").with_credentials(creds()))
            .await
            .unwrap();

        assert_eq!(spy.runs().len(), 1);
        assert_eq!(store.operation_counts().stores, 0);
        assert_eq!(store.peek("myrelease").unwrap().revision, before.revision);
    }

    #[tokio::test]
    async fn test_modifying_custom_action_stores() {
        let store = MemoryClaimStore::new();
        let before = installed(&store).await;

        let claim = lifecycle(&store, SpyDriver::new())
            .run_custom("migrate", Request::new("myrelease").with_credentials(creds()))
            .await
            .unwrap();

        assert_eq!(store.operation_counts().stores, 1);
        assert_ne!(claim.revision, before.revision);
        assert_eq!(store.peek("myrelease").unwrap().result.action, "migrate");
    }

    #[tokio::test]
    async fn test_custom_guards_touch_nothing() {
        let store = MemoryClaimStore::new();
        installed(&store).await;
        let spy = SpyDriver::new();
        let lifecycle = lifecycle(&store, spy.clone());

        let err = lifecycle
            .run_custom("install", Request::new("myrelease").with_credentials(creds()))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::ReservedAction { .. }));

        let err = lifecycle
            .run_custom("explode", Request::new("myrelease").with_credentials(creds()))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::UnknownAction { .. }));

        assert!(spy.runs().is_empty());
        assert_eq!(store.operation_counts().stores, 0);
    }

    #[tokio::test]
    async fn test_stateless_action_without_claim() {
        let store = MemoryClaimStore::new();
        let spy = SpyDriver::new();

        lifecycle(&store, spy.clone())
            .run_custom("logs", request("fresh"))
            .await
            .unwrap();
        assert_eq!(spy.runs().len(), 1);
        assert!(store.peek("fresh").is_none());
    }

    #[tokio::test]
    async fn test_configuration_errors_do_not_persist() {
        let store = MemoryClaimStore::new();
        let spy = SpyDriver::refusing(&["docker"]);

        let err = lifecycle(&store, spy.clone())
            .install(request("myrelease"))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::NoCompatibleInvocationImage));

        let err = lifecycle(&store, SpyDriver::new())
            .install(request("myrelease").with_credentials(Set::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Credentials(_)));

        let counts = store.operation_counts();
        assert_eq!((counts.stores, counts.deletes), (0, 0));
        assert!(store.peek("myrelease").is_none());
        assert!(spy.runs().is_empty());
    }

    #[tokio::test]
    async fn test_failed_install_can_be_retried() {
        let store = MemoryClaimStore::new();
        lifecycle(&store, SpyDriver::failing())
            .install(request("myrelease"))
            .await
            .unwrap_err();
        let failed = store.peek("myrelease").unwrap();
        assert!(failed.is_failed_install());

        let retried = lifecycle(&store, SpyDriver::new())
            .install(request("myrelease"))
            .await
            .unwrap();
        assert_eq!(retried.result.status, Status::Success);
        assert_eq!(retried.created, failed.created);
        assert_ne!(retried.revision, failed.revision);
        assert_eq!(store.peek("myrelease"), Some(retried));
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let store = MemoryClaimStore::new();
        let err = lifecycle(&store, SpyDriver::new())
            .install(request("my release"))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Core(_)));
    }

    #[tokio::test]
    async fn test_store_failure_after_success() {
        let store = MemoryClaimStore::failing();
        let err = lifecycle(&store, SpyDriver::new())
            .install(request("myrelease"))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Persistence(_)));
        assert!(!err.ran());
    }

    #[tokio::test]
    async fn test_both_failures_are_reported() {
        let store = MemoryClaimStore::failing();
        let err = lifecycle(&store, SpyDriver::failing())
            .install(request("myrelease"))
            .await
            .unwrap_err();

        let ActionError::DriverAndPersistence { driver, persistence } = &err else {
            panic!("unexpected error: {err}");
        };
        assert!(err.to_string().starts_with(&driver.to_string()));
        assert!(err.to_string().contains(&persistence.to_string()));
    }
}
