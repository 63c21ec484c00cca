//! Azure Container Instances driver
//!
//! Runs the invocation image as a single-container group through the Azure
//! Resource Manager REST API, polls until the container stops and copies its
//! log to the operation output.

mod auth;
mod client;

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{DriverError, Result};
use crate::{Configurable, Driver, Operation, flag, is_container_image};
use auth::Ambient;
use client::ArmClient;

const USER_AGENT: &str = "Duffle ACI Driver";

/// The only file the driver tolerates, and only when empty
const IMAGE_MAP_PATH: &str = "/cnab/app/image-map.json";

const ROLE_ATTEMPTS: usize = 5;

/// Service endpoints; overridable for tests and sovereign clouds
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub management: String,
    pub authority: String,
    pub resource: String,
    pub imds: String,
    pub cloud_shell: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            management: "https://management.azure.com".to_string(),
            authority: "https://login.microsoftonline.com".to_string(),
            resource: "https://management.azure.com/".to_string(),
            imds: "http://169.254.169.254/metadata/identity/oauth2/token".to_string(),
            cloud_shell: "http://localhost:50342/oauth2/token".to_string(),
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct AciSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub tenant_id: Option<String>,
    pub subscription_id: Option<String>,
    pub app_id: Option<String>,
    pub resource_group: Option<String>,
    pub location: Option<String>,
    pub name: Option<String>,
    pub do_not_delete: bool,
    pub msi_type: Option<String>,
    pub system_msi_role: Option<String>,
    pub system_msi_scope: Option<String>,
    pub user_msi_resource_id: Option<String>,
    pub verbose: bool,
    pub simulate: bool,
}

/// Managed identity attached to the container group
#[derive(Debug, PartialEq)]
enum Identity {
    None,
    System { scope: String, role: String },
    User { id: String },
}

impl Identity {
    fn to_json(&self) -> Option<Value> {
        match self {
            Identity::None => None,
            Identity::System { .. } => Some(json!({ "type": "SystemAssigned" })),
            Identity::User { id } => Some(json!({
                "type": "UserAssigned",
                "userAssignedIdentities": { id.as_str(): {} }
            })),
        }
    }
}

/// Runs Docker and OCI invocation images in Azure Container Instances
pub struct AciDriver {
    settings: AciSettings,
    endpoints: Endpoints,
    poll_interval: Duration,
    role_retry_delay: Duration,
}

impl AciDriver {
    pub fn new() -> Self {
        Self {
            settings: AciSettings::default(),
            endpoints: Endpoints::default(),
            poll_interval: Duration::from_secs(5),
            role_retry_delay: Duration::from_secs(20),
        }
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_role_retry_delay(mut self, delay: Duration) -> Self {
        self.role_retry_delay = delay;
        self
    }

    fn note(&self, message: &str) {
        if self.settings.verbose {
            tracing::info!("{message}");
        } else {
            tracing::debug!("{message}");
        }
    }

    async fn resolve_identity(&self, arm: &ArmClient, group: &str) -> Result<Identity> {
        let Some(kind) = &self.settings.msi_type else {
            return Ok(Identity::None);
        };

        match kind.to_lowercase().as_str() {
            "system" => Ok(Identity::System {
                scope: self
                    .settings
                    .system_msi_scope
                    .clone()
                    .unwrap_or_else(|| arm.group_scope(group)),
                role: self
                    .settings
                    .system_msi_role
                    .clone()
                    .unwrap_or_else(|| "Contributor".to_string()),
            }),
            "user" => {
                let resource_id = self.settings.user_msi_resource_id.as_deref().ok_or_else(|| {
                    DriverError::InvalidConfig(
                        "ACI_USER_MSI_RESOURCE_ID is required when ACI_MSI_TYPE is user".into(),
                    )
                })?;
                if !resource_id.starts_with("/subscriptions/") {
                    return Err(DriverError::InvalidConfig(format!(
                        "ACI_USER_MSI_RESOURCE_ID is not a resource ID: {resource_id}"
                    )));
                }
                Ok(Identity::User {
                    id: arm.user_identity_id(resource_id).await?,
                })
            }
            other => Err(DriverError::InvalidConfig(format!(
                "ACI_MSI_TYPE has unknown value: {other}"
            ))),
        }
    }

    /// Grant a system identity its role, retrying while the principal propagates
    async fn assign_system_role(&self, arm: &ArmClient, principal: &str, scope: &str, role: &str) -> Result<()> {
        self.note(&format!("assigning role {role} at scope {scope}"));
        let definition = arm.role_definition_id(scope, role).await?.ok_or_else(|| {
            DriverError::Azure(format!("role definition for role {role} not found for scope {scope}"))
        })?;

        let mut last = None;
        for attempt in 1..=ROLE_ATTEMPTS {
            match arm.assign_role(scope, &definition, principal).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "role assignment failed");
                    last = Some(e);
                    if attempt < ROLE_ATTEMPTS {
                        tokio::time::sleep(self.role_retry_delay).await;
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| DriverError::Azure("role assignment failed".into())))
    }

    async fn run_in_azure(&self, arm: &ArmClient, op: &Operation) -> Result<()> {
        let mut location = self.settings.location.clone();
        if let Some(wanted) = &location {
            let available = arm.container_locations().await?;
            if !location_is_available(wanted, &available) {
                return Err(DriverError::InvalidConfig(format!(
                    "ACI location is invalid: {wanted}"
                )));
            }
        }

        let (group, created) = match &self.settings.resource_group {
            Some(group) => {
                let existing = arm.resource_group_location(group).await?;
                location = location.or(existing);
                (group.clone(), false)
            }
            None => {
                let group = uuid::Uuid::new_v4().to_string();
                let region = location.as_deref().unwrap_or_default();
                self.note(&format!("creating resource group {group}"));
                arm.create_resource_group(&group, region).await?;
                (group, true)
            }
        };
        let location = location.unwrap_or_default();

        let result = self.run_container(arm, &group, &location, op).await;

        if created && !self.settings.do_not_delete {
            self.note(&format!("deleting resource group {group}"));
            if let Err(e) = arm.delete_resource_group(&group).await {
                report_cleanup(op, "resource group", &group, &e);
            }
        }
        result
    }

    async fn run_container(&self, arm: &ArmClient, group: &str, location: &str, op: &Operation) -> Result<()> {
        let name = self
            .settings
            .name
            .clone()
            .unwrap_or_else(|| format!("duffle-{}", uuid::Uuid::new_v4()));
        let identity = self.resolve_identity(arm, group).await?;

        if let Identity::System { scope, role } = &identity {
            self.note("creating container group to obtain a system identity");
            let bootstrap = container_group(&name, location, "alpine:latest", Vec::new(), identity.to_json());
            let created = arm
                .create_container_group(group, &name, &bootstrap, self.poll_interval)
                .await?;
            let principal = created
                .pointer("/identity/principalId")
                .and_then(Value::as_str)
                .ok_or_else(|| DriverError::Azure("container group has no system identity".into()))?;
            self.assign_system_role(arm, principal, scope, role).await?;
        }

        self.note(&format!("creating container group {name} for action {}", op.action));
        let body = container_group(&name, location, &op.image, secure_env(&op.environment), identity.to_json());
        arm.create_container_group(group, &name, &body, self.poll_interval)
            .await?;

        let result = self.follow(arm, group, &name, op).await;

        if !self.settings.do_not_delete {
            self.note(&format!("deleting container group {name}"));
            if let Err(e) = arm.delete_container_group(group, &name).await {
                report_cleanup(op, "container group", &name, &e);
            }
        }
        result
    }

    /// Poll until the container stops, printing new log lines as they appear
    async fn follow(&self, arm: &ArmClient, group: &str, name: &str, op: &Operation) -> Result<()> {
        let mut printed = 0;
        loop {
            let state = arm.container_state(group, name).await?;
            self.note(&format!("container {name} is {state:?}"));
            match state.as_str() {
                "Running" | "Pending" | "Waiting" | "" => {
                    printed = print_logs(arm, group, name, printed, op).await?;
                    tokio::time::sleep(self.poll_interval).await;
                }
                "Succeeded" => {
                    print_logs(arm, group, name, printed, op).await?;
                    return Ok(());
                }
                "Failed" => {
                    print_logs(arm, group, name, printed, op).await?;
                    return Err(DriverError::RunFailed {
                        kind: "container group",
                        name: name.to_string(),
                        reason: "container execution failed".into(),
                    });
                }
                other => {
                    return Err(DriverError::Azure(format!(
                        "Unexpected Container Status: {other}"
                    )));
                }
            }
        }
    }
}

impl Default for AciDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AciDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AciDriver")
            .field("resource_group", &self.settings.resource_group)
            .field("location", &self.settings.location)
            .field("name", &self.settings.name)
            .field("simulate", &self.settings.simulate)
            .finish_non_exhaustive()
    }
}

/// Files cannot be copied into a container group; only an empty image map passes
fn check_files(files: &BTreeMap<String, String>) -> Result<()> {
    let tolerated = files.is_empty()
        || (files.len() == 1
            && files
                .get(IMAGE_MAP_PATH)
                .is_some_and(|v| v.trim().is_empty() || v.trim() == "{}"));
    if tolerated {
        Ok(())
    } else {
        Err(DriverError::Unsupported("ACI driver does not support files".into()))
    }
}

fn location_is_available(location: &str, available: &[String]) -> bool {
    let normalize = |l: &str| l.replace(' ', "").to_lowercase();
    let wanted = normalize(location);
    available.iter().any(|l| normalize(l) == wanted)
}

/// Environment values are sent as secure values, with `'` doubled
fn secure_env(environment: &BTreeMap<String, String>) -> Vec<Value> {
    environment
        .iter()
        .map(|(name, value)| json!({ "name": name, "secureValue": value.replace('\'', "''") }))
        .collect()
}

fn container_group(name: &str, location: &str, image: &str, env: Vec<Value>, identity: Option<Value>) -> Value {
    let resources = json!({ "memoryInGB": 1.0, "cpu": 1.5 });
    let mut body = json!({
        "location": location,
        "properties": {
            "osType": "Linux",
            "restartPolicy": "Never",
            "containers": [{
                "name": name,
                "properties": {
                    "image": image,
                    "environmentVariables": env,
                    "resources": { "requests": resources, "limits": resources },
                }
            }]
        }
    });
    if let Some(identity) = identity {
        body["identity"] = identity;
    }
    body
}

async fn print_logs(arm: &ArmClient, group: &str, name: &str, printed: usize, op: &Operation) -> Result<usize> {
    let content = arm.container_logs(group, name, name).await?;
    let lines: Vec<&str> = content.trim_end_matches('\n').split('\n').collect();
    if content.is_empty() {
        return Ok(printed);
    }
    for line in lines.iter().skip(printed) {
        op.out.line(line)?;
    }
    Ok(lines.len())
}

fn report_cleanup(op: &Operation, kind: &str, name: &str, error: &DriverError) {
    tracing::warn!(%kind, %name, %error, "cleanup failed");
    let _ = op.out.line(format!("failed to delete {kind} {name}: {error}"));
}

#[async_trait]
impl Driver for AciDriver {
    async fn run(&self, op: &Operation) -> Result<()> {
        if !is_container_image(&op.image_type) {
            return Err(DriverError::unsupported_image("ACI", &op.image_type));
        }
        check_files(&op.files)?;
        if self.settings.location.is_none() && self.settings.resource_group.is_none() {
            return Err(DriverError::InvalidConfig(
                "ACI driver requires ACI_LOCATION or an existing resource group in ACI_RESOURCE_GROUP"
                    .into(),
            ));
        }

        let ambient = Ambient::from_env();
        self.note(&format!(
            "delete resources: {}, in cloud shell: {}",
            !self.settings.do_not_delete, ambient.in_cloud_shell
        ));
        if self.settings.simulate {
            return Ok(());
        }

        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        let token = auth::login(&http, &self.endpoints, &self.settings, &ambient, &op.out).await?;

        let mut arm = ArmClient::new(http, &self.endpoints.management, token);
        let subscription = match &self.settings.subscription_id {
            Some(id) => id.clone(),
            None => arm
                .first_subscription()
                .await
                .map_err(|e| DriverError::Azure(format!("cannot set Azure subscription: {e}")))?,
        };
        self.note(&format!("using subscription {subscription}"));
        arm.set_subscription(subscription);

        self.run_in_azure(&arm, op).await
    }

    async fn handles(&self, image_type: &str) -> bool {
        is_container_image(image_type)
    }

    fn as_configurable(&self) -> Option<&dyn Configurable> {
        Some(self)
    }

    fn as_configurable_mut(&mut self) -> Option<&mut dyn Configurable> {
        Some(self)
    }
}

impl Configurable for AciDriver {
    fn config(&self) -> BTreeMap<&'static str, &'static str> {
        BTreeMap::from([
            ("VERBOSE", "Increase verbosity. true, false are supported values"),
            ("AZURE_CLIENT_ID", "AAD Client ID for Azure account authentication"),
            ("AZURE_CLIENT_SECRET", "AAD Client Secret for Azure account authentication"),
            ("AZURE_TENANT_ID", "Azure AAD Tenant Id for Azure account authentication"),
            ("AZURE_SUBSCRIPTION_ID", "Azure Subscription Id; the first available subscription is used if not set"),
            ("AZURE_APP_ID", "Azure Application Id used for device code login"),
            ("ACI_RESOURCE_GROUP", "Existing Resource Group to create the ACI instance in; one is created if not set"),
            ("ACI_LOCATION", "The location to create the ACI instance in"),
            ("ACI_NAME", "The name of the ACI instance; generated if not set"),
            ("ACI_DO_NOT_DELETE", "Keep the ACI instance and any Resource Group created by the driver"),
            ("ACI_MSI_TYPE", "Launch the container group with a managed identity: system or user"),
            ("ACI_SYSTEM_MSI_ROLE", "Role assigned to a system identity; defaults to Contributor"),
            ("ACI_SYSTEM_MSI_SCOPE", "Scope of the system identity role; defaults to the Resource Group"),
            ("ACI_USER_MSI_RESOURCE_ID", "Resource Id of the user identity; required when ACI_MSI_TYPE is user"),
            ("SIMULATE", "If true, do not contact Azure"),
        ])
    }

    fn set_config(&mut self, settings: &BTreeMap<String, String>) {
        let value = |key: &str| settings.get(key).filter(|v| !v.is_empty()).cloned();
        let s = &mut self.settings;
        s.client_id = value("AZURE_CLIENT_ID");
        s.client_secret = value("AZURE_CLIENT_SECRET");
        s.tenant_id = value("AZURE_TENANT_ID");
        s.subscription_id = value("AZURE_SUBSCRIPTION_ID");
        s.app_id = value("AZURE_APP_ID");
        s.resource_group = value("ACI_RESOURCE_GROUP");
        s.location = value("ACI_LOCATION");
        s.name = value("ACI_NAME");
        s.msi_type = value("ACI_MSI_TYPE");
        s.system_msi_role = value("ACI_SYSTEM_MSI_ROLE");
        s.system_msi_scope = value("ACI_SYSTEM_MSI_SCOPE");
        s.user_msi_resource_id = value("ACI_USER_MSI_RESOURCE_ID");
        s.do_not_delete = value("ACI_DO_NOT_DELETE").is_some_and(|v| flag(&v));
        s.verbose = value("VERBOSE").is_some_and(|v| flag(&v));
        s.simulate = value("SIMULATE").is_some_and(|v| flag(&v));
    }
}
