//! Minimal Azure Resource Manager client

use reqwest::{Client, Method, Response};
use serde_json::{Value, json};
use std::time::Duration;

use crate::error::{DriverError, Result};

const RESOURCES_API: &str = "2021-04-01";
const SUBSCRIPTIONS_API: &str = "2020-01-01";
const CONTAINER_API: &str = "2021-10-01";
const AUTHORIZATION_API: &str = "2022-04-01";
const IDENTITY_API: &str = "2023-01-31";

/// Provisioning states after which a create call is settled
const SETTLED: [&str; 3] = ["Succeeded", "Failed", "Canceled"];

pub(crate) struct ArmClient {
    http: Client,
    base: String,
    token: String,
    subscription: String,
}

impl ArmClient {
    pub fn new(http: Client, base: &str, token: String) -> Self {
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            token,
            subscription: String::new(),
        }
    }

    pub fn set_subscription(&mut self, subscription: String) {
        self.subscription = subscription;
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Default scope for role assignments
    pub fn group_scope(&self, group: &str) -> String {
        format!("/subscriptions/{}/resourcegroups/{group}", self.subscription)
    }

    fn container_group_path(&self, group: &str, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.ContainerInstance/containerGroups/{name}",
            self.group_scope(group)
        )
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Response> {
        let mut request = self
            .http
            .request(method.clone(), format!("{}{path}", self.base))
            .bearer_auth(&self.token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(DriverError::Azure(format!("{method} {path} returned {status}: {text}")))
    }

    async fn get(&self, path: &str, api_version: &str) -> Result<Value> {
        Ok(self
            .request(Method::GET, path, &[("api-version", api_version)], None)
            .await?
            .json()
            .await?)
    }

    /// First subscription visible to the logged-in identity
    pub async fn first_subscription(&self) -> Result<String> {
        let list = self.get("/subscriptions", SUBSCRIPTIONS_API).await?;
        list.pointer("/value/0/subscriptionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| DriverError::Azure("cannot find a subscription".into()))
    }

    /// Locations where container groups can be created
    pub async fn container_locations(&self) -> Result<Vec<String>> {
        let provider = self
            .get(
                &format!(
                    "/subscriptions/{}/providers/Microsoft.ContainerInstance",
                    self.subscription
                ),
                RESOURCES_API,
            )
            .await?;

        let locations = provider["resourceTypes"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|t| {
                t["resourceType"]
                    .as_str()
                    .is_some_and(|r| r.eq_ignore_ascii_case("containerGroups"))
            })
            .flat_map(|t| t["locations"].as_array().cloned().unwrap_or_default())
            .filter_map(|l| l.as_str().map(str::to_string))
            .collect();
        Ok(locations)
    }

    pub async fn create_resource_group(&self, group: &str, location: &str) -> Result<()> {
        self.request(
            Method::PUT,
            &self.group_scope(group),
            &[("api-version", RESOURCES_API)],
            Some(&json!({ "location": location })),
        )
        .await?;
        Ok(())
    }

    /// Location of an existing resource group
    pub async fn resource_group_location(&self, group: &str) -> Result<Option<String>> {
        let found = self
            .get(&self.group_scope(group), RESOURCES_API)
            .await
            .map_err(|e| {
                DriverError::Azure(format!("checking for existing resource group {group} failed: {e}"))
            })?;
        Ok(found["location"].as_str().map(str::to_string))
    }

    pub async fn delete_resource_group(&self, group: &str) -> Result<()> {
        self.request(
            Method::DELETE,
            &self.group_scope(group),
            &[("api-version", RESOURCES_API)],
            None,
        )
        .await?;
        Ok(())
    }

    /// Create a container group and wait until provisioning settles
    pub async fn create_container_group(
        &self,
        group: &str,
        name: &str,
        body: &Value,
        poll: Duration,
    ) -> Result<Value> {
        let path = self.container_group_path(group, name);
        self.request(Method::PUT, &path, &[("api-version", CONTAINER_API)], Some(body))
            .await?;

        loop {
            let current = self.get(&path, CONTAINER_API).await?;
            let state = current
                .pointer("/properties/provisioningState")
                .and_then(Value::as_str)
                .unwrap_or("Succeeded");
            tracing::debug!(container_group = %name, %state, "provisioning");
            if SETTLED.contains(&state) {
                if state != "Succeeded" {
                    return Err(DriverError::Azure(format!(
                        "provisioning container group {name} ended in state {state}"
                    )));
                }
                return Ok(current);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Instance state of a container group (`Running`, `Succeeded`, ...)
    pub async fn container_state(&self, group: &str, name: &str) -> Result<String> {
        let current = self
            .get(&self.container_group_path(group, name), CONTAINER_API)
            .await?;
        Ok(current
            .pointer("/properties/instanceView/state")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    pub async fn container_logs(&self, group: &str, name: &str, container: &str) -> Result<String> {
        let path = format!(
            "{}/containers/{container}/logs",
            self.container_group_path(group, name)
        );
        let logs = self.get(&path, CONTAINER_API).await?;
        Ok(logs["content"].as_str().unwrap_or_default().to_string())
    }

    pub async fn delete_container_group(&self, group: &str, name: &str) -> Result<()> {
        self.request(
            Method::DELETE,
            &self.container_group_path(group, name),
            &[("api-version", CONTAINER_API)],
            None,
        )
        .await?;
        Ok(())
    }

    /// ID of the role definition named `role` at `scope`
    pub async fn role_definition_id(&self, scope: &str, role: &str) -> Result<Option<String>> {
        let filter = format!("roleName eq '{role}'");
        let list: Value = self
            .request(
                Method::GET,
                &format!("{scope}/providers/Microsoft.Authorization/roleDefinitions"),
                &[("api-version", AUTHORIZATION_API), ("$filter", filter.as_str())],
                None,
            )
            .await?
            .json()
            .await?;

        Ok(list["value"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|d| d.pointer("/properties/roleName").and_then(Value::as_str) == Some(role))
            .and_then(|d| d["id"].as_str())
            .map(str::to_string))
    }

    pub async fn assign_role(&self, scope: &str, role_definition_id: &str, principal_id: &str) -> Result<()> {
        let path = format!(
            "{scope}/providers/Microsoft.Authorization/roleAssignments/{}",
            uuid::Uuid::new_v4()
        );
        let body = json!({
            "properties": {
                "roleDefinitionId": role_definition_id,
                "principalId": principal_id,
            }
        });
        self.request(Method::PUT, &path, &[("api-version", AUTHORIZATION_API)], Some(&body))
            .await?;
        Ok(())
    }

    /// Resolve a user-assigned identity, returning its canonical ID
    pub async fn user_identity_id(&self, resource_id: &str) -> Result<String> {
        let identity = self.get(resource_id, IDENTITY_API).await.map_err(|e| {
            DriverError::Azure(format!("getting user assigned identity {resource_id} failed: {e}"))
        })?;
        Ok(identity["id"]
            .as_str()
            .unwrap_or(resource_id)
            .to_string())
    }
}
