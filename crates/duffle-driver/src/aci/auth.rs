//! Azure login
//!
//! Methods are tried in order: service principal, device code, Cloud Shell
//! token, then the instance metadata identity endpoint.

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};

use super::{AciSettings, Endpoints};
use crate::Output;
use crate::error::{DriverError, Result};

/// Process environment consulted during login
#[derive(Debug, Clone, Default)]
pub(crate) struct Ambient {
    pub in_cloud_shell: bool,
    pub msi_endpoint: Option<String>,
}

impl Ambient {
    pub fn from_env() -> Self {
        Self {
            in_cloud_shell: std::env::var("ACC_CLOUD").is_ok_and(|v| !v.is_empty()),
            msi_endpoint: std::env::var("MSI_ENDPOINT").ok().filter(|v| !v.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceCode {
    device_code: String,
    message: String,
    #[serde(default)]
    interval: Option<Value>,
    #[serde(default)]
    expires_in: Option<Value>,
}

/// The v1 endpoint returns numbers as strings
fn seconds(value: Option<&Value>, default: u64) -> Duration {
    let secs = match value {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    Duration::from_secs(secs.unwrap_or(default))
}

/// Obtain a bearer token for the management API
pub(crate) async fn login(
    http: &Client,
    endpoints: &Endpoints,
    settings: &AciSettings,
    ambient: &Ambient,
    out: &Output,
) -> Result<String> {
    if let (Some(client_id), Some(secret), Some(tenant)) = (
        &settings.client_id,
        &settings.client_secret,
        &settings.tenant_id,
    ) {
        tracing::debug!(%client_id, %tenant, "logging in with service principal");
        return service_principal(http, endpoints, client_id, secret, tenant)
            .await
            .map_err(|e| DriverError::Azure(format!("login with service principal failed: {e}")));
    }

    if let (Some(app_id), Some(tenant)) = (&settings.app_id, &settings.tenant_id) {
        tracing::debug!(%app_id, %tenant, "logging in with device code");
        let token = device_code(http, endpoints, app_id, tenant, out)
            .await
            .map_err(|e| DriverError::Azure(format!("login with device code failed: {e}")))?;
        out.line("Logged in with Device Code")?;
        return Ok(token);
    }

    if ambient.in_cloud_shell {
        tracing::debug!("logging in with Cloud Shell token");
        if ambient.msi_endpoint.is_none() {
            return Err(DriverError::Azure(
                "login with Cloud Shell failed: MSI_ENDPOINT environment variable not set".into(),
            ));
        }
        return metadata_token(http, &endpoints.cloud_shell, &endpoints.resource)
            .await
            .map_err(|e| DriverError::Azure(format!("login with Cloud Shell failed: {e}")));
    }

    if msi_available(http, &endpoints.imds).await {
        tracing::debug!("logging in with managed identity");
        return metadata_token(http, &endpoints.imds, &endpoints.resource)
            .await
            .map_err(|e| DriverError::Azure(format!("login with managed identity failed: {e}")));
    }

    Err(DriverError::Azure(
        "cannot login to Azure - no valid credentials provided".into(),
    ))
}

async fn service_principal(
    http: &Client,
    endpoints: &Endpoints,
    client_id: &str,
    secret: &str,
    tenant: &str,
) -> Result<String> {
    let response = http
        .post(format!("{}/{tenant}/oauth2/token", endpoints.authority))
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", secret),
            ("resource", endpoints.resource.as_str()),
        ])
        .send()
        .await?;
    token_from(response).await
}

async fn device_code(
    http: &Client,
    endpoints: &Endpoints,
    app_id: &str,
    tenant: &str,
    out: &Output,
) -> Result<String> {
    let base = format!("{}/{tenant}/oauth2", endpoints.authority);
    let response = http
        .post(format!("{base}/devicecode"))
        .form(&[("client_id", app_id), ("resource", endpoints.resource.as_str())])
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(token_error(response).await);
    }
    let code: DeviceCode = response.json().await?;
    out.line(&code.message)?;

    let interval = seconds(code.interval.as_ref(), 5);
    let expires = seconds(code.expires_in.as_ref(), 900);
    let deadline = Instant::now() + expires;
    loop {
        tokio::time::sleep(interval).await;
        let response = http
            .post(format!("{base}/token"))
            .form(&[
                ("grant_type", "device_code"),
                ("client_id", app_id),
                ("code", code.device_code.as_str()),
                ("resource", endpoints.resource.as_str()),
            ])
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(response.json::<TokenResponse>().await?.access_token);
        }

        match response.json::<TokenError>().await {
            Ok(e) if e.error == "authorization_pending" || e.error == "slow_down" => {
                if Instant::now() >= deadline {
                    return Err(DriverError::Timeout {
                        what: "device code login".into(),
                        after: expires,
                    });
                }
            }
            Ok(e) => return Err(DriverError::Azure(describe(&e))),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Token from a metadata-style endpoint (Cloud Shell or instance metadata)
async fn metadata_token(http: &Client, url: &str, resource: &str) -> Result<String> {
    let response = http
        .get(url)
        .header("Metadata", "true")
        .query(&[("api-version", "2018-02-01"), ("resource", resource)])
        .send()
        .await?;
    token_from(response).await
}

async fn msi_available(http: &Client, url: &str) -> bool {
    http.head(url)
        .timeout(Duration::from_secs(1))
        .send()
        .await
        .is_ok()
}

async fn token_from(response: reqwest::Response) -> Result<String> {
    if response.status().is_success() {
        Ok(response.json::<TokenResponse>().await?.access_token)
    } else {
        Err(token_error(response).await)
    }
}

async fn token_error(response: reqwest::Response) -> DriverError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<TokenError>(&body) {
        Ok(e) => DriverError::Azure(format!("{status}: {}", describe(&e))),
        Err(_) => DriverError::Azure(format!("{status}: {body}")),
    }
}

fn describe(e: &TokenError) -> String {
    match &e.error_description {
        Some(d) => format!("{}: {d}", e.error),
        None => e.error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoints(server: &MockServer) -> Endpoints {
        Endpoints {
            authority: server.uri(),
            imds: format!("{}/metadata/identity/oauth2/token", server.uri()),
            cloud_shell: format!("{}/oauth2/token", server.uri()),
            ..Endpoints::default()
        }
    }

    #[test]
    fn test_seconds() {
        assert_eq!(seconds(Some(&json!("7")), 5), Duration::from_secs(7));
        assert_eq!(seconds(Some(&json!(3)), 5), Duration::from_secs(3));
        assert_eq!(seconds(None, 5), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_service_principal_login() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant/oauth2/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=app"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "tok" })))
            .expect(1)
            .mount(&server)
            .await;

        let settings = AciSettings {
            client_id: Some("app".into()),
            client_secret: Some("secret".into()),
            tenant_id: Some("tenant".into()),
            ..Default::default()
        };
        let token = login(
            &Client::new(),
            &endpoints(&server),
            &settings,
            &Ambient::default(),
            &Output::capture().0,
        )
        .await
        .unwrap();
        assert_eq!(token, "tok");
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant/oauth2/token"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "invalid_client",
                "error_description": "bad secret",
            })))
            .mount(&server)
            .await;

        let settings = AciSettings {
            client_id: Some("app".into()),
            client_secret: Some("wrong".into()),
            tenant_id: Some("tenant".into()),
            ..Default::default()
        };
        let err = login(
            &Client::new(),
            &endpoints(&server),
            &settings,
            &Ambient::default(),
            &Output::capture().0,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("invalid_client: bad secret"));
    }

    #[tokio::test]
    async fn test_cloud_shell_login() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth2/token"))
            .and(header("Metadata", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "shell" })))
            .mount(&server)
            .await;

        let ambient = Ambient {
            in_cloud_shell: true,
            msi_endpoint: Some("http://localhost:50342/oauth2/token".into()),
        };
        let token = login(
            &Client::new(),
            &endpoints(&server),
            &AciSettings::default(),
            &ambient,
            &Output::capture().0,
        )
        .await
        .unwrap();
        assert_eq!(token, "shell");
    }

    #[tokio::test]
    async fn test_cloud_shell_needs_msi_endpoint() {
        let server = MockServer::start().await;
        let ambient = Ambient {
            in_cloud_shell: true,
            msi_endpoint: None,
        };
        let err = login(
            &Client::new(),
            &endpoints(&server),
            &AciSettings::default(),
            &ambient,
            &Output::capture().0,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("MSI_ENDPOINT"));
    }
}
