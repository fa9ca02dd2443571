//! Minimal Azure Resource Manager REST client
//!
//! Only what the adapter needs: GET a resource or collection page, and PUT a
//! full resource while waiting for its long-running operation to settle.
//!
//! A PUT is followed to completion through the first signal the response
//! carries: the `Azure-AsyncOperation` status resource, then a `Location` to
//! poll while it answers 202, then the resource's own `provisioningState`.
//! All polling shares one operation timeout.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, AUTHORIZATION, LOCATION};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::imds::{fetch_token, AccessToken};
use super::{ErrorBody, ProviderError};

/// Refresh tokens this long before they expire
const TOKEN_REFRESH_MARGIN_MINUTES: i64 = 5;

const ASYNC_OPERATION_HEADER: &str = "azure-asyncoperation";

/// How the outcome of an accepted PUT is learned
#[derive(Clone, Debug, PartialEq, Eq)]
enum Completion {
    /// Poll the operation status resource until it reports a terminal status
    AsyncOperation(String),
    /// Poll the URL until it stops answering 202
    Location(String),
    /// Re-read the resource until its provisioning state is terminal
    ProvisioningState,
}

impl Completion {
    /// Pick the completion signal of a PUT response, `None` when already settled
    fn of(status: StatusCode, headers: &HeaderMap, body: &Value) -> Option<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };

        if let Some(url) = header(ASYNC_OPERATION_HEADER) {
            return Some(Completion::AsyncOperation(url));
        }
        if status == StatusCode::ACCEPTED {
            if let Some(url) = header(LOCATION.as_str()) {
                return Some(Completion::Location(url));
            }
        }
        match provisioning_state(body) {
            Some(state) if terminal_state(state).is_none() => Some(Completion::ProvisioningState),
            _ => None,
        }
    }
}

/// `properties.provisioningState` of a resource body
fn provisioning_state(body: &Value) -> Option<&str> {
    body["properties"]["provisioningState"].as_str()
}

/// Outcome of a terminal provisioning state, `None` while still in progress
fn terminal_state(state: &str) -> Option<Result<(), ProviderError>> {
    match state {
        "Succeeded" => Some(Ok(())),
        "Failed" | "Canceled" => Some(Err(ProviderError::OperationFailed {
            status: state.to_string(),
            message: "resource provisioning did not succeed".to_string(),
        })),
        _ => None,
    }
}

/// Resource-manager calls used by the adapter (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArmApi: Send + Sync {
    /// GET `path` (a resource id or collection path) at `api_version`
    async fn get(&self, path: &str, api_version: &str) -> Result<Value, ProviderError>;

    /// GET an absolute `nextLink` returned by a previous list call
    async fn get_link(&self, link: &str) -> Result<Value, ProviderError>;

    /// PUT `body` to `path` and wait for the operation to finish
    async fn put(&self, path: &str, api_version: &str, body: &Value)
        -> Result<Value, ProviderError>;
}

/// Connection settings for [`ArmClient`]
#[derive(Clone, Debug)]
pub struct ArmConfig {
    /// Resource-manager base URL
    pub endpoint: String,
    /// IMDS base URL (token source)
    pub imds_endpoint: String,
    /// Client id of a user-assigned identity, if not using the system identity
    pub client_id: Option<String>,
    /// Delay between long-running operation polls
    pub poll_interval: Duration,
    /// Upper bound on waiting for a long-running operation
    pub operation_timeout: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for ArmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://management.azure.com".to_string(),
            imds_endpoint: super::IMDS_ENDPOINT.to_string(),
            client_id: None,
            poll_interval: Duration::from_secs(2),
            operation_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// [`ArmApi`] over HTTPS with managed-identity authentication
pub struct ArmClient {
    http: reqwest::Client,
    imds_http: reqwest::Client,
    config: ArmConfig,
    token: Mutex<Option<AccessToken>>,
}

#[derive(Deserialize)]
struct OperationStatus {
    status: String,
    #[serde(default)]
    error: Option<ErrorBody>,
}

impl ArmClient {
    /// Build a client
    pub fn new(config: ArmConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        // IMDS must never go through a proxy
        let imds_http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .no_proxy()
            .build()?;

        Ok(Self {
            http,
            imds_http,
            config,
            token: Mutex::new(None),
        })
    }

    /// HTTP client configured for IMDS
    pub fn imds_http(&self) -> &reqwest::Client {
        &self.imds_http
    }

    async fn bearer(&self) -> Result<String, ProviderError> {
        let mut cached = self.token.lock().await;
        let margin = chrono::Duration::minutes(TOKEN_REFRESH_MARGIN_MINUTES);
        if let Some(token) = cached.as_ref().filter(|t| t.valid_for(Utc::now(), margin)) {
            return Ok(format!("Bearer {}", token.secret));
        }

        let resource = format!("{}/", self.config.endpoint.trim_end_matches('/'));
        let token = fetch_token(
            &self.imds_http,
            &self.config.imds_endpoint,
            &resource,
            self.config.client_id.as_deref(),
        )
        .await?;
        debug!(expires_at = %token.expires_at, "refreshed resource-manager token");
        let header = format!("Bearer {}", token.secret);
        *cached = Some(token);
        Ok(header)
    }

    fn url(&self, path: &str, api_version: &str) -> String {
        format!(
            "{}{}?api-version={}",
            self.config.endpoint.trim_end_matches('/'),
            path,
            api_version
        )
    }

    async fn get_url(&self, url: &str) -> Result<Reply, ProviderError> {
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, self.bearer().await?)
            .send()
            .await?;
        read(response).await
    }

    async fn wait_for(&self, completion: Completion, resource_url: &str) -> Result<(), ProviderError> {
        let poll = async {
            match completion {
                Completion::AsyncOperation(url) => self.poll_operation(&url).await,
                Completion::Location(url) => self.poll_location(&url).await,
                Completion::ProvisioningState => self.poll_provisioning(resource_url).await,
            }
        };
        tokio::time::timeout(self.config.operation_timeout, poll)
            .await
            .map_err(|_| ProviderError::OperationTimeout)?
    }

    async fn poll_location(&self, location: &str) -> Result<(), ProviderError> {
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            let reply = self.get_url(location).await?;
            if reply.status != StatusCode::ACCEPTED {
                return Ok(());
            }
            debug!("operation still accepted");
        }
    }

    async fn poll_provisioning(&self, resource_url: &str) -> Result<(), ProviderError> {
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            let reply = self.get_url(resource_url).await?;
            let state = provisioning_state(&reply.body).unwrap_or("Succeeded");
            if let Some(outcome) = terminal_state(state) {
                return outcome;
            }
            debug!(state = %state, "resource still provisioning");
        }
    }

    async fn poll_operation(&self, operation_url: &str) -> Result<(), ProviderError> {
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            let Reply { body, .. } = self.get_url(operation_url).await?;
            let op: OperationStatus = serde_json::from_value(body)
                .map_err(|e| ProviderError::Malformed(format!("operation status: {e}")))?;
            match op.status.as_str() {
                "Succeeded" => return Ok(()),
                "Failed" | "Canceled" => {
                    let detail = op.error.unwrap_or_default();
                    // A failed NIC update reports the same codes as a synchronous error
                    let classified = ProviderError::from_error_body(400, detail.clone());
                    if classified.is_benign_conflict() {
                        return Err(classified);
                    }
                    return Err(ProviderError::OperationFailed {
                        status: op.status,
                        message: format!("{}: {}", detail.code, detail.message),
                    });
                }
                other => debug!(status = %other, "operation in progress"),
            }
        }
    }
}

/// A successful response
struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

async fn read(response: reqwest::Response) -> Result<Reply, ProviderError> {
    let status = response.status();
    let headers = response.headers().clone();
    let text = response.text().await?;

    if !status.is_success() {
        return Err(ProviderError::from_response(status.as_u16(), &text));
    }
    let body = if text.trim().is_empty() || status == StatusCode::NO_CONTENT {
        Value::Null
    } else {
        serde_json::from_str(&text)
            .map_err(|e| ProviderError::Malformed(format!("response body: {e}")))?
    };
    Ok(Reply {
        status,
        headers,
        body,
    })
}

#[async_trait]
impl ArmApi for ArmClient {
    async fn get(&self, path: &str, api_version: &str) -> Result<Value, ProviderError> {
        Ok(self.get_url(&self.url(path, api_version)).await?.body)
    }

    async fn get_link(&self, link: &str) -> Result<Value, ProviderError> {
        Ok(self.get_url(link).await?.body)
    }

    async fn put(
        &self,
        path: &str,
        api_version: &str,
        body: &Value,
    ) -> Result<Value, ProviderError> {
        let url = self.url(path, api_version);
        let response = self
            .http
            .put(&url)
            .header(AUTHORIZATION, self.bearer().await?)
            .json(body)
            .send()
            .await?;
        let reply = read(response).await?;

        if let Some(completion) = Completion::of(reply.status, &reply.headers, &reply.body) {
            debug!(path = %path, ?completion, "waiting for long-running operation");
            self.wait_for(completion, &url).await?;
        } else if let Some(Err(e)) = provisioning_state(&reply.body).and_then(terminal_state) {
            return Err(e);
        }
        Ok(reply.body)
    }
}
