//! Azure Instance Metadata Service
//!
//! IMDS supplies the subscription and resource group of the VM we run on, and
//! managed-identity tokens for the resource manager. It is reachable only from
//! the VM itself and must be queried without a proxy.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::debug;

use super::ProviderError;

/// Link-local IMDS address
pub const IMDS_ENDPOINT: &str = "http://169.254.169.254";

const INSTANCE_API_VERSION: &str = "2021-02-01";
const TOKEN_API_VERSION: &str = "2018-02-01";

/// Response of `/metadata/instance`
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceMetadata {
    /// Compute section
    pub compute: ComputeMetadata,
}

/// Compute section of the instance metadata
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeMetadata {
    /// VM name
    #[serde(default)]
    pub name: String,
    /// Subscription the VM belongs to
    pub subscription_id: String,
    /// Resource group the VM belongs to
    pub resource_group_name: String,
    /// Cloud name (`AzurePublicCloud`, ...)
    #[serde(default)]
    pub az_environment: String,
}

impl InstanceMetadata {
    /// Fetch instance metadata
    pub async fn fetch(http: &reqwest::Client, endpoint: &str) -> Result<Self, ProviderError> {
        let url = format!(
            "{endpoint}/metadata/instance?api-version={INSTANCE_API_VERSION}&format=json"
        );
        let response = http.get(&url).header("Metadata", "true").send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Metadata(format!(
                "instance metadata returned {status}: {body}"
            )));
        }

        let metadata: InstanceMetadata = response.json().await?;
        debug!(
            vm = %metadata.compute.name,
            resource_group = %metadata.compute.resource_group_name,
            environment = %metadata.compute.az_environment,
            "fetched instance metadata"
        );
        Ok(metadata)
    }
}

/// Managed-identity access token
#[derive(Debug, Clone)]
pub(crate) struct AccessToken {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Usable for at least `margin` more
    pub fn valid_for(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.expires_at - margin > now
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Unix seconds, delivered as a string
    expires_on: String,
}

fn parse_token(body: TokenResponse) -> Result<AccessToken, ProviderError> {
    let secs: i64 = body
        .expires_on
        .parse()
        .map_err(|_| ProviderError::Metadata(format!("bad expires_on '{}'", body.expires_on)))?;
    let expires_at = Utc
        .timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| ProviderError::Metadata(format!("expires_on {secs} out of range")))?;
    Ok(AccessToken {
        secret: body.access_token,
        expires_at,
    })
}

/// Request a managed-identity token for `resource`
pub(crate) async fn fetch_token(
    http: &reqwest::Client,
    endpoint: &str,
    resource: &str,
    client_id: Option<&str>,
) -> Result<AccessToken, ProviderError> {
    let mut query = vec![
        ("api-version", TOKEN_API_VERSION),
        ("resource", resource),
    ];
    if let Some(id) = client_id {
        query.push(("client_id", id));
    }

    let response = http
        .get(format!("{endpoint}/metadata/identity/oauth2/token"))
        .query(&query)
        .header("Metadata", "true")
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Metadata(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    parse_token(response.json().await?)
}
