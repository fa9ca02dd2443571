//! Cloud resource-manager adapter
//!
//! A [`ResourceManager`] binds a public IP to the IP configuration that holds
//! a pod's private address on the host's primary network interface, and
//! removes that binding again. Both calls return only once the cloud has
//! finished applying the change.
//!
//! # Supported Providers
//!
//! - [`AzureResourceManager`] - Azure Resource Manager (VM network interfaces)

mod arm;
mod azure;
mod imds;

pub use arm::{ArmApi, ArmClient, ArmConfig};
pub use azure::AzureResourceManager;
pub use imds::{ComputeMetadata, InstanceMetadata, IMDS_ENDPOINT};

#[cfg(test)]
pub use arm::MockArmApi;

use std::net::IpAddr;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// ARM code: the public IP is attached to another IP configuration
pub const CODE_ADDRESS_IN_USE: &str = "PublicIPAddressInUse";

/// ARM code: the public IP would be referenced by more than one IP configuration
pub const CODE_MULTIPLE_REFERENCES: &str = "PublicIPReferencedByMultipleIPConfigs";

/// Resource-manager errors
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The public IP is already attached elsewhere
    #[error("public IP already in use: {0}")]
    AddressInUse(String),

    /// The public IP is already referenced by multiple local IPs
    #[error("public IP referenced by multiple IP configurations: {0}")]
    MultipleReferences(String),

    /// A referenced resource does not exist
    #[error("resource not found: {0}")]
    NotFound(String),

    /// No public IP resource carries the requested address
    #[error("no public IP resource with address {0}")]
    PublicIpNotFound(IpAddr),

    /// The host's interface has no IP configuration for the local IP
    #[error("interface {nic} has no IP configuration for {local_ip}")]
    IpConfigNotFound {
        /// Interface resource id
        nic: String,
        /// Local IP looked up
        local_ip: IpAddr,
    },

    /// The host has no primary network interface
    #[error("host {0} has no primary network interface")]
    NicNotFound(String),

    /// Any other error response
    #[error("{code} (HTTP {status}): {message}")]
    Api {
        /// HTTP status
        status: u16,
        /// Error code from the response body
        code: String,
        /// Error message from the response body
        message: String,
    },

    /// Transport failure
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// A long-running operation ended in a non-success state
    #[error("operation {status}: {message}")]
    OperationFailed {
        /// Terminal status (`Failed`, `Canceled`)
        status: String,
        /// Error message reported for the operation
        message: String,
    },

    /// A long-running operation did not finish in time
    #[error("operation timed out")]
    OperationTimeout,

    /// Instance metadata or token endpoint failure
    #[error("metadata service error: {0}")]
    Metadata(String),

    /// Unexpected response shape
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// The binding cannot succeed as requested and must not be retried
    pub fn is_benign_conflict(&self) -> bool {
        matches!(
            self,
            ProviderError::AddressInUse(_) | ProviderError::MultipleReferences(_)
        )
    }

    /// The thing to unbind is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ProviderError::NotFound(_)
                | ProviderError::IpConfigNotFound { .. }
                | ProviderError::NicNotFound(_)
        )
    }

    /// Classify an ARM error body (`{"error": {"code", "message"}}`)
    pub fn from_response(status: u16, body: &str) -> Self {
        #[derive(Deserialize)]
        struct Envelope {
            error: Option<ErrorBody>,
        }

        let detail = serde_json::from_str::<Envelope>(body)
            .ok()
            .and_then(|e| e.error)
            .unwrap_or_else(|| ErrorBody {
                code: String::new(),
                message: body.trim().to_string(),
            });
        Self::from_error_body(status, detail)
    }

    pub(crate) fn from_error_body(status: u16, detail: ErrorBody) -> Self {
        match detail.code.as_str() {
            CODE_ADDRESS_IN_USE => ProviderError::AddressInUse(detail.message),
            CODE_MULTIPLE_REFERENCES => ProviderError::MultipleReferences(detail.message),
            _ if status == 404 => ProviderError::NotFound(detail.message),
            _ => ProviderError::Api {
                status,
                code: detail.code,
                message: detail.message,
            },
        }
    }
}

/// `error` object of ARM responses and async-operation results
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Cloud-side bind/unbind of a local IP to an external IP
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Attach `external_ip` to the IP configuration holding `local_ip` on `host`
    async fn bind(
        &self,
        host: &str,
        local_ip: IpAddr,
        external_ip: IpAddr,
    ) -> Result<(), ProviderError>;

    /// Detach whatever public IP the IP configuration holding `local_ip` has
    ///
    /// `external_ip` is informational; the desired address may already have
    /// been removed from the workload. Succeeds if nothing is attached.
    async fn unbind(
        &self,
        host: &str,
        local_ip: IpAddr,
        external_ip: Option<IpAddr>,
    ) -> Result<(), ProviderError>;
}
