//! pod-external-ip - per-node controller that maps pod IPs to cloud public IPs
//!
//! Every node runs one instance of this controller. For each pod on the node that
//! carries the external-IP annotation, the controller installs an egress NAT
//! exemption for the pod IP and binds the requested public IP to the pod's IP
//! configuration on the node's primary network interface. Both actions are torn
//! down exactly once when the pod goes away, even across restarts.
//!
//! # Architecture
//!
//! Intent is recorded on the pod itself as finalizer markers, one per kind of
//! outstanding action:
//! - a rule marker names the pod IP that has (or may have) a NAT rule installed
//! - a bind marker names the pod IP that has (or may have) a cloud binding
//!
//! A marker is always persisted before the action it guards and removed only
//! after that action was rolled back, so a crash at any point is recoverable
//! from the pod record alone.
//!
//! # Modules
//!
//! - [`intent`] - marker codec and the workload snapshot decoded from a pod
//! - [`nat`] - iptables rule store for the egress chains
//! - [`provider`] - cloud resource-manager adapter (Azure)
//! - [`engine`] - association and finalization state machines
//! - [`controller`] - kube-runtime glue
//! - [`config`] - command line and environment configuration
//! - [`retry`] - backoff helper for startup calls
//! - [`error`] - error types and retry classification

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod intent;
pub mod nat;
pub mod provider;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known keys
// =============================================================================

/// Annotation carrying the public IP a pod should egress from
pub const EXTERNAL_IP_ANNOTATION: &str = "podexternalip.dev/external-ip";

/// Annotation set to `"true"` once the pod is fully associated
///
/// The readiness sidecar injected at admission time waits for this value.
pub const READY_ANNOTATION: &str = "podexternalip.dev/ready";

/// Finalizer prefix for bind markers (`<prefix>-<escaped local IP>`)
pub const BIND_MARKER_PREFIX: &str = "podexternalip.dev/bind";

/// Finalizer prefix for rule markers (`<prefix>-<escaped local IP>`)
pub const RULE_MARKER_PREFIX: &str = "podexternalip.dev/rule";

/// Field manager name used for pod patches
pub const FIELD_MANAGER: &str = "pod-external-ip";

/// Default fixed backoff applied to retryable failures
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
