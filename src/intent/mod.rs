//! Durable per-workload intent
//!
//! A [`Workload`] is the snapshot the engines reason about: who the pod is,
//! where it runs, which IPs it has and wants, and the markers recording
//! outstanding actions. It is decoded from a `Pod` and written back through a
//! [`WorkloadStore`].

mod marker;
mod store;

pub use marker::{IntentMarkers, Marker, MarkerKind};
pub use store::{PodStore, WorkloadStore};

#[cfg(test)]
pub use store::MockWorkloadStore;

use std::fmt;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::warn;

use crate::{Error, Result, EXTERNAL_IP_ANNOTATION, READY_ANNOTATION};

/// Namespace and name of a workload
///
/// Rendered as `namespace/name`; that string is also the comment tagging the
/// workload's NAT rules.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkloadId {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl WorkloadId {
    /// Create an identity
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Snapshot of one pod as seen by the engines
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workload {
    /// Identity
    pub id: WorkloadId,
    /// Node the pod is scheduled to (the cloud host identity)
    pub host: Option<String>,
    /// Current pod IP, if assigned
    pub local_ip: Option<IpAddr>,
    /// Requested public IP, if any
    pub external_ip: Option<IpAddr>,
    /// Deletion has been requested (irreversible)
    pub deletion_requested: bool,
    /// Outstanding intent markers
    pub markers: IntentMarkers,
    /// Value of the ready annotation
    pub ready: bool,
    /// Finalizers owned by other controllers, in their original order
    pub foreign_finalizers: Vec<String>,
    /// Resource version the snapshot was read at
    pub resource_version: Option<String>,
}

impl Workload {
    /// Create an empty snapshot for `id`
    pub fn new(id: WorkloadId) -> Self {
        Self {
            id,
            host: None,
            local_ip: None,
            external_ip: None,
            deletion_requested: false,
            markers: IntentMarkers::default(),
            ready: false,
            foreign_finalizers: Vec::new(),
            resource_version: None,
        }
    }

    /// Decode a pod
    ///
    /// An unparseable external-IP annotation is treated as absent so that
    /// finalization can still drain markers; an unparseable pod IP is an error.
    pub fn from_pod(pod: &Pod) -> Result<Self> {
        let id = WorkloadId::new(pod.namespace().unwrap_or_default(), pod.name_any());
        let annotations = pod.annotations();

        let external_ip = match annotations.get(EXTERNAL_IP_ANNOTATION).map(|v| v.trim()) {
            None | Some("") => None,
            Some(value) => match value.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!(workload = %id, value = %value, "ignoring unparseable external IP annotation");
                    None
                }
            },
        };

        let local_ip = match pod.status.as_ref().and_then(|s| s.pod_ip.as_deref()) {
            None | Some("") => None,
            Some(value) => Some(value.parse::<IpAddr>().map_err(|_| {
                Error::validation(format!("pod {id} has unparseable pod IP '{value}'"))
            })?),
        };

        let host = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .filter(|n| !n.is_empty());

        let (markers, foreign_finalizers) = IntentMarkers::from_finalizers(pod.finalizers());

        Ok(Self {
            host,
            local_ip,
            external_ip,
            deletion_requested: pod.metadata.deletion_timestamp.is_some(),
            markers,
            ready: annotations.get(READY_ANNOTATION).map(String::as_str) == Some("true"),
            foreign_finalizers,
            resource_version: pod.resource_version(),
            id,
        })
    }

    /// Finalizer list to write back
    pub fn finalizers(&self) -> Vec<String> {
        self.markers.to_finalizers(&self.foreign_finalizers)
    }
}
