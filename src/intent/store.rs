//! Writing workload intent back to the pod

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::Workload;
use crate::{Result, FIELD_MANAGER, READY_ANNOTATION};

/// Persists markers and the ready annotation of a workload
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    /// Write the workload's finalizers and ready annotation
    ///
    /// The write is conditional on the snapshot's resource version. Returns
    /// the resource version after the write.
    async fn persist(&self, workload: &Workload) -> Result<Option<String>>;
}

/// [`WorkloadStore`] backed by the Kubernetes API
pub struct PodStore {
    client: Client,
}

impl PodStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// JSON merge patch carrying the full finalizer list and the ready annotation
///
/// Including `resourceVersion` makes the API server reject the patch with 409
/// when the pod changed since it was read.
pub(crate) fn intent_patch(workload: &Workload) -> serde_json::Value {
    let ready = if workload.ready {
        json!("true")
    } else {
        serde_json::Value::Null
    };

    let mut metadata = json!({
        "finalizers": workload.finalizers(),
        "annotations": { READY_ANNOTATION: ready },
    });
    if let Some(rv) = &workload.resource_version {
        metadata["resourceVersion"] = json!(rv);
    }
    json!({ "metadata": metadata })
}

/// Patch parameters naming this controller as the field manager
pub(crate) fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl WorkloadStore for PodStore {
    async fn persist(&self, workload: &Workload) -> Result<Option<String>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &workload.id.namespace);
        let patch = intent_patch(workload);
        debug!(workload = %workload.id, finalizers = ?workload.finalizers(), "persisting intent");

        let pod = api
            .patch(
                &workload.id.name,
                &patch_params(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(pod.resource_version())
    }
}
