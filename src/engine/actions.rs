//! Side effects shared by both engines
//!
//! Every marker mutation is followed by a conditional write of the workload,
//! so the pod record always describes what may exist outside the cluster.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Step, StepContext};
use crate::intent::{Marker, MarkerKind, Workload, WorkloadStore};
use crate::nat::NatRuleStore;
use crate::provider::ResourceManager;
use crate::{Error, Result};

/// Collaborators the engines drive
#[derive(Clone)]
pub struct Actions {
    pub(crate) nat: Arc<dyn NatRuleStore>,
    pub(crate) cloud: Arc<dyn ResourceManager>,
    pub(crate) store: Arc<dyn WorkloadStore>,
}

impl Actions {
    /// Bundle the rule store, the resource manager and the workload store
    pub fn new(
        nat: Arc<dyn NatRuleStore>,
        cloud: Arc<dyn ResourceManager>,
        store: Arc<dyn WorkloadStore>,
    ) -> Self {
        Self { nat, cloud, store }
    }

    /// Write markers and the ready annotation, tracking the new resource version
    pub(crate) async fn persist(&self, workload: &mut Workload) -> Result<()> {
        let version = self
            .store
            .persist(workload)
            .await
            .during(&workload.id, Step::PersistMarkers)?;
        workload.resource_version = version;
        Ok(())
    }

    /// Roll back whatever the marker of `kind` guards, then drop the marker
    ///
    /// A missing marker means there is nothing to roll back. Cloud-side
    /// "already gone" answers count as success.
    pub(crate) async fn release(
        &self,
        workload: &mut Workload,
        kind: MarkerKind,
        external_ip: Option<IpAddr>,
    ) -> Result<()> {
        let Some(local_ip) = workload.markers.get(kind) else {
            return Ok(());
        };

        self.undo(workload, Marker::new(kind, local_ip), external_ip)
            .await?;

        workload.markers.clear(kind);
        workload.ready = false;
        self.persist(workload).await?;
        info!(workload = %workload.id, %local_ip, marker = %kind, "released");
        Ok(())
    }

    /// Roll back and drop every surplus marker, bindings before rules
    ///
    /// Each marker is removed and persisted on its own, so a failure part way
    /// leaves the remaining ones on the pod. Returns whether anything was
    /// released.
    pub(crate) async fn release_surplus(
        &self,
        workload: &mut Workload,
        external_ip: Option<IpAddr>,
    ) -> Result<bool> {
        let mut pending = workload.markers.surplus().to_vec();
        if pending.is_empty() {
            return Ok(false);
        }
        pending.sort_by_key(|m| match m.kind {
            MarkerKind::Bind => 0,
            MarkerKind::Rule => 1,
        });

        for marker in pending {
            self.undo(workload, marker, external_ip).await?;
            workload.markers.remove_surplus(&marker);
            workload.ready = false;
            self.persist(workload).await?;
            info!(
                workload = %workload.id,
                local_ip = %marker.local_ip,
                marker = %marker.kind,
                "released extra marker"
            );
        }
        Ok(true)
    }

    /// Reverse the action guarded by `marker`
    async fn undo(
        &self,
        workload: &Workload,
        marker: Marker,
        external_ip: Option<IpAddr>,
    ) -> Result<()> {
        let local_ip = marker.local_ip;
        match marker.kind {
            MarkerKind::Bind => {
                let host = host_of(workload)?;
                match self.cloud.unbind(host, local_ip, external_ip).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_not_found() => {
                        debug!(workload = %workload.id, %local_ip, error = %e, "binding already gone");
                        Ok(())
                    }
                    Err(e) => Err(e).during(&workload.id, Step::CloudUnbind),
                }
            }
            MarkerKind::Rule => self
                .nat
                .remove(&workload.id.to_string())
                .await
                .during(&workload.id, Step::RemoveRule),
        }
    }
}

/// Host the workload is scheduled on
pub(crate) fn host_of(workload: &Workload) -> Result<&str> {
    workload
        .host
        .as_deref()
        .ok_or_else(|| Error::validation(format!("pod {} is not scheduled to a node", workload.id)))
}
