//! Deletion-time cleanup
//!
//! Association already unwinds a deleted pod while its external IP is still
//! requested. This engine covers what it cannot see: pods whose annotation
//! was removed, or whose IP vanished before the association engine ran.

use tracing::{debug, instrument};

use super::actions::Actions;
use crate::intent::{MarkerKind, Workload};
use crate::Result;

/// Drains markers from deleted pods that no longer report an IP
pub struct FinalizationEngine {
    actions: Actions,
}

impl FinalizationEngine {
    /// Create an engine
    pub fn new(actions: Actions) -> Self {
        Self { actions }
    }

    /// Release remaining markers once the pod is deleted and has lost its IP
    ///
    /// Cloud binding first, then any extra markers, NAT rule last. Each marker
    /// is dropped only after its side effect is rolled back.
    #[instrument(skip(self, workload), fields(workload = %workload.id))]
    pub async fn finalize(&self, workload: &mut Workload) -> Result<()> {
        if !workload.deletion_requested || workload.local_ip.is_some() {
            return Ok(());
        }
        if workload.markers.is_empty() {
            debug!("nothing to finalize");
            return Ok(());
        }

        let external_ip = workload.external_ip;
        self.actions
            .release(workload, MarkerKind::Bind, external_ip)
            .await?;
        self.actions.release_surplus(workload, external_ip).await?;
        self.actions
            .release(workload, MarkerKind::Rule, external_ip)
            .await
    }
}
