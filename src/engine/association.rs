//! Association engine
//!
//! Forward path for a pod IP `L` and public IP `E`:
//!
//! 1. rule marker for `L` persisted (after unwinding any marker for an older IP)
//! 2. NAT rule for `L` ensured
//! 3. bind marker for `L` persisted (after unbinding any older IP)
//! 4. `E` bound to `L` on the host interface
//! 5. ready annotation persisted, then `L` recorded in memory
//!
//! The in-memory record only short-circuits this path while both markers name
//! `L` and the ready annotation is set. Extra markers left on the pod are rolled
//! back before anything else. The reverse path (pod deleted or without an IP)
//! releases the bind marker before the rule marker. Every external call is idempotent, so replaying a
//! partially completed path after a crash converges to the same state.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::actions::{host_of, Actions};
use super::AssociationRecords;
use crate::error::{ErrorClass, Step, StepContext};
use crate::intent::{MarkerKind, Workload};
use crate::{Error, Result};

/// Drives a workload toward a full association for its current pod IP
pub struct AssociationEngine {
    actions: Actions,
    records: Arc<AssociationRecords>,
    retry_delay: Duration,
}

impl AssociationEngine {
    /// Create an engine
    ///
    /// `retry_delay` is the fixed backoff returned for retryable failures.
    pub fn new(actions: Actions, records: Arc<AssociationRecords>, retry_delay: Duration) -> Self {
        Self {
            actions,
            records,
            retry_delay,
        }
    }

    /// In-memory association records
    pub fn records(&self) -> &AssociationRecords {
        &self.records
    }

    /// Reconcile one workload
    ///
    /// Returns `Some(delay)` when the caller should retry, `None` when the
    /// workload is settled. Errors are returned only for failures that the
    /// engine cannot classify as retryable.
    #[instrument(skip(self, workload), fields(workload = %workload.id))]
    pub async fn reconcile(&self, workload: &mut Workload) -> Result<Option<Duration>> {
        let Some(external_ip) = workload.external_ip else {
            debug!("no external IP requested");
            self.records.forget(&workload.id);
            return Ok(None);
        };

        match self.drive(workload, external_ip).await {
            Ok(()) => Ok(None),
            Err(err) => self.settle(err),
        }
    }

    fn settle(&self, err: Error) -> Result<Option<Duration>> {
        match err.class() {
            ErrorClass::PersistenceConflict => {
                debug!(error = %err, "pod changed while reconciling, retrying now");
                Ok(Some(Duration::ZERO))
            }
            ErrorClass::Transient => {
                warn!(
                    error = %err,
                    step = ?err.step(),
                    delay_secs = self.retry_delay.as_secs(),
                    "reconcile step failed, will retry"
                );
                Ok(Some(self.retry_delay))
            }
            ErrorClass::BenignConflict => {
                warn!(error = %err, "conflict needs no retry");
                Ok(None)
            }
            ErrorClass::Fatal => Err(err),
        }
    }

    async fn drive(&self, workload: &mut Workload, external_ip: IpAddr) -> Result<()> {
        let local_ip = match workload.local_ip {
            Some(ip) if !workload.deletion_requested => ip,
            _ => {
                self.records.forget(&workload.id);
                return self.dissociate(workload, external_ip).await;
            }
        };

        if !workload.markers.surplus().is_empty() {
            self.records.forget(&workload.id);
            self.actions
                .release_surplus(workload, Some(external_ip))
                .await?;
        }

        if self.is_converged(workload, local_ip) {
            debug!(%local_ip, "already associated");
            return Ok(());
        }
        self.records.forget(&workload.id);

        if workload.markers.get(MarkerKind::Rule) != Some(local_ip) {
            self.unwind_stale(workload, local_ip, external_ip).await?;
            workload.markers.set(MarkerKind::Rule, local_ip);
            self.actions.persist(workload).await?;
        }

        self.actions
            .nat
            .ensure(local_ip, &workload.id.to_string())
            .await
            .during(&workload.id, Step::InstallRule)?;

        if workload.markers.get(MarkerKind::Bind) != Some(local_ip) {
            self.actions
                .release(workload, MarkerKind::Bind, Some(external_ip))
                .await?;
            workload.markers.set(MarkerKind::Bind, local_ip);
            self.actions.persist(workload).await?;
        }

        let host = host_of(workload)?;
        match self.actions.cloud.bind(host, local_ip, external_ip).await {
            Ok(()) => {}
            Err(e) if e.is_benign_conflict() => {
                warn!(%local_ip, %external_ip, error = %e, "public IP is held elsewhere, not retrying bind");
            }
            Err(e) => return Err(e).during(&workload.id, Step::CloudBind),
        }

        if !workload.ready {
            workload.ready = true;
            self.actions.persist(workload).await?;
        }
        self.records.record(&workload.id, local_ip);
        info!(%local_ip, %external_ip, "associated");
        Ok(())
    }

    /// The record names `local_ip` and the pod still says so too
    fn is_converged(&self, workload: &Workload, local_ip: IpAddr) -> bool {
        self.records.get(&workload.id) == Some(local_ip)
            && workload.markers.get(MarkerKind::Rule) == Some(local_ip)
            && workload.markers.get(MarkerKind::Bind) == Some(local_ip)
            && workload.ready
    }

    /// Roll back markers that name an IP other than `local_ip`: cloud first, then rule
    async fn unwind_stale(
        &self,
        workload: &mut Workload,
        local_ip: IpAddr,
        external_ip: IpAddr,
    ) -> Result<()> {
        if workload
            .markers
            .get(MarkerKind::Bind)
            .is_some_and(|ip| ip != local_ip)
        {
            self.actions
                .release(workload, MarkerKind::Bind, Some(external_ip))
                .await?;
        }
        self.actions
            .release(workload, MarkerKind::Rule, Some(external_ip))
            .await
    }

    async fn dissociate(&self, workload: &mut Workload, external_ip: IpAddr) -> Result<()> {
        self.actions
            .release(workload, MarkerKind::Bind, Some(external_ip))
            .await?;
        self.actions
            .release_surplus(workload, Some(external_ip))
            .await?;
        self.actions
            .release(workload, MarkerKind::Rule, Some(external_ip))
            .await?;

        if workload.ready {
            workload.ready = false;
            self.actions.persist(workload).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fixtures::*;
    use crate::intent::{IntentMarkers, MockWorkloadStore};
    use crate::nat::{MockNatRuleStore, NatError};
    use crate::provider::{MockResourceManager, ProviderError};

    const RETRY: Duration = Duration::from_secs(5);

    fn engine(
        nat: MockNatRuleStore,
        cloud: MockResourceManager,
        store: MockWorkloadStore,
    ) -> AssociationEngine {
        AssociationEngine::new(
            Actions::new(Arc::new(nat), Arc::new(cloud), Arc::new(store)),
            Arc::new(AssociationRecords::new()),
            RETRY,
        )
    }

    fn recording_engine(journal: &Journal) -> AssociationEngine {
        engine(
            recording_nat(journal),
            recording_cloud(journal),
            recording_store(journal),
        )
    }

    // ==========================================================================
    // Story Tests: Forward path
    // ==========================================================================

    /// Story: a fresh pod ns/app-1 at 10.0.0.5 asking for 20.1.2.3
    ///
    /// The rule marker is committed before the rule, the bind marker before
    /// the bind, and the ready annotation last.
    #[tokio::test]
    async fn story_fresh_pod_is_associated() {
        let journal = Journal::new();
        let engine = recording_engine(&journal);
        let mut w = workload(Some("10.0.0.5"));

        let retry = engine.reconcile(&mut w).await.unwrap();

        assert_eq!(retry, None);
        assert_eq!(
            journal.events(),
            vec![
                "persist rule=10.0.0.5 bind=- ready=false",
                "ensure 10.0.0.5 ns/app-1",
                "persist rule=10.0.0.5 bind=10.0.0.5 ready=false",
                "bind node-0 10.0.0.5 20.1.2.3",
                "persist rule=10.0.0.5 bind=10.0.0.5 ready=true",
            ]
        );
        assert_eq!(w.markers.get(MarkerKind::Rule), Some(ip("10.0.0.5")));
        assert_eq!(w.markers.get(MarkerKind::Bind), Some(ip("10.0.0.5")));
        assert!(w.ready);
        assert_eq!(engine.records().get(&w.id), Some(ip("10.0.0.5")));
        // every write advanced the resource version
        assert_eq!(w.resource_version.as_deref(), Some("4"));
    }

    /// Story: repeated events for an associated pod touch nothing
    #[tokio::test]
    async fn story_second_reconcile_is_a_no_op() {
        let journal = Journal::new();
        let engine = recording_engine(&journal);
        let mut w = workload(Some("10.0.0.5"));

        engine.reconcile(&mut w).await.unwrap();
        let after_first = journal.events().len();

        assert_eq!(engine.reconcile(&mut w).await.unwrap(), None);
        assert_eq!(journal.events().len(), after_first);
    }

    /// Story: after a restart the in-memory record is gone, but the markers
    /// already name the current IP, so only idempotent calls are replayed
    #[tokio::test]
    async fn story_restart_replays_without_new_markers() {
        let journal = Journal::new();
        let engine = recording_engine(&journal);
        let mut w = workload(Some("10.0.0.5"));
        w.markers.set(MarkerKind::Rule, ip("10.0.0.5"));
        w.markers.set(MarkerKind::Bind, ip("10.0.0.5"));
        w.ready = true;

        engine.reconcile(&mut w).await.unwrap();

        assert_eq!(
            journal.events(),
            vec!["ensure 10.0.0.5 ns/app-1", "bind node-0 10.0.0.5 20.1.2.3"]
        );
    }

    /// Story: crash after the rule marker was written but before the rule
    /// was installed
    #[tokio::test]
    async fn story_interrupted_rule_install_converges() {
        let journal = Journal::new();
        let engine = recording_engine(&journal);
        let mut w = workload(Some("10.0.0.5"));
        w.markers.set(MarkerKind::Rule, ip("10.0.0.5"));

        engine.reconcile(&mut w).await.unwrap();

        assert_eq!(
            journal.events(),
            vec![
                "ensure 10.0.0.5 ns/app-1",
                "persist rule=10.0.0.5 bind=10.0.0.5 ready=false",
                "bind node-0 10.0.0.5 20.1.2.3",
                "persist rule=10.0.0.5 bind=10.0.0.5 ready=true",
            ]
        );
        assert_eq!(journal.count("remove"), 0);
        assert_eq!(journal.count("unbind"), 0);
        assert_eq!(w.finalizers().len(), 2);
    }

    // ==========================================================================
    // Story Tests: Stale IP cleanup
    // ==========================================================================

    /// Story: the pod was associated at A and comes back at B
    ///
    /// A is unbound (cloud, then rule) before anything is done for B.
    #[tokio::test]
    async fn story_changed_pod_ip_unwinds_old_ip_first() {
        let journal = Journal::new();
        let engine = recording_engine(&journal);
        engine
            .records()
            .record(&crate::intent::WorkloadId::new("ns", "app-1"), ip("10.0.0.5"));

        let mut w = workload(Some("10.0.0.9"));
        w.markers.set(MarkerKind::Rule, ip("10.0.0.5"));
        w.markers.set(MarkerKind::Bind, ip("10.0.0.5"));
        w.ready = true;

        engine.reconcile(&mut w).await.unwrap();

        assert_eq!(
            journal.events(),
            vec![
                "unbind node-0 10.0.0.5",
                "persist rule=10.0.0.5 bind=- ready=false",
                "remove ns/app-1",
                "persist rule=- bind=- ready=false",
                "persist rule=10.0.0.9 bind=- ready=false",
                "ensure 10.0.0.9 ns/app-1",
                "persist rule=10.0.0.9 bind=10.0.0.9 ready=false",
                "bind node-0 10.0.0.9 20.1.2.3",
                "persist rule=10.0.0.9 bind=10.0.0.9 ready=true",
            ]
        );
        assert_eq!(engine.records().get(&w.id), Some(ip("10.0.0.9")));
    }

    /// Story: the rule moved to B already but the bind marker still names A
    #[tokio::test]
    async fn story_stale_bind_marker_is_unbound_before_rebinding() {
        let journal = Journal::new();
        let engine = recording_engine(&journal);
        let mut w = workload(Some("10.0.0.9"));
        w.markers.set(MarkerKind::Rule, ip("10.0.0.9"));
        w.markers.set(MarkerKind::Bind, ip("10.0.0.5"));

        engine.reconcile(&mut w).await.unwrap();

        let events = journal.events();
        let unbind_a = events.iter().position(|e| e == "unbind node-0 10.0.0.5");
        let bind_b = events.iter().position(|e| e == "bind node-0 10.0.0.9 20.1.2.3");
        assert!(unbind_a.unwrap() < bind_b.unwrap());
        assert_eq!(journal.count("remove"), 0);
    }

    // ==========================================================================
    // Story Tests: The in-memory record is never authoritative
    // ==========================================================================

    /// Story: the ready write loses a race after the bind went through
    ///
    /// The retry has to write the ready annotation rather than trust a record
    /// taken before the write landed.
    #[tokio::test]
    async fn story_ready_write_conflict_is_retried_to_completion() {
        let journal = Journal::new();
        let engine = engine(
            recording_nat(&journal),
            recording_cloud(&journal),
            conflicting_store(&journal, 3),
        );
        let mut w = workload(Some("10.0.0.5"));

        assert_eq!(engine.reconcile(&mut w).await.unwrap(), Some(Duration::ZERO));
        assert!(engine.records().is_empty());

        // The retry sees the pod as stored: markers committed, ready unset
        w.ready = false;
        assert_eq!(engine.reconcile(&mut w).await.unwrap(), None);

        assert!(w.ready);
        assert_eq!(
            journal.events().last().map(String::as_str),
            Some("persist rule=10.0.0.5 bind=10.0.0.5 ready=true")
        );
        assert_eq!(engine.records().get(&w.id), Some(ip("10.0.0.5")));
    }

    /// Story: the record still names the pod IP but the markers were stripped
    ///
    /// The markers are written again before the idempotent calls are replayed.
    #[tokio::test]
    async fn story_record_is_revalidated_against_markers() {
        let journal = Journal::new();
        let engine = recording_engine(&journal);
        engine
            .records()
            .record(&crate::intent::WorkloadId::new("ns", "app-1"), ip("10.0.0.5"));
        let mut w = workload(Some("10.0.0.5"));
        w.ready = true;

        assert_eq!(engine.reconcile(&mut w).await.unwrap(), None);

        assert_eq!(
            journal.events(),
            vec![
                "persist rule=10.0.0.5 bind=- ready=true",
                "ensure 10.0.0.5 ns/app-1",
                "persist rule=10.0.0.5 bind=10.0.0.5 ready=true",
                "bind node-0 10.0.0.5 20.1.2.3",
            ]
        );
        assert_eq!(w.finalizers().len(), 2);
    }

    /// Story: a second bind marker names an older pod IP
    ///
    /// Its binding is undone and the marker removed before the current IP is
    /// reconciled.
    #[tokio::test]
    async fn story_extra_bind_marker_is_unbound_before_removal() {
        let journal = Journal::new();
        let engine = recording_engine(&journal);
        engine
            .records()
            .record(&crate::intent::WorkloadId::new("ns", "app-1"), ip("10.0.0.5"));
        let mut w = workload(Some("10.0.0.5"));
        w.markers = IntentMarkers::from_finalizers(&[
            "podexternalip.dev/rule-10-0-0-5".to_string(),
            "podexternalip.dev/bind-10-0-0-5".to_string(),
            "podexternalip.dev/bind-10-0-0-9".to_string(),
        ])
        .0;
        w.ready = true;

        assert_eq!(engine.reconcile(&mut w).await.unwrap(), None);

        assert_eq!(
            journal.events(),
            vec![
                "unbind node-0 10.0.0.9",
                "persist rule=10.0.0.5 bind=10.0.0.5 ready=false",
                "ensure 10.0.0.5 ns/app-1",
                "bind node-0 10.0.0.5 20.1.2.3",
                "persist rule=10.0.0.5 bind=10.0.0.5 ready=true",
            ]
        );
        assert!(w.markers.surplus().is_empty());
        assert_eq!(
            w.finalizers(),
            vec![
                "podexternalip.dev/rule-10-0-0-5".to_string(),
                "podexternalip.dev/bind-10-0-0-5".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_extra_unbind_keeps_the_marker() {
        let journal = Journal::new();
        let mut cloud = MockResourceManager::new();
        cloud
            .expect_unbind()
            .returning(|_, _, _| Err(ProviderError::OperationTimeout));
        // no bind expectation: the current IP is not touched until the extra is gone
        let engine = engine(MockNatRuleStore::new(), cloud, recording_store(&journal));
        let mut w = workload(Some("10.0.0.5"));
        w.markers = IntentMarkers::from_finalizers(&[
            "podexternalip.dev/bind-10-0-0-5".to_string(),
            "podexternalip.dev/bind-10-0-0-9".to_string(),
        ])
        .0;

        assert_eq!(engine.reconcile(&mut w).await.unwrap(), Some(RETRY));
        assert_eq!(w.markers.surplus().len(), 1);
        assert!(journal.events().is_empty());
    }

    // ==========================================================================
    // Story Tests: Reverse path
    // ==========================================================================

    /// Story: deletion requested while the pod still reports its IP
    #[tokio::test]
    async fn story_deleted_pod_is_dissociated() {
        let journal = Journal::new();
        let engine = recording_engine(&journal);
        engine.records().record(&crate::intent::WorkloadId::new("ns", "app-1"), ip("10.0.0.5"));

        let mut w = workload(Some("10.0.0.5"));
        w.markers.set(MarkerKind::Rule, ip("10.0.0.5"));
        w.markers.set(MarkerKind::Bind, ip("10.0.0.5"));
        w.ready = true;
        w.deletion_requested = true;

        assert_eq!(engine.reconcile(&mut w).await.unwrap(), None);

        assert_eq!(
            journal.events(),
            vec![
                "unbind node-0 10.0.0.5",
                "persist rule=10.0.0.5 bind=- ready=false",
                "remove ns/app-1",
                "persist rule=- bind=- ready=false",
            ]
        );
        assert!(w.markers.is_empty());
        assert!(engine.records().is_empty());
    }

    #[tokio::test]
    async fn test_pod_without_ip_and_markers_is_left_alone() {
        let journal = Journal::new();
        let engine = recording_engine(&journal);
        let mut w = workload(None);

        assert_eq!(engine.reconcile(&mut w).await.unwrap(), None);
        assert!(journal.events().is_empty());
    }

    #[tokio::test]
    async fn test_lost_ip_clears_ready_annotation() {
        let journal = Journal::new();
        let engine = recording_engine(&journal);
        let mut w = workload(None);
        w.ready = true;

        engine.reconcile(&mut w).await.unwrap();
        assert_eq!(journal.events(), vec!["persist rule=- bind=- ready=false"]);
    }

    /// Story: no external IP requested means no rule-store or cloud calls
    #[tokio::test]
    async fn story_unset_intent_is_a_no_op() {
        // Mocks without expectations panic on any call
        let engine = engine(
            MockNatRuleStore::new(),
            MockResourceManager::new(),
            MockWorkloadStore::new(),
        );
        let mut w = workload(Some("10.0.0.5"));
        w.external_ip = None;
        w.markers.set(MarkerKind::Rule, ip("10.0.0.1"));

        assert_eq!(engine.reconcile(&mut w).await.unwrap(), None);
    }

    // ==========================================================================
    // Story Tests: Failure classification
    // ==========================================================================

    /// Story: the public IP is already bound to another pod
    #[tokio::test]
    async fn story_benign_conflict_completes_without_retry() {
        let journal = Journal::new();
        let mut cloud = MockResourceManager::new();
        let j = journal.clone();
        cloud.expect_bind().times(1).returning(move |_, _, _| {
            j.push("bind conflict");
            Err(ProviderError::AddressInUse("pip-egress-1".to_string()))
        });
        let engine = engine(recording_nat(&journal), cloud, recording_store(&journal));
        let mut w = workload(Some("10.0.0.5"));

        assert_eq!(engine.reconcile(&mut w).await.unwrap(), None);
        assert_eq!(journal.count("ensure 10.0.0.5"), 1);
        assert_eq!(engine.records().get(&w.id), Some(ip("10.0.0.5")));

        // the record suppresses further bind attempts
        assert_eq!(engine.reconcile(&mut w).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cloud_failure_retries_with_markers_kept() {
        let journal = Journal::new();
        let mut cloud = MockResourceManager::new();
        cloud
            .expect_bind()
            .returning(|_, _, _| Err(ProviderError::OperationTimeout));
        let engine = engine(recording_nat(&journal), cloud, recording_store(&journal));
        let mut w = workload(Some("10.0.0.5"));

        assert_eq!(engine.reconcile(&mut w).await.unwrap(), Some(RETRY));
        assert_eq!(w.markers.get(MarkerKind::Bind), Some(ip("10.0.0.5")));
        assert!(!w.ready);
        assert!(engine.records().is_empty());
    }

    #[tokio::test]
    async fn test_rule_failure_retries_before_any_bind() {
        let journal = Journal::new();
        let mut nat = MockNatRuleStore::new();
        nat.expect_ensure().returning(|_, _| {
            Err(NatError::Command {
                command: "-I EXTERNAL-IP-EGRESS 1".to_string(),
                code: Some(4),
                stderr: "resource temporarily unavailable".to_string(),
            })
        });
        // no bind expectation: a bind attempt would panic
        let engine = engine(nat, MockResourceManager::new(), recording_store(&journal));
        let mut w = workload(Some("10.0.0.5"));

        assert_eq!(engine.reconcile(&mut w).await.unwrap(), Some(RETRY));
        assert_eq!(
            journal.events(),
            vec!["persist rule=10.0.0.5 bind=- ready=false"]
        );
    }

    #[tokio::test]
    async fn test_persistence_conflict_retries_immediately() {
        let mut store = MockWorkloadStore::new();
        store.expect_persist().returning(|_| Err(conflict()));
        let engine = engine(MockNatRuleStore::new(), MockResourceManager::new(), store);
        let mut w = workload(Some("10.0.0.5"));

        assert_eq!(engine.reconcile(&mut w).await.unwrap(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_unclassified_failures_propagate_with_context() {
        let journal = Journal::new();
        let engine = recording_engine(&journal);
        let mut w = workload(Some("10.0.0.5"));
        w.host = None;

        let err = engine.reconcile(&mut w).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(err.to_string().contains("ns/app-1"));
        assert_eq!(journal.count("bind"), 0);
    }
}
