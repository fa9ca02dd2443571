//! Pod reconciler
//!
//! Decodes each pod event into a [`Workload`], runs association and then
//! finalization, and maps the outcome onto a kube-runtime [`Action`].

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, instrument, warn};

use crate::engine::{Actions, AssociationEngine, AssociationRecords, FinalizationEngine};
use crate::error::ErrorClass;
use crate::intent::{PodStore, Workload, WorkloadStore};
use crate::nat::NatRuleStore;
use crate::provider::ResourceManager;
use crate::{Error, DEFAULT_RETRY_DELAY_SECS};

/// Controller context shared by every reconcile call
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client, "aks-node-0")
///     .nat(Arc::new(IptablesRuleStore::new("iptables")))
///     .resource_manager(Arc::new(azure))
///     .build()?;
/// ```
pub struct Context {
    /// Node this instance owns; pods scheduled elsewhere are ignored
    pub node_name: String,
    /// Forward/reverse association state machine
    pub association: AssociationEngine,
    /// Deletion-time cleanup
    pub finalization: FinalizationEngine,
    /// Fixed backoff for retryable failures
    pub retry_delay: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, node_name: impl Into<String>) -> ContextBuilder {
        ContextBuilder::new(client, node_name.into())
    }

    /// Create a context for testing from prepared collaborators
    #[cfg(test)]
    pub fn for_testing(node_name: &str, actions: Actions, retry_delay: Duration) -> Self {
        Self {
            node_name: node_name.to_string(),
            association: AssociationEngine::new(
                actions.clone(),
                Arc::new(AssociationRecords::new()),
                retry_delay,
            ),
            finalization: FinalizationEngine::new(actions),
            retry_delay,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    node_name: String,
    nat: Option<Arc<dyn NatRuleStore>>,
    cloud: Option<Arc<dyn ResourceManager>>,
    retry_delay: Duration,
}

impl ContextBuilder {
    fn new(client: Client, node_name: String) -> Self {
        Self {
            client,
            node_name,
            nat: None,
            cloud: None,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
        }
    }

    /// Set the NAT rule store
    pub fn nat(mut self, nat: Arc<dyn NatRuleStore>) -> Self {
        self.nat = Some(nat);
        self
    }

    /// Set the cloud resource manager
    pub fn resource_manager(mut self, cloud: Arc<dyn ResourceManager>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Set the fixed backoff for retryable failures
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Build the Context
    ///
    /// Fails when the rule store or resource manager was not provided.
    pub fn build(self) -> Result<Context, Error> {
        if self.node_name.is_empty() {
            return Err(Error::config("node name must not be empty"));
        }
        let nat = self
            .nat
            .ok_or_else(|| Error::config("a NAT rule store is required"))?;
        let cloud = self
            .cloud
            .ok_or_else(|| Error::config("a resource manager is required"))?;
        let store: Arc<dyn WorkloadStore> = Arc::new(PodStore::new(self.client));

        let actions = Actions::new(nat, cloud, store);
        Ok(Context {
            node_name: self.node_name,
            association: AssociationEngine::new(
                actions.clone(),
                Arc::new(AssociationRecords::new()),
                self.retry_delay,
            ),
            finalization: FinalizationEngine::new(actions),
            retry_delay: self.retry_delay,
        })
    }
}

/// Reconcile one pod
///
/// Association runs first; if it asks for a retry the pod is requeued without
/// running finalization. Otherwise finalization gets a chance to drain what
/// association could not see.
#[instrument(skip(pod, ctx), fields(pod = %pod.name_any(), namespace = %pod.namespace().unwrap_or_default()))]
pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, Error> {
    let mut workload = Workload::from_pod(&pod)?;

    if workload.host.as_deref() != Some(ctx.node_name.as_str()) {
        debug!(host = ?workload.host, "pod is not scheduled to this node");
        return Ok(Action::await_change());
    }
    if workload.external_ip.is_none() && workload.markers.is_empty() {
        return Ok(Action::await_change());
    }

    if let Some(delay) = ctx.association.reconcile(&mut workload).await? {
        return Ok(Action::requeue(delay));
    }

    match ctx.finalization.finalize(&mut workload).await {
        Ok(()) => Ok(Action::await_change()),
        Err(e) => match e.class() {
            ErrorClass::PersistenceConflict => Ok(Action::requeue(Duration::ZERO)),
            ErrorClass::Transient | ErrorClass::BenignConflict => {
                warn!(error = %e, "finalization incomplete, will retry");
                Ok(Action::requeue(ctx.retry_delay))
            }
            ErrorClass::Fatal => Err(e),
        },
    }
}

/// Error policy for the pod controller
///
/// Only unclassified failures reach this point; they are logged and retried
/// after the fixed backoff.
pub fn error_policy(pod: Arc<Pod>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        pod = %pod.name_any(),
        namespace = %pod.namespace().unwrap_or_default(),
        "reconciliation failed"
    );
    Action::requeue(ctx.retry_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    use crate::engine::fixtures::*;
    use crate::intent::MockWorkloadStore;
    use crate::nat::MockNatRuleStore;
    use crate::provider::{MockResourceManager, ProviderError};
    use crate::EXTERNAL_IP_ANNOTATION;

    const RETRY: Duration = Duration::from_secs(5);

    fn pod(external_ip: Option<&str>, pod_ip: Option<&str>, finalizers: &[&str]) -> Arc<Pod> {
        let mut annotations = BTreeMap::new();
        if let Some(ip) = external_ip {
            annotations.insert(EXTERNAL_IP_ANNOTATION.to_string(), ip.to_string());
        }
        Arc::new(Pod {
            metadata: ObjectMeta {
                name: Some("app-1".to_string()),
                namespace: Some("ns".to_string()),
                resource_version: Some("7".to_string()),
                annotations: Some(annotations),
                finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-0".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: pod_ip.map(str::to_string),
                ..Default::default()
            }),
        })
    }

    fn deleting(pod: Arc<Pod>) -> Arc<Pod> {
        let mut pod = (*pod).clone();
        pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        Arc::new(pod)
    }

    fn recording_context(journal: &Journal) -> Arc<Context> {
        Arc::new(Context::for_testing(
            "node-0",
            Actions::new(
                Arc::new(recording_nat(journal)),
                Arc::new(recording_cloud(journal)),
                Arc::new(recording_store(journal)),
            ),
            RETRY,
        ))
    }

    fn silent_context() -> Arc<Context> {
        // Mocks without expectations panic on any call
        Arc::new(Context::for_testing(
            "node-0",
            Actions::new(
                Arc::new(MockNatRuleStore::new()),
                Arc::new(MockResourceManager::new()),
                Arc::new(MockWorkloadStore::new()),
            ),
            RETRY,
        ))
    }

    // ==========================================================================
    // Story Tests: Pod lifecycle through the reconciler
    // ==========================================================================

    /// Story: a running pod asks for 20.1.2.3 and then is deleted after losing its IP
    #[tokio::test]
    async fn story_pod_lifecycle() {
        let journal = Journal::new();
        let ctx = recording_context(&journal);

        let action = reconcile(pod(Some("20.1.2.3"), Some("10.0.0.5"), &[]), ctx.clone())
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(journal.count("bind node-0 10.0.0.5 20.1.2.3"), 1);
        assert_eq!(journal.count("ensure 10.0.0.5 ns/app-1"), 1);

        // Later event: deleted, IP gone, annotation removed; markers persisted earlier
        let gone = deleting(pod(
            None,
            None,
            &[
                "podexternalip.dev/rule-10-0-0-5",
                "podexternalip.dev/bind-10-0-0-5",
            ],
        ));
        let action = reconcile(gone, ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let events = journal.events();
        let tail: Vec<&str> = events[events.len() - 4..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "unbind node-0 10.0.0.5",
                "persist rule=10.0.0.5 bind=- ready=false",
                "remove ns/app-1",
                "persist rule=- bind=- ready=false",
            ]
        );
    }

    mod builder {
        use super::*;

        fn offline_client() -> Client {
            let config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
            Client::try_from(config).unwrap()
        }

        #[tokio::test]
        async fn test_build_wires_collaborators() {
            let ctx = Context::builder(offline_client(), "node-0")
                .nat(Arc::new(MockNatRuleStore::new()))
                .resource_manager(Arc::new(MockResourceManager::new()))
                .retry_delay(Duration::from_secs(9))
                .build()
                .unwrap();

            assert_eq!(ctx.node_name, "node-0");
            assert_eq!(ctx.retry_delay, Duration::from_secs(9));
            assert!(ctx.association.records().is_empty());
        }

        #[rstest::rstest]
        #[case::empty_node("", true, true)]
        #[case::no_rule_store("node-0", false, true)]
        #[case::no_resource_manager("node-0", true, false)]
        #[tokio::test]
        async fn test_build_rejects_incomplete_setup(
            #[case] node: &str,
            #[case] with_nat: bool,
            #[case] with_cloud: bool,
        ) {
            let mut builder = Context::builder(offline_client(), node);
            if with_nat {
                builder = builder.nat(Arc::new(MockNatRuleStore::new()));
            }
            if with_cloud {
                builder = builder.resource_manager(Arc::new(MockResourceManager::new()));
            }
            assert!(matches!(builder.build(), Err(Error::Config(_))));
        }
    }

    #[tokio::test]
    async fn test_unrelated_pod_is_ignored() {
        let action = reconcile(pod(None, Some("10.0.0.5"), &["example.com/keep"]), silent_context())
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_pod_on_other_node_is_ignored() {
        let mut other = (*pod(Some("20.1.2.3"), Some("10.0.0.5"), &[])).clone();
        other.spec = Some(PodSpec {
            node_name: Some("node-9".to_string()),
            ..Default::default()
        });

        let action = reconcile(Arc::new(other), silent_context()).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_after_backoff() {
        let journal = Journal::new();
        let mut cloud = MockResourceManager::new();
        cloud.expect_bind().returning(|_, _, _| {
            Err(ProviderError::Api {
                status: 503,
                code: "ServiceUnavailable".to_string(),
                message: "try later".to_string(),
            })
        });
        let ctx = Arc::new(Context::for_testing(
            "node-0",
            Actions::new(
                Arc::new(recording_nat(&journal)),
                Arc::new(cloud),
                Arc::new(recording_store(&journal)),
            ),
            RETRY,
        ));

        let action = reconcile(pod(Some("20.1.2.3"), Some("10.0.0.5"), &[]), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(RETRY));
    }

    #[tokio::test]
    async fn test_finalization_conflict_requeues_immediately() {
        let mut store = MockWorkloadStore::new();
        store.expect_persist().returning(|_| Err(conflict()));
        let journal = Journal::new();
        let ctx = Arc::new(Context::for_testing(
            "node-0",
            Actions::new(
                Arc::new(recording_nat(&journal)),
                Arc::new(recording_cloud(&journal)),
                Arc::new(store),
            ),
            RETRY,
        ));
        let gone = deleting(pod(None, None, &["podexternalip.dev/rule-10-0-0-5"]));

        let action = reconcile(gone, ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_bad_pod_ip_goes_to_error_policy() {
        let ctx = silent_context();
        let bad = pod(Some("20.1.2.3"), Some("not-an-ip"), &[]);

        let err = reconcile(bad.clone(), ctx.clone()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_eq!(error_policy(bad, &err, ctx), Action::requeue(RETRY));
    }
}
