//! pod-external-ip - per-node controller binding cloud public IPs to pod IPs

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pod_external_ip::config::{AzureArgs, Cli, Command, ControllerArgs, LogFormat, NatArgs};
use pod_external_ip::controller::{error_policy, reconcile, Context};
use pod_external_ip::nat::{IptablesRuleStore, NatRuleStore};
use pod_external_ip::provider::{ArmClient, AzureResourceManager, InstanceMetadata};
use pod_external_ip::retry::{retry_with_backoff, RetryConfig};

/// Attempts for startup calls before giving up and letting the pod restart
const STARTUP_ATTEMPTS: u32 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.into_command() {
        Command::SetupRules(args) => run_setup_rules(args).await,
        Command::Controller(args) => run_controller(args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

/// Install the egress chains, retrying while the packet filter is busy
async fn setup_rules(store: &IptablesRuleStore, args: &NatArgs) -> anyhow::Result<()> {
    let networks = &args.local_networks.0;
    retry_with_backoff(
        &RetryConfig::with_max_attempts(STARTUP_ATTEMPTS),
        "setup_nat_chains",
        move || store.setup(networks),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to set up NAT chains: {}", e))
}

async fn run_setup_rules(args: NatArgs) -> anyhow::Result<()> {
    let store = IptablesRuleStore::new(&args.iptables_path);
    setup_rules(&store, &args).await
}

/// Resolve the subscription and resource group, asking IMDS for whatever
/// was not configured
async fn resolve_scope(arm: &ArmClient, args: &AzureArgs) -> anyhow::Result<(String, String)> {
    if let (Some(subscription), Some(group)) =
        (&args.azure_subscription_id, &args.azure_resource_group)
    {
        return Ok((subscription.clone(), group.clone()));
    }

    let metadata = retry_with_backoff(
        &RetryConfig::with_max_attempts(STARTUP_ATTEMPTS),
        "fetch_instance_metadata",
        move || InstanceMetadata::fetch(arm.imds_http(), &args.azure_imds_endpoint),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to read instance metadata: {}", e))?;

    tracing::info!(
        vm = %metadata.compute.name,
        environment = %metadata.compute.az_environment,
        "read instance metadata"
    );
    Ok((
        args.azure_subscription_id
            .clone()
            .unwrap_or(metadata.compute.subscription_id),
        args.azure_resource_group
            .clone()
            .unwrap_or(metadata.compute.resource_group_name),
    ))
}

/// Run the pod controller for this node
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let arm = ArmClient::new(args.azure.arm_config())
        .map_err(|e| anyhow::anyhow!("Failed to create resource-manager client: {}", e))?;
    let (subscription, resource_group) = resolve_scope(&arm, &args.azure).await?;
    tracing::info!(
        node = %args.node_name,
        %subscription,
        %resource_group,
        "resolved resource-manager scope"
    );

    let nat = IptablesRuleStore::new(&args.nat.iptables_path);
    setup_rules(&nat, &args.nat).await?;

    let ctx = Arc::new(
        Context::builder(client.clone(), args.node_name.clone())
            .nat(Arc::new(nat))
            .resource_manager(Arc::new(AzureResourceManager::new(
                arm,
                subscription,
                resource_group,
            )))
            .retry_delay(args.retry_delay())
            .build()?,
    );

    let pods: Api<Pod> = Api::all(client);
    let watcher = WatcherConfig::default().fields(&format!("spec.nodeName={}", args.node_name));

    tracing::info!(node = %args.node_name, "starting pod controller");
    Controller::new(pods, watcher)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Pod reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Pod reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Controller shutting down");
    Ok(())
}
