//! Command line and environment configuration
//!
//! Every option can also be set through the environment, which is how the
//! daemonset manifest configures the controller.

use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use ipnet::IpNet;

use crate::provider::{ArmConfig, IMDS_ENDPOINT};
use crate::DEFAULT_RETRY_DELAY_SECS;

/// pod-external-ip - bind cloud public IPs to pod IPs on the local node
#[derive(Parser, Debug)]
#[command(name = "pod-external-ip", version, about, long_about = None)]
pub struct Cli {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    /// Mode to run in (defaults to `controller`)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Watch pods on this node and reconcile their external IPs
    Controller(ControllerArgs),

    /// Install the egress chains and exit
    ///
    /// Intended for an init container so the chains exist before any pod
    /// traffic is routed through them.
    SetupRules(NatArgs),
}

/// Packet-filter options
#[derive(Args, Debug, Clone)]
pub struct NatArgs {
    /// Destinations that are never translated (cluster and VNet ranges)
    ///
    /// Separated by commas, semicolons or whitespace.
    #[arg(long, env = "LOCAL_NETWORKS", value_parser = parse_networks, default_value = "")]
    pub local_networks: Networks,

    /// iptables binary to invoke
    #[arg(long, env = "IPTABLES_PATH", default_value = "iptables")]
    pub iptables_path: String,
}

/// Controller options
#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Name of the node this instance runs on (the VM name)
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Seconds to wait before retrying a failed step
    #[arg(long, env = "RETRY_DELAY_SECS", default_value_t = DEFAULT_RETRY_DELAY_SECS)]
    pub retry_delay_secs: u64,

    #[allow(missing_docs)]
    #[command(flatten)]
    pub nat: NatArgs,

    #[allow(missing_docs)]
    #[command(flatten)]
    pub azure: AzureArgs,
}

/// Azure resource-manager options
///
/// Subscription and resource group default to the values reported by the
/// instance metadata service.
#[derive(Args, Debug, Clone)]
pub struct AzureArgs {
    /// Subscription holding the node VMs and public IPs
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID")]
    pub azure_subscription_id: Option<String>,

    /// Resource group holding the node VMs, NICs and public IPs
    #[arg(long, env = "AZURE_RESOURCE_GROUP")]
    pub azure_resource_group: Option<String>,

    /// Client id of a user-assigned managed identity
    #[arg(long, env = "AZURE_CLIENT_ID")]
    pub azure_client_id: Option<String>,

    /// Resource-manager endpoint
    #[arg(
        long,
        env = "AZURE_RESOURCE_MANAGER_ENDPOINT",
        default_value = "https://management.azure.com"
    )]
    pub azure_resource_manager_endpoint: String,

    /// Instance metadata endpoint
    #[arg(long, env = "AZURE_IMDS_ENDPOINT", default_value = IMDS_ENDPOINT)]
    pub azure_imds_endpoint: String,

    /// Upper bound on waiting for a long-running operation, in seconds
    #[arg(long, env = "AZURE_OPERATION_TIMEOUT_SECS", default_value_t = 300)]
    pub azure_operation_timeout_secs: u64,

    /// Delay between long-running operation polls, in seconds
    #[arg(long, env = "AZURE_POLL_INTERVAL_SECS", default_value_t = 2)]
    pub azure_poll_interval_secs: u64,
}

impl Cli {
    /// Selected mode; without a subcommand the controller is configured
    /// from the environment alone
    pub fn into_command(self) -> Command {
        self.command.unwrap_or_else(|| {
            Command::Controller(ControllerArgs::parse_from(["pod-external-ip"]))
        })
    }
}

impl ControllerArgs {
    /// Fixed backoff for retryable failures
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl AzureArgs {
    /// Resource-manager client settings
    pub fn arm_config(&self) -> ArmConfig {
        ArmConfig {
            endpoint: self.azure_resource_manager_endpoint.clone(),
            imds_endpoint: self.azure_imds_endpoint.clone(),
            client_id: self.azure_client_id.clone().filter(|id| !id.is_empty()),
            poll_interval: Duration::from_secs(self.azure_poll_interval_secs),
            operation_timeout: Duration::from_secs(self.azure_operation_timeout_secs),
            ..ArmConfig::default()
        }
    }
}

/// Parsed list of local destination networks
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Networks(pub Vec<IpNet>);

/// Parse a list of CIDRs or bare addresses
///
/// Bare addresses become host routes (`/32` or `/128`).
pub fn parse_networks(value: &str) -> Result<Networks, String> {
    value
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNet>()
                .or_else(|_| s.parse::<std::net::IpAddr>().map(IpNet::from))
                .map_err(|_| format!("'{s}' is not a network or address"))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Networks)
}
