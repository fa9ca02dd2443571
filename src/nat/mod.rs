//! Egress NAT rule store
//!
//! Pods with an external IP must leave the node with their own private address
//! so the cloud can translate it to the bound public IP. The node's CNI
//! masquerades pod traffic in `nat POSTROUTING`; the chains managed here sit in
//! front of that and `ACCEPT` (skip further NAT) for associated pod IPs.
//!
//! ```text
//! POSTROUTING
//!   -j EXTERNAL-IP-LOCAL
//!        -d <local network> -j RETURN     (one per allowed destination)
//!        -j EXTERNAL-IP-EGRESS
//!             -s <pod ip> -m comment --comment <ns/name> -j ACCEPT
//!             -j RETURN
//!        -j RETURN
//! ```

mod iptables;

pub use iptables::{CommandOutput, IptablesRuleStore, IptablesRunner, SystemIptables};

#[cfg(test)]
pub use iptables::MockIptablesRunner;

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Chain that exempts local destinations before jumping to the egress chain
pub const LOCAL_CHAIN: &str = "EXTERNAL-IP-LOCAL";

/// Chain holding one accept rule per associated pod IP
pub const EGRESS_CHAIN: &str = "EXTERNAL-IP-EGRESS";

/// Rule store errors
#[derive(Debug, Error)]
pub enum NatError {
    /// The rule tool could not be started
    #[error("failed to execute {program}: {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The rule tool exited unsuccessfully
    #[error("`{command}` exited with {code:?}: {stderr}")]
    Command {
        /// Arguments passed to the tool
        command: String,
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// A rule listing could not be parsed
    #[error("unparseable rule listing: {0}")]
    Parse(String),

    /// The address family is not handled by this store
    #[error("unsupported address: {0}")]
    Unsupported(String),
}

/// Idempotent CRUD over per-workload egress rules
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NatRuleStore: Send + Sync {
    /// (Re)create the base chains with early returns for `allowed_destinations`
    ///
    /// Safe to call repeatedly; base rules are never duplicated.
    async fn setup(&self, allowed_destinations: &[IpNet]) -> Result<(), NatError>;

    /// Insert the accept rule for `local_ip` tagged with `owner`, if absent
    async fn ensure(&self, local_ip: IpAddr, owner: &str) -> Result<(), NatError>;

    /// Delete every rule tagged with `owner`, whatever its source address
    async fn remove(&self, owner: &str) -> Result<(), NatError>;
}
