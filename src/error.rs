//! Error types for the external-IP controller

use std::fmt;

use thiserror::Error;

use crate::intent::WorkloadId;
use crate::nat::NatError;
use crate::provider::ProviderError;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cloud resource-manager error
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Packet-filter rule error
    #[error("nat error: {0}")]
    Nat(#[from] NatError),

    /// Malformed pod data (pod IP, host assignment)
    #[error("validation error: {0}")]
    Validation(String),

    /// Invalid process configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A failure while driving one step for one workload
    #[error("{workload}: {step} failed: {source}")]
    Step {
        /// Workload being reconciled
        workload: WorkloadId,
        /// Step that failed
        step: Step,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// How the reconcile loop should react to this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Kube(kube::Error::Api(ae)) if ae.code == 409 => ErrorClass::PersistenceConflict,
            Error::Kube(_) => ErrorClass::Fatal,
            Error::Provider(e) if e.is_benign_conflict() => ErrorClass::BenignConflict,
            Error::Provider(_) => ErrorClass::Transient,
            Error::Nat(_) => ErrorClass::Transient,
            Error::Validation(_) | Error::Config(_) => ErrorClass::Fatal,
            Error::Step { source, .. } => source.class(),
        }
    }

    /// Step that failed, if the error carries one
    pub fn step(&self) -> Option<Step> {
        match self {
            Error::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// Retry classes for reconcile failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// External call failed; retry after the fixed backoff, markers kept
    Transient,
    /// The binding cannot succeed as requested but needs no retry
    BenignConflict,
    /// Optimistic-concurrency failure writing the pod back; retry immediately
    PersistenceConflict,
    /// Surfaced to the dispatcher
    Fatal,
}

/// Steps of the association lifecycle, used to label failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Writing markers and annotations back to the pod
    PersistMarkers,
    /// Installing the egress NAT rule
    InstallRule,
    /// Removing the egress NAT rule
    RemoveRule,
    /// Binding the public IP on the host interface
    CloudBind,
    /// Unbinding the public IP from the host interface
    CloudUnbind,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::PersistMarkers => "persist markers",
            Step::InstallRule => "install rule",
            Step::RemoveRule => "remove rule",
            Step::CloudBind => "cloud bind",
            Step::CloudUnbind => "cloud unbind",
        };
        f.write_str(s)
    }
}

/// Attach workload identity and the failing step to a result
pub trait StepContext<T> {
    /// Wrap the error (if any) in [`Error::Step`]
    fn during(self, workload: &WorkloadId, step: Step) -> crate::Result<T>;
}

impl<T, E> StepContext<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn during(self, workload: &WorkloadId, step: Step) -> crate::Result<T> {
        self.map_err(|e| Error::Step {
            workload: workload.clone(),
            step,
            source: Box::new(e.into()),
        })
    }
}
