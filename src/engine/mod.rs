//! Association and finalization state machines
//!
//! [`AssociationEngine`] drives a workload toward "rule installed and public IP
//! bound for the current pod IP", or unwinds it when the pod is going away.
//! [`FinalizationEngine`] is the deletion-time safety net that drains whatever
//! markers remain once the pod has lost its IP.

mod actions;
mod association;
mod finalization;

pub use actions::Actions;
pub use association::AssociationEngine;
pub use finalization::FinalizationEngine;

use std::net::IpAddr;

use dashmap::DashMap;

use crate::intent::WorkloadId;

/// In-memory record of the last fully associated pod IP per workload
///
/// Only used to skip redundant work within one process lifetime. Losing it
/// is safe: markers on the pod are authoritative.
#[derive(Debug, Default)]
pub struct AssociationRecords {
    inner: DashMap<WorkloadId, IpAddr>,
}

impl AssociationRecords {
    /// Create an empty record set
    pub fn new() -> Self {
        Self::default()
    }

    /// Last fully associated IP for `id`
    pub fn get(&self, id: &WorkloadId) -> Option<IpAddr> {
        self.inner.get(id).map(|entry| *entry.value())
    }

    /// Record a completed association
    pub fn record(&self, id: &WorkloadId, local_ip: IpAddr) {
        self.inner.insert(id.clone(), local_ip);
    }

    /// Drop the record for `id`
    pub fn forget(&self, id: &WorkloadId) {
        self.inner.remove(id);
    }

    /// Number of recorded workloads
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when nothing is recorded
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
