//! Cluster records and relocation pairs

use serde::{Deserialize, Serialize};
use std::fmt;

/// One row of the allocation table
///
/// `consolidated_target` lives on the *source* record: it names the
/// destination cluster this record's contents are relocated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// Cluster number (unique key)
    pub cluster: u64,

    /// True when the cluster holds live data
    pub allocated: bool,

    /// Destination chosen by the planner, once planned
    pub consolidated_target: Option<u64>,

    /// Set once the executor confirmed the relocation
    pub applied: bool,
}

impl ClusterRecord {
    pub fn free(cluster: u64) -> Self {
        ClusterRecord {
            cluster,
            allocated: false,
            consolidated_target: None,
            applied: false,
        }
    }

    pub fn allocated(cluster: u64) -> Self {
        ClusterRecord {
            allocated: true,
            ..Self::free(cluster)
        }
    }

    /// Has a destination already been recorded for this cluster
    pub fn is_planned(&self) -> bool {
        self.consolidated_target.is_some()
    }

    /// Whether the record still needs relocating
    pub fn is_unplanned_source(&self) -> bool {
        self.allocated && self.consolidated_target.is_none()
    }

    /// Whether the cluster can take relocated data, ignoring inbound claims
    pub fn is_vacant(&self) -> bool {
        !self.allocated || self.consolidated_target.is_some()
    }

    /// Planned relocation for this record, if any
    pub fn relocation(&self) -> Option<RelocationPair> {
        self.consolidated_target
            .map(|target| RelocationPair::new(self.cluster, target))
    }
}

/// A planned data move from `source` to `destination`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelocationPair {
    /// Allocated cluster being vacated
    pub source: u64,
    /// Free (or already vacated) cluster receiving the data
    pub destination: u64,
}

impl RelocationPair {
    pub fn new(source: u64, destination: u64) -> Self {
        RelocationPair {
            source,
            destination,
        }
    }
}

impl fmt::Display for RelocationPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}
