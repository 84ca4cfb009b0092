//! Shared fixtures for integration tests

#![allow(dead_code)]

use cluster_consolidator::{
    ApplyState, CancellationToken, ConsolidationError, RelocationExecutor, RelocationPair, Result,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// In-memory stand-in for the disk: each allocated cluster holds a payload
/// tagged with the cluster it started in
///
/// Relocations refuse to overwrite live data or to move from an empty slot,
/// so any plan that violates those rules fails the test.
#[derive(Debug, Default)]
pub struct SimulatedMedium {
    slots: BTreeMap<u64, u64>,
    log: Vec<RelocationPair>,
    cancel_after: Option<(usize, CancellationToken)>,
    crash_at: Option<usize>,
}

impl SimulatedMedium {
    pub fn from_flags(flags: &[bool]) -> Self {
        let slots = flags
            .iter()
            .enumerate()
            .filter(|(_, &allocated)| allocated)
            .map(|(cluster, _)| (cluster as u64, cluster as u64))
            .collect();
        SimulatedMedium {
            slots,
            ..Self::default()
        }
    }

    /// Fire `token` once `count` relocations have completed
    pub fn cancel_after(&mut self, count: usize, token: CancellationToken) {
        self.cancel_after = Some((count, token));
    }

    /// Move the data of relocation number `count` (1-based), then fail as if
    /// the process died before confirming it
    pub fn crash_after_move(&mut self, count: usize) {
        self.crash_at = Some(count);
    }

    pub fn relocations(&self) -> &[RelocationPair] {
        &self.log
    }

    pub fn payload_at(&self, cluster: u64) -> Option<u64> {
        self.slots.get(&cluster).copied()
    }

    /// Occupied clusters, ascending
    pub fn occupied(&self) -> Vec<u64> {
        self.slots.keys().copied().collect()
    }

    /// All payloads at/above `first_cluster` sit in one run starting there
    pub fn is_compacted(&self, first_cluster: u64) -> bool {
        self.slots
            .range(first_cluster..)
            .enumerate()
            .all(|(offset, (&cluster, _))| cluster == first_cluster + offset as u64)
    }
}

impl RelocationExecutor for SimulatedMedium {
    fn relocate(&mut self, pair: RelocationPair) -> Result<()> {
        if self.slots.contains_key(&pair.destination) {
            return Err(ConsolidationError::Executor(format!(
                "relocation {} would overwrite live data",
                pair
            )));
        }
        let Some(payload) = self.slots.remove(&pair.source) else {
            return Err(ConsolidationError::Executor(format!(
                "relocation {} reads an empty cluster",
                pair
            )));
        };
        self.slots.insert(pair.destination, payload);
        self.log.push(pair);

        if let Some((count, token)) = &self.cancel_after {
            if self.log.len() == *count {
                token.cancel();
            }
        }
        if self.crash_at == Some(self.log.len()) {
            self.crash_at = None;
            return Err(ConsolidationError::Executor(format!(
                "crashed after moving {}",
                pair
            )));
        }
        Ok(())
    }

    fn verify(&self, pair: RelocationPair) -> Result<ApplyState> {
        Ok(
            match (
                self.slots.contains_key(&pair.source),
                self.slots.contains_key(&pair.destination),
            ) {
                (true, false) => ApplyState::NotApplied,
                (false, true) => ApplyState::Applied,
                _ => ApplyState::Unknown,
            },
        )
    }
}

/// Apply `pairs` to a copy of `flags`, checking each move reads a full
/// cluster and writes an empty one
pub fn apply(flags: &[bool], pairs: &[RelocationPair]) -> std::result::Result<Vec<bool>, String> {
    let mut flags = flags.to_vec();
    for pair in pairs {
        let (src, dst) = (pair.source as usize, pair.destination as usize);
        if !flags[src] {
            return Err(format!("{} moves a free cluster", pair));
        }
        if flags[dst] {
            return Err(format!("{} overwrites an allocated cluster", pair));
        }
        flags[src] = false;
        flags[dst] = true;
    }
    Ok(flags)
}

/// Random allocation maps, including empty and fully allocated ones
pub fn allocation_flags() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 0..300)
}
