//! In-memory allocation store
//!
//! Keeps the cluster table in a `BTreeMap` keyed by cluster number, plus an
//! inbound index (destination -> source) so destination claims can be
//! checked without a scan. Batch inserts are all-or-nothing and reject
//! existing keys, which mirrors a strict relational backend.

use crate::error::{ConsolidationError, Result};
use crate::record::{ClusterRecord, RelocationPair};
use crate::store::{AllocationStore, StoreStats};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Records indexed by cluster number
    records: BTreeMap<u64, ClusterRecord>,

    /// Claimed destinations: target cluster -> source cluster
    inbound: BTreeMap<u64, u64>,

    outage: Outage,
}

/// Simulated connection loss: after `healthy_ops` successful operations,
/// the next `failures` operations report the store unavailable
#[derive(Debug, Default)]
struct Outage {
    healthy_ops: AtomicU32,
    failures: AtomicU32,
}

impl Outage {
    fn check(&self, op: &str) -> Result<()> {
        if self.failures.load(Ordering::SeqCst) == 0 {
            return Ok(());
        }
        let healthy = self.healthy_ops.load(Ordering::SeqCst);
        if healthy > 0 {
            self.healthy_ops.store(healthy - 1, Ordering::SeqCst);
            return Ok(());
        }
        self.failures.fetch_sub(1, Ordering::SeqCst);
        Err(ConsolidationError::StoreUnavailable(format!(
            "simulated outage during {}",
            op
        )))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding the given records
    pub fn from_records<I>(records: I) -> Result<Self>
    where
        I: IntoIterator<Item = ClusterRecord>,
    {
        let mut store = Self::new();
        let records: Vec<ClusterRecord> = records.into_iter().collect();
        store.insert_batch(&records)?;
        Ok(store)
    }

    /// Create a fully recorded store with one flag per cluster, from 0
    pub fn from_flags(flags: &[bool]) -> Self {
        let mut store = Self::new();
        for (cluster, &allocated) in flags.iter().enumerate() {
            let cluster = cluster as u64;
            let record = if allocated {
                ClusterRecord::allocated(cluster)
            } else {
                ClusterRecord::free(cluster)
            };
            store.records.insert(cluster, record);
        }
        store
    }

    /// Make the store unavailable for `failures` operations once
    /// `healthy_ops` more operations have succeeded
    pub fn inject_outage(&self, healthy_ops: u32, failures: u32) {
        self.outage.healthy_ops.store(healthy_ops, Ordering::SeqCst);
        self.outage.failures.store(failures, Ordering::SeqCst);
    }

    /// Snapshot of every record, ascending
    pub fn records(&self) -> Vec<ClusterRecord> {
        self.records.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl AllocationStore for MemoryStore {
    fn scan(&self, from: u64, limit: usize) -> Result<Vec<ClusterRecord>> {
        self.outage.check("scan")?;
        Ok(self
            .records
            .range(from..)
            .take(limit)
            .map(|(_, record)| *record)
            .collect())
    }

    fn get(&self, cluster: u64) -> Result<Option<ClusterRecord>> {
        self.outage.check("get")?;
        Ok(self.records.get(&cluster).copied())
    }

    fn insert_batch(&mut self, records: &[ClusterRecord]) -> Result<usize> {
        self.outage.check("insert")?;

        // Validate the whole batch before touching the table
        let mut seen = std::collections::BTreeSet::new();
        let mut claimed = std::collections::BTreeSet::new();
        for record in records {
            if self.records.contains_key(&record.cluster) || !seen.insert(record.cluster) {
                return Err(ConsolidationError::ConstraintViolation {
                    cluster: record.cluster,
                });
            }
            if let Some(target) = record.consolidated_target {
                if self.inbound.contains_key(&target) || !claimed.insert(target) {
                    return Err(ConsolidationError::invariant(
                        "destination already claimed",
                        &[record.cluster, target],
                    ));
                }
            }
        }

        for record in records {
            if let Some(target) = record.consolidated_target {
                self.inbound.insert(target, record.cluster);
            }
            self.records.insert(record.cluster, *record);
        }
        Ok(records.len())
    }

    fn unplanned_sources(&self, from: u64, limit: usize) -> Result<Vec<u64>> {
        self.outage.check("unplanned_sources")?;
        Ok(self
            .records
            .range(from..)
            .filter(|(_, record)| record.is_unplanned_source())
            .take(limit)
            .map(|(&cluster, _)| cluster)
            .collect())
    }

    fn count_between(&self, from: u64, to: u64) -> Result<u64> {
        self.outage.check("count_between")?;
        if from >= to {
            return Ok(0);
        }
        Ok(self.records.range(from..to).count() as u64)
    }

    fn first_vacant_destination(&self, from: u64) -> Result<Option<u64>> {
        self.outage.check("first_vacant_destination")?;
        Ok(self
            .records
            .range(from..)
            .find(|(cluster, record)| record.is_vacant() && !self.inbound.contains_key(cluster))
            .map(|(&cluster, _)| cluster))
    }

    fn set_target(&mut self, cluster: u64, target: u64) -> Result<()> {
        self.outage.check("set_target")?;

        let record = self
            .records
            .get(&cluster)
            .copied()
            .ok_or(ConsolidationError::RecordNotFound(cluster))?;

        match record.consolidated_target {
            Some(existing) if existing == target => return Ok(()),
            Some(existing) => {
                return Err(ConsolidationError::invariant(
                    "source already has a different destination",
                    &[cluster, existing, target],
                ))
            }
            None => {}
        }

        if !record.allocated {
            return Err(ConsolidationError::invariant(
                "source cluster is not allocated",
                &[cluster],
            ));
        }

        let destination = self.records.get(&target).ok_or_else(|| {
            ConsolidationError::invariant("destination has no record", &[cluster, target])
        })?;
        if target == cluster || !destination.is_vacant() {
            return Err(ConsolidationError::invariant(
                "destination still holds live data",
                &[cluster, target],
            ));
        }
        if let Some(&claimer) = self.inbound.get(&target) {
            return Err(ConsolidationError::invariant(
                "destination already claimed",
                &[claimer, cluster, target],
            ));
        }

        self.inbound.insert(target, cluster);
        if let Some(record) = self.records.get_mut(&cluster) {
            record.consolidated_target = Some(target);
        }
        Ok(())
    }

    fn mark_applied(&mut self, cluster: u64) -> Result<()> {
        self.outage.check("mark_applied")?;

        let record = self
            .records
            .get_mut(&cluster)
            .ok_or(ConsolidationError::RecordNotFound(cluster))?;
        if record.consolidated_target.is_none() {
            return Err(ConsolidationError::invariant(
                "no planned relocation to confirm",
                &[cluster],
            ));
        }
        record.applied = true;
        Ok(())
    }

    fn pending_relocations(&self) -> Result<Vec<RelocationPair>> {
        self.outage.check("pending_relocations")?;
        let mut pending: Vec<RelocationPair> = self
            .records
            .values()
            .filter(|record| !record.applied)
            .filter_map(|record| record.relocation())
            .collect();
        pending.sort_by_key(|pair| pair.destination);
        Ok(pending)
    }

    fn stats(&self) -> Result<StoreStats> {
        self.outage.check("stats")?;
        let mut stats = StoreStats {
            records: self.records.len() as u64,
            ..StoreStats::default()
        };
        for record in self.records.values() {
            if record.allocated {
                stats.allocated += 1;
            }
            if record.is_planned() {
                stats.planned += 1;
                if record.applied {
                    stats.applied += 1;
                }
            }
        }
        Ok(stats)
    }
}
