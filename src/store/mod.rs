//! Allocation store backends
//!
//! The planners only need a key-ordered table of [`ClusterRecord`]s with
//! range scans, batched inserts and single-row updates. Two backends ship
//! with the crate:
//! - [`sqlite::SqliteStore`] - persistent, one `cluster` table
//! - [`memory::MemoryStore`] - ordered in-memory map, used for planning
//!   dry runs and tests

pub mod memory;
pub mod sqlite;

use crate::error::Result;
use crate::record::{ClusterRecord, RelocationPair};
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Row counts of an allocation store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub records: u64,
    pub allocated: u64,
    /// Records with a destination recorded
    pub planned: u64,
    /// Planned records whose relocation was confirmed
    pub applied: u64,
}

/// Allocation store trait
///
/// Defines the queries and updates the consolidation core issues against
/// the cluster table. Every method may block on I/O; transient failures
/// surface as [`ConsolidationError::StoreUnavailable`](crate::ConsolidationError::StoreUnavailable).
///
/// The planner assumes single-writer access: two consolidation runs against
/// one store must be kept apart by the caller.
pub trait AllocationStore {
    /// Up to `limit` records with `cluster >= from`, ascending
    fn scan(&self, from: u64, limit: usize) -> Result<Vec<ClusterRecord>>;

    /// Fetch a single record
    fn get(&self, cluster: u64) -> Result<Option<ClusterRecord>>;

    /// Insert new records in one request
    ///
    /// Returns how many records were inserted. A backend either skips
    /// records that already exist or rejects the whole batch with
    /// `ConstraintViolation`.
    fn insert_batch(&mut self, records: &[ClusterRecord]) -> Result<usize>;

    /// Number of records with `from <= cluster < to`
    fn count_between(&self, from: u64, to: u64) -> Result<u64>;

    /// Up to `limit` allocated clusters with no destination yet and
    /// `cluster >= from`, ascending. This is the resumable work queue.
    fn unplanned_sources(&self, from: u64, limit: usize) -> Result<Vec<u64>>;

    /// Lowest cluster `>= from` that can receive data: free or already
    /// vacated, and not yet claimed as another record's destination
    fn first_vacant_destination(&self, from: u64) -> Result<Option<u64>>;

    /// Record `target` as the destination of `cluster`
    ///
    /// Succeeds without change when the same target is already recorded.
    /// Fails with `PlanInvariantViolation` when `cluster` already has a
    /// different target, is not allocated, or when `target` is occupied or
    /// claimed by another record.
    fn set_target(&mut self, cluster: u64, target: u64) -> Result<()>;

    /// Mark the planned relocation of `cluster` as physically applied
    fn mark_applied(&mut self, cluster: u64) -> Result<()>;

    /// Planned relocations not yet confirmed, in destination order
    fn pending_relocations(&self) -> Result<Vec<RelocationPair>>;

    fn stats(&self) -> Result<StoreStats>;

    /// First record with `cluster >= from`
    fn first_record_from(&self, from: u64) -> Result<Option<ClusterRecord>> {
        Ok(self.scan(from, 1)?.into_iter().next())
    }

    /// First record with `cluster > after`
    fn next_record_after(&self, after: u64) -> Result<Option<ClusterRecord>> {
        match after.checked_add(1) {
            Some(from) => self.first_record_from(from),
            None => Ok(None),
        }
    }

    /// Lowest unplanned allocated cluster `>= from`
    fn first_unplanned_source(&self, from: u64) -> Result<Option<u64>> {
        Ok(self.unplanned_sources(from, 1)?.into_iter().next())
    }
}

impl<S: AllocationStore + ?Sized> AllocationStore for &mut S {
    fn scan(&self, from: u64, limit: usize) -> Result<Vec<ClusterRecord>> {
        (**self).scan(from, limit)
    }

    fn get(&self, cluster: u64) -> Result<Option<ClusterRecord>> {
        (**self).get(cluster)
    }

    fn insert_batch(&mut self, records: &[ClusterRecord]) -> Result<usize> {
        (**self).insert_batch(records)
    }

    fn count_between(&self, from: u64, to: u64) -> Result<u64> {
        (**self).count_between(from, to)
    }

    fn unplanned_sources(&self, from: u64, limit: usize) -> Result<Vec<u64>> {
        (**self).unplanned_sources(from, limit)
    }

    fn first_vacant_destination(&self, from: u64) -> Result<Option<u64>> {
        (**self).first_vacant_destination(from)
    }

    fn set_target(&mut self, cluster: u64, target: u64) -> Result<()> {
        (**self).set_target(cluster, target)
    }

    fn mark_applied(&mut self, cluster: u64) -> Result<()> {
        (**self).mark_applied(cluster)
    }

    fn pending_relocations(&self) -> Result<Vec<RelocationPair>> {
        (**self).pending_relocations()
    }

    fn stats(&self) -> Result<StoreStats> {
        (**self).stats()
    }
}
