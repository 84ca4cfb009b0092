//! Bulk compaction planner
//!
//! Two forward cursors over a materialized table: `dst` seeks the next free
//! slot, `src` the next allocated slot above it. Each emitted pair updates
//! the in-memory copy (destination allocated, source free) so later scans
//! see the vacated slot. Both cursors only move forward, so every slot is
//! visited at most once per cursor.

use crate::error::{ConsolidationError, Result};
use crate::planner::PlanState;
use crate::record::RelocationPair;
use crate::table::AllocationTable;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BulkPlan {
    /// Working copy, updated as pairs are emitted
    table: AllocationTable,

    /// Destination cursor
    dst: u64,

    /// Source cursor
    src: u64,

    state: PlanState,

    /// Pair pulled while resuming that belongs to the caller
    pending: Option<RelocationPair>,

    emitted: u64,
}

impl BulkPlan {
    /// Plan compaction of `table`, never writing below `first_cluster`
    pub fn new(table: AllocationTable, first_cluster: u64) -> Self {
        BulkPlan {
            table,
            dst: first_cluster,
            src: first_cluster.saturating_add(1),
            state: PlanState::Scanning,
            pending: None,
            emitted: 0,
        }
    }

    pub fn state(&self) -> PlanState {
        self.state
    }

    /// Pairs produced so far, including any skipped by [`skip_planned`](Self::skip_planned)
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Allocation state after the pairs produced so far
    pub fn table(&self) -> &AllocationTable {
        &self.table
    }

    /// Fast-forward past pairs a previous run already recorded
    ///
    /// `planned` maps source -> destination as read back from the store.
    /// The plan is a pure function of the allocation flags, so the recorded
    /// pairs must be exactly a prefix of the re-derived sequence. Returns the
    /// number of pairs skipped.
    pub fn skip_planned(&mut self, planned: &BTreeMap<u64, u64>) -> Result<u64> {
        let mut skipped = BTreeSet::new();

        while skipped.len() < planned.len() {
            let Some(pair) = self.next() else {
                break;
            };
            match planned.get(&pair.source) {
                Some(&recorded) if recorded == pair.destination => {
                    skipped.insert(pair.source);
                }
                Some(&recorded) => {
                    return Err(ConsolidationError::invariant(
                        "recorded destination differs from the re-derived plan",
                        &[pair.source, recorded, pair.destination],
                    ));
                }
                None => {
                    self.pending = Some(pair);
                    break;
                }
            }
        }

        if skipped.len() != planned.len() {
            let stray: Vec<u64> = planned
                .keys()
                .filter(|source| !skipped.contains(*source))
                .copied()
                .collect();
            return Err(ConsolidationError::invariant(
                "recorded destinations are not a prefix of the plan",
                &stray,
            ));
        }

        debug!("Resumed bulk plan after {} recorded pairs", skipped.len());
        Ok(skipped.len() as u64)
    }

    fn advance(&mut self) -> Option<RelocationPair> {
        if self.state == PlanState::Done {
            return None;
        }
        self.state = PlanState::Scanning;

        let Some(dst) = self.table.next_free(self.dst) else {
            self.state = PlanState::Done;
            return None;
        };
        // dst and src crossed: nothing allocated above the lowest free slot
        let Some(src) = self.table.next_allocated(self.src.max(dst + 1)) else {
            self.state = PlanState::Done;
            return None;
        };

        self.state = PlanState::Emitting;
        self.table.mark(dst, true);
        self.table.mark(src, false);
        self.dst = dst + 1;
        self.src = src + 1;
        self.emitted += 1;

        Some(RelocationPair::new(src, dst))
    }
}

impl Iterator for BulkPlan {
    type Item = RelocationPair;

    fn next(&mut self) -> Option<RelocationPair> {
        if let Some(pair) = self.pending.take() {
            return Some(pair);
        }
        self.advance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sample() -> AllocationTable {
        // allocated = {0,1,3,4,7,9}, free = {2,5,6,8}
        AllocationTable::from_flags(&[
            true, true, false, true, true, false, false, true, false, true,
        ])
    }

    fn pairs(list: &[(u64, u64)]) -> Vec<RelocationPair> {
        list.iter()
            .map(|&(src, dst)| RelocationPair::new(src, dst))
            .collect()
    }

    #[test]
    fn test_sample_plan() {
        let mut plan = BulkPlan::new(sample(), 0);
        let emitted: Vec<RelocationPair> = plan.by_ref().collect();

        assert_eq!(emitted, pairs(&[(3, 2), (4, 3), (7, 4), (9, 5)]));
        assert_eq!(plan.state(), PlanState::Done);
        assert!(plan.table().is_compacted(0));
        assert_eq!(plan.table().next_free(0), Some(6));

        let destinations: HashSet<u64> = emitted.iter().map(|p| p.destination).collect();
        assert_eq!(destinations.len(), emitted.len());
        let sources: HashSet<u64> = emitted.iter().map(|p| p.source).collect();
        assert_eq!(sources, HashSet::from([3, 4, 7, 9]));
    }

    #[test]
    fn test_state_transitions() {
        let mut plan = BulkPlan::new(sample(), 0);
        assert_eq!(plan.state(), PlanState::Scanning);
        plan.next();
        assert_eq!(plan.state(), PlanState::Emitting);
        assert_eq!(plan.by_ref().count(), 3);
        assert_eq!(plan.state(), PlanState::Done);
        assert_eq!(plan.next(), None);
    }

    #[test]
    fn test_already_compacted_is_empty() {
        let table = AllocationTable::from_flags(&[true, true, true, false, false]);
        assert_eq!(BulkPlan::new(table, 0).count(), 0);

        let full = AllocationTable::from_flags(&[true; 70]);
        assert_eq!(BulkPlan::new(full, 0).count(), 0);

        assert_eq!(BulkPlan::new(AllocationTable::new(0), 0).count(), 0);
    }

    #[test]
    fn test_reserved_low_clusters_untouched() {
        // Free slot 1 sits below the first eligible cluster
        let table = AllocationTable::from_flags(&[true, false, true, false, true]);
        let emitted: Vec<RelocationPair> = BulkPlan::new(table, 2).collect();
        assert_eq!(emitted, pairs(&[(4, 3)]));
    }

    #[test]
    fn test_emits_one_pair_per_allocated_cluster_above_lowest_free() {
        let mut flags = vec![false; 300];
        for cluster in [5, 63, 64, 65, 128, 200, 299] {
            flags[cluster] = true;
        }
        let table = AllocationTable::from_flags(&flags);
        let expected = table.allocated_from(table.next_free(0).unwrap());

        let mut plan = BulkPlan::new(table, 0);
        let emitted: Vec<RelocationPair> = plan.by_ref().collect();
        assert_eq!(emitted.len() as u64, expected);
        assert_eq!(
            emitted.iter().map(|p| p.destination).collect::<Vec<_>>(),
            (0..7).collect::<Vec<_>>()
        );
        assert!(plan.table().is_compacted(0));
    }

    #[test]
    fn test_skip_planned_resumes_mid_plan() {
        let planned = BTreeMap::from([(3, 2), (4, 3)]);
        let mut plan = BulkPlan::new(sample(), 0);

        assert_eq!(plan.skip_planned(&planned).unwrap(), 2);
        let rest: Vec<RelocationPair> = plan.collect();
        assert_eq!(rest, pairs(&[(7, 4), (9, 5)]));
    }

    #[test]
    fn test_skip_planned_everything() {
        let planned = BTreeMap::from([(3, 2), (4, 3), (7, 4), (9, 5)]);
        let mut plan = BulkPlan::new(sample(), 0);
        assert_eq!(plan.skip_planned(&planned).unwrap(), 4);
        assert_eq!(plan.next(), None);
    }

    #[test]
    fn test_skip_planned_rejects_mismatch() {
        let planned = BTreeMap::from([(3, 5)]);
        let result = BulkPlan::new(sample(), 0).skip_planned(&planned);
        assert!(matches!(
            result,
            Err(ConsolidationError::PlanInvariantViolation { ref clusters, .. }) if clusters == &vec![3, 5, 2]
        ));
    }

    #[test]
    fn test_skip_planned_rejects_gap() {
        // (4,3) recorded without (3,2) before it
        let planned = BTreeMap::from([(4, 3)]);
        let result = BulkPlan::new(sample(), 0).skip_planned(&planned);
        assert!(matches!(
            result,
            Err(ConsolidationError::PlanInvariantViolation { ref clusters, .. }) if clusters == &vec![4]
        ));
    }
}
