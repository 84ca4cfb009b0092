//! Gap-fill bootstrapper
//!
//! An imported table usually records only allocated clusters. The streaming
//! planner and the store's destination checks need a record for every
//! cluster, so this module inserts explicit free records for the missing
//! cluster numbers of a range, in fixed-size batches.
//!
//! Two strategies:
//! - [`GapFiller::fill_gaps`] walks the existing records page by page and
//!   inserts only what is missing
//! - [`GapFiller::fill_range`] inserts every cluster of the range and lets
//!   the store skip or reject the ones that exist
//!
//! Both are idempotent: running either twice leaves the same records as
//! running it once.

use crate::config::RetryPolicy;
use crate::error::{ConsolidationError, Result};
use crate::record::ClusterRecord;
use crate::retry::with_backoff;
use crate::store::AllocationStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use tracing::{debug, info, warn};

/// Outcome of a bootstrap pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapSummary {
    /// Free records written
    pub inserted: u64,

    /// Clusters in the range that already had a record
    pub already_present: u64,

    /// Insert requests issued
    pub batches: u64,
}

pub struct GapFiller {
    batch_size: usize,
    page_size: usize,
    retry: RetryPolicy,
}

impl GapFiller {
    pub fn new(batch_size: usize, page_size: usize) -> Self {
        GapFiller {
            batch_size: batch_size.max(1),
            page_size: page_size.max(1),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Insert free records for every unrecorded cluster in `range`
    pub fn fill_gaps<S: AllocationStore + ?Sized>(
        &self,
        store: &mut S,
        range: RangeInclusive<u64>,
    ) -> Result<BootstrapSummary> {
        let (low, high) = range.into_inner();
        let mut summary = BootstrapSummary::default();
        if low > high {
            return Ok(summary);
        }
        info!("Filling gaps in clusters {}..={}", low, high);

        let mut batch = Vec::with_capacity(self.batch_size);
        let mut cursor = low;
        let mut reached_high = false;

        'pages: loop {
            let page = with_backoff(&self.retry, "scan records", || {
                store.scan(cursor, self.page_size)
            })?;
            let page_len = page.len();

            for record in page {
                if record.cluster > high {
                    break 'pages;
                }
                if record.cluster > cursor {
                    self.push_range(store, &mut batch, cursor, record.cluster - 1, &mut summary)?;
                }
                summary.already_present += 1;
                if record.cluster == high {
                    reached_high = true;
                    break 'pages;
                }
                cursor = record.cluster + 1;
            }

            if page_len < self.page_size {
                break;
            }
        }

        if !reached_high {
            self.push_range(store, &mut batch, cursor, high, &mut summary)?;
        }
        self.flush(store, &mut batch, &mut summary)?;

        info!(
            "Gap fill done: {} free records inserted, {} already present, {} batches",
            summary.inserted, summary.already_present, summary.batches
        );
        Ok(summary)
    }

    /// Insert a free record for every cluster in `range`, tolerating
    /// clusters that already exist
    pub fn fill_range<S: AllocationStore + ?Sized>(
        &self,
        store: &mut S,
        range: RangeInclusive<u64>,
    ) -> Result<BootstrapSummary> {
        let (low, high) = range.into_inner();
        let mut summary = BootstrapSummary::default();
        if low > high {
            return Ok(summary);
        }
        info!("Inserting free records for clusters {}..={}", low, high);

        let mut batch = Vec::with_capacity(self.batch_size);
        self.push_range(store, &mut batch, low, high, &mut summary)?;
        self.flush(store, &mut batch, &mut summary)?;

        info!(
            "Range fill done: {} free records inserted, {} already present, {} batches",
            summary.inserted, summary.already_present, summary.batches
        );
        Ok(summary)
    }

    fn push_range<S: AllocationStore + ?Sized>(
        &self,
        store: &mut S,
        batch: &mut Vec<ClusterRecord>,
        first: u64,
        last: u64,
        summary: &mut BootstrapSummary,
    ) -> Result<()> {
        for cluster in first..=last {
            batch.push(ClusterRecord::free(cluster));
            if batch.len() >= self.batch_size {
                self.flush(store, batch, summary)?;
            }
        }
        Ok(())
    }

    fn flush<S: AllocationStore + ?Sized>(
        &self,
        store: &mut S,
        batch: &mut Vec<ClusterRecord>,
        summary: &mut BootstrapSummary,
    ) -> Result<()> {
        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return Ok(());
        };
        let (first, last) = (first.cluster, last.cluster);

        let inserted = match with_backoff(&self.retry, "insert batch", || {
            store.insert_batch(batch)
        }) {
            Ok(inserted) => inserted,
            Err(ConsolidationError::ConstraintViolation { cluster }) => {
                warn!(
                    "Batch {}..={} overlaps existing cluster {}; inserting missing records only",
                    first, last, cluster
                );
                let present = self.present_between(store, first, last)?;
                let missing: Vec<ClusterRecord> = batch
                    .iter()
                    .filter(|record| !present.contains(&record.cluster))
                    .copied()
                    .collect();
                if missing.is_empty() {
                    0
                } else {
                    with_backoff(&self.retry, "insert batch", || store.insert_batch(&missing))?
                }
            }
            Err(err) => return Err(err),
        };

        debug!(
            "Flushed batch {}..={}: {} inserted of {}",
            first,
            last,
            inserted,
            batch.len()
        );
        summary.inserted += inserted as u64;
        summary.already_present += (batch.len() - inserted) as u64;
        summary.batches += 1;
        batch.clear();
        Ok(())
    }

    /// Recorded clusters in `first..=last`
    fn present_between<S: AllocationStore + ?Sized>(
        &self,
        store: &S,
        first: u64,
        last: u64,
    ) -> Result<BTreeSet<u64>> {
        let mut present = BTreeSet::new();
        let mut cursor = first;
        loop {
            let page = with_backoff(&self.retry, "scan records", || {
                store.scan(cursor, self.page_size)
            })?;
            let page_len = page.len();
            for record in page {
                if record.cluster > last {
                    return Ok(present);
                }
                present.insert(record.cluster);
                cursor = record.cluster + 1;
            }
            if page_len < self.page_size {
                return Ok(present);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn clusters(store: &MemoryStore) -> Vec<(u64, bool)> {
        store
            .records()
            .iter()
            .map(|record| (record.cluster, record.allocated))
            .collect()
    }

    #[test]
    fn test_fill_gaps_example_range() {
        let mut store = MemoryStore::from_records(vec![ClusterRecord::allocated(102)]).unwrap();

        let summary = GapFiller::new(1024, 100)
            .fill_gaps(&mut store, 100..=105)
            .unwrap();

        assert_eq!(summary.inserted, 5);
        assert_eq!(summary.already_present, 1);
        assert_eq!(
            clusters(&store),
            vec![
                (100, false),
                (101, false),
                (102, true),
                (103, false),
                (104, false),
                (105, false)
            ]
        );
    }

    #[test]
    fn test_fill_gaps_batches_and_pages() {
        let mut store = MemoryStore::from_records(
            [3, 10, 11, 25, 40].into_iter().map(ClusterRecord::allocated),
        )
        .unwrap();

        let summary = GapFiller::new(4, 2).fill_gaps(&mut store, 0..=30).unwrap();

        assert_eq!(summary.already_present, 4);
        assert_eq!(summary.inserted, 27);
        // 27 records in batches of 4, plus the trailing partial batch
        assert_eq!(summary.batches, 7);
        assert_eq!(store.len(), 32);
        // Record outside the range is untouched, nothing past 30 inserted
        assert!(store.get(31).unwrap().is_none());
        assert!(store.get(40).unwrap().unwrap().allocated);
    }

    #[test]
    fn test_fill_gaps_ends_on_recorded_cluster() {
        let mut store = MemoryStore::from_records(vec![ClusterRecord::allocated(5)]).unwrap();
        let summary = GapFiller::new(8, 8).fill_gaps(&mut store, 2..=5).unwrap();
        assert_eq!(summary.inserted, 3);
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_fill_range_tolerates_existing_records() {
        let mut store = MemoryStore::from_records(vec![
            ClusterRecord::allocated(102),
            ClusterRecord::allocated(104),
        ])
        .unwrap();

        let summary = GapFiller::new(3, 10)
            .fill_range(&mut store, 100..=105)
            .unwrap();

        assert_eq!(summary.inserted, 4);
        assert_eq!(summary.already_present, 2);
        assert_eq!(summary.batches, 2);
        assert!(store.get(102).unwrap().unwrap().allocated);
        assert!(!store.get(103).unwrap().unwrap().allocated);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let mut store = MemoryStore::from_records(vec![ClusterRecord::allocated(7)]).unwrap();
        let filler = GapFiller::new(2, 3);

        filler.fill_gaps(&mut store, 0..=9).unwrap();
        let once = store.records();

        let again = filler.fill_gaps(&mut store, 0..=9).unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.already_present, 10);
        assert_eq!(store.records(), once);

        let blind = filler.fill_range(&mut store, 0..=9).unwrap();
        assert_eq!(blind.inserted, 0);
        assert_eq!(store.records(), once);
    }

    #[test]
    fn test_empty_range() {
        let mut store = MemoryStore::new();
        #[allow(clippy::reversed_empty_ranges)]
        let summary = GapFiller::new(4, 4).fill_gaps(&mut store, 9..=3).unwrap();
        assert_eq!(summary, BootstrapSummary::default());
        assert!(store.is_empty());
    }

    #[test]
    fn test_retries_transient_insert_failure() {
        let mut store = MemoryStore::new();
        // first scan succeeds, first insert fails once
        store.inject_outage(1, 1);
        let filler = GapFiller::new(16, 16).with_retry(RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        });

        let summary = filler.fill_gaps(&mut store, 0..=4).unwrap();
        assert_eq!(summary.inserted, 5);
    }
}
