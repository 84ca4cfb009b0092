//! # Cluster Consolidator - Online Compaction Planning for Cluster Tables
//!
//! `cluster-consolidator` plans the compaction of a cluster allocation table:
//! allocated clusters are moved toward the low end of a fixed address space
//! so that free clusters end up in one contiguous run at the top.
//!
//! - **Table materializer**: pages the store into a dense allocation bitmap
//! - **Bulk planner**: two-pointer pass over the bitmap, lazy and deterministic
//! - **Streaming planner**: same plan driven by store queries, resumable
//!   after a crash with no state outside the store
//! - **Gap-fill bootstrapper**: writes explicit free records for clusters an
//!   imported table never recorded
//!
//! Every planned relocation is recorded on the source record as its
//! destination cluster before it is handed to a [`RelocationExecutor`], so a
//! restarted run continues from the store alone.
//!
//! ## Quick Start
//!
//! ```rust
//! use cluster_consolidator::{
//!     ConsolidationConfig, Consolidator, DryRunExecutor, MemoryStore, Result,
//! };
//!
//! # fn main() -> Result<()> {
//! let store = MemoryStore::from_flags(&[true, true, false, true, true, false, false, true]);
//! let mut consolidator = Consolidator::new(store, ConsolidationConfig::new(8))?;
//!
//! let mut executor = DryRunExecutor::new();
//! let summary = consolidator.run_streaming(&mut executor, None)?;
//! assert_eq!(summary.applied, 3);
//! assert!(summary.completed);
//! # Ok(())
//! # }
//! ```
//!
//! ## SQLite-backed store
//!
//! ```rust,no_run
//! use cluster_consolidator::{ConsolidationConfig, Consolidator, SqliteStore, Result};
//!
//! # fn main() -> Result<()> {
//! let config = ConsolidationConfig::from_file("consolidate.toml")?;
//! let mut consolidator = Consolidator::new(SqliteStore::open("clusters.db")?, config)?;
//!
//! // Imported tables list allocated clusters only
//! consolidator.bootstrap_gaps()?;
//! for pair in consolidator.bulk_plan()? {
//!     println!("{}", pair);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod cancel;
pub mod config;
pub mod error;
pub mod executor;
pub mod materialize;
pub mod planner;
pub mod record;
pub mod retry;
pub mod runner;
pub mod store;
pub mod table;

pub use crate::{
    bootstrap::{BootstrapSummary, GapFiller},
    cancel::CancellationToken,
    config::{ConsolidationConfig, RetryPolicy},
    error::{ConsolidationError, Result},
    executor::{ApplyState, DryRunExecutor, RecordingExecutor, RelocationExecutor},
    materialize::{MaterializedTable, Materializer},
    planner::{BulkPlan, PlanState, StreamingPlan, StreamingPlanner},
    record::{ClusterRecord, RelocationPair},
    runner::{RunSummary, Runner},
    store::{AllocationStore, MemoryStore, SqliteStore, StoreStats},
    table::AllocationTable,
};

use crate::retry::with_backoff;
use std::ops::RangeInclusive;
use tracing::info;

/// High-level consolidation API over one allocation store
///
/// Owns the store and a validated [`ConsolidationConfig`], and wires the
/// materializer, planners, bootstrapper and runner together with the
/// configured page, batch and retry settings.
pub struct Consolidator<S: AllocationStore> {
    store: S,
    config: ConsolidationConfig,
}

impl<S: AllocationStore> Consolidator<S> {
    /// Create a consolidator, validating `config`
    pub fn new(store: S, config: ConsolidationConfig) -> Result<Self> {
        let config = config.validated()?;
        info!(
            "Consolidator over clusters {}..{} (page {}, batch {})",
            config.first_cluster, config.address_space_end, config.page_size, config.batch_size
        );
        Ok(Consolidator { store, config })
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Read the whole address space into a dense table
    ///
    /// A transient failure restarts the scan from the beginning.
    pub fn materialize(&self) -> Result<MaterializedTable> {
        let materializer = Materializer::new(self.config.page_size);
        with_backoff(&self.config.retry, "materialize table", || {
            materializer.materialize(&self.store, self.config.address_space_end)
        })
    }

    /// Full bulk plan for the current allocation flags
    ///
    /// Recorded destinations are ignored; the plan starts from the first
    /// pair. Use [`run_bulk`](Self::run_bulk) to resume a recorded plan.
    pub fn bulk_plan(&self) -> Result<BulkPlan> {
        let view = self.materialize()?;
        Ok(BulkPlan::new(view.table, self.config.first_cluster))
    }

    /// Streaming plan that records each pair as it is produced
    pub fn streaming_plan(&mut self) -> StreamingPlan<'_, S> {
        let planner = self.streaming_planner();
        StreamingPlan::new(planner, &mut self.store)
    }

    /// Insert free records for every unrecorded cluster of the address space
    pub fn bootstrap_gaps(&mut self) -> Result<BootstrapSummary> {
        let Some(last) = self.config.address_space_end.checked_sub(1) else {
            return Ok(BootstrapSummary::default());
        };
        self.gap_filler().fill_gaps(&mut self.store, 0..=last)
    }

    /// Insert free records for every cluster in `range`, skipping those
    /// already recorded
    pub fn fill_range(&mut self, range: RangeInclusive<u64>) -> Result<BootstrapSummary> {
        self.gap_filler().fill_range(&mut self.store, range)
    }

    /// Resolve recorded but unconfirmed relocations
    pub fn reconcile<E>(&mut self, executor: &mut E) -> Result<u64>
    where
        E: RelocationExecutor + ?Sized,
    {
        Runner::new(&mut self.store, executor, self.config.retry.clone()).reconcile()
    }

    /// Materialize, plan and apply the bulk plan
    ///
    /// Pairs recorded by an earlier run must match the re-derived plan and
    /// are skipped.
    pub fn run_bulk<E>(
        &mut self,
        executor: &mut E,
        cancel: Option<CancellationToken>,
    ) -> Result<RunSummary>
    where
        E: RelocationExecutor + ?Sized,
    {
        let view = self.materialize()?;
        info!(
            "Materialized {} records: {} allocated, fragmentation {:.3}",
            view.records_read,
            view.table.allocated_count(),
            view.table.fragmentation_score()
        );
        let first_cluster = self.config.first_cluster;
        self.runner(executor, cancel).run_bulk(view, first_cluster)
    }

    /// Plan and apply pair by pair through store queries
    pub fn run_streaming<E>(
        &mut self,
        executor: &mut E,
        cancel: Option<CancellationToken>,
    ) -> Result<RunSummary>
    where
        E: RelocationExecutor + ?Sized,
    {
        let planner = self.streaming_planner();
        self.runner(executor, cancel).run_streaming(planner)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        with_backoff(&self.config.retry, "load store stats", || self.store.stats())
    }

    fn streaming_planner(&self) -> StreamingPlanner {
        StreamingPlanner::new(self.config.first_cluster, self.config.address_space_end)
    }

    fn gap_filler(&self) -> GapFiller {
        GapFiller::new(self.config.batch_size, self.config.page_size)
            .with_retry(self.config.retry.clone())
    }

    fn runner<'a, E>(
        &'a mut self,
        executor: &'a mut E,
        cancel: Option<CancellationToken>,
    ) -> Runner<'a, S, E>
    where
        E: RelocationExecutor + ?Sized,
    {
        let runner = Runner::new(&mut self.store, executor, self.config.retry.clone());
        match cancel {
            Some(token) => runner.with_cancellation(token),
            None => runner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryStore {
        MemoryStore::from_flags(&[
            true, true, false, true, true, false, false, true, false, true,
        ])
    }

    fn expected() -> Vec<RelocationPair> {
        vec![
            RelocationPair::new(3, 2),
            RelocationPair::new(4, 3),
            RelocationPair::new(7, 4),
            RelocationPair::new(9, 5),
        ]
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = Consolidator::new(
            MemoryStore::new(),
            ConsolidationConfig::new(10).with_first_cluster(10),
        );
        assert!(matches!(result, Err(ConsolidationError::InvalidConfig(_))));
    }

    #[test]
    fn test_bulk_plan_from_store() {
        let consolidator = Consolidator::new(sample(), ConsolidationConfig::new(10)).unwrap();
        let pairs: Vec<RelocationPair> = consolidator.bulk_plan().unwrap().collect();
        assert_eq!(pairs, expected());
    }

    #[test]
    fn test_streaming_plan_matches_bulk() {
        let mut consolidator = Consolidator::new(sample(), ConsolidationConfig::new(10)).unwrap();
        let streamed: Vec<RelocationPair> = consolidator
            .streaming_plan()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(streamed, expected());
    }

    #[test]
    fn test_reserved_first_clusters() {
        let config = ConsolidationConfig::new(10).with_first_cluster(3);
        let consolidator = Consolidator::new(sample(), config).unwrap();
        let pairs: Vec<RelocationPair> = consolidator.bulk_plan().unwrap().collect();
        assert_eq!(
            pairs,
            vec![RelocationPair::new(7, 5), RelocationPair::new(9, 6)]
        );
    }

    #[test]
    fn test_bootstrap_then_stream() {
        let store = MemoryStore::from_records(
            [0, 3, 4, 9].into_iter().map(ClusterRecord::allocated),
        )
        .unwrap();
        let config = ConsolidationConfig::new(10).with_batch_size(3).with_page_size(2);
        let mut consolidator = Consolidator::new(store, config).unwrap();

        let filled = consolidator.bootstrap_gaps().unwrap();
        assert_eq!(filled.inserted, 6);
        assert_eq!(filled.already_present, 4);

        let mut executor = RecordingExecutor::new();
        let summary = consolidator.run_streaming(&mut executor, None).unwrap();
        assert!(summary.completed);
        assert_eq!(
            executor.pairs(),
            &[
                RelocationPair::new(3, 1),
                RelocationPair::new(4, 2),
                RelocationPair::new(9, 3),
            ]
        );

        let stats = consolidator.stats().unwrap();
        assert_eq!(stats.records, 10);
        assert_eq!(stats.planned, 3);
        assert_eq!(stats.applied, 3);
    }

    #[test]
    fn test_streaming_run_requires_gap_fill() {
        let store = MemoryStore::from_records(
            [0, 3, 4, 9].into_iter().map(ClusterRecord::allocated),
        )
        .unwrap();
        let mut consolidator = Consolidator::new(store, ConsolidationConfig::new(10)).unwrap();
        let mut executor = RecordingExecutor::new();

        let result = consolidator.run_streaming(&mut executor, None);
        assert!(matches!(
            result,
            Err(ConsolidationError::PlanInvariantViolation { .. })
        ));
        assert!(executor.pairs().is_empty());

        consolidator.bootstrap_gaps().unwrap();
        let summary = consolidator.run_streaming(&mut executor, None).unwrap();
        assert!(summary.completed);
        assert_eq!(summary.applied, 3);
    }

    #[test]
    fn test_run_bulk_records_and_applies() {
        let mut consolidator = Consolidator::new(sample(), ConsolidationConfig::new(10)).unwrap();
        let mut executor = RecordingExecutor::new();

        let summary = consolidator.run_bulk(&mut executor, None).unwrap();
        assert_eq!(summary.applied, 4);
        assert_eq!(executor.pairs(), expected().as_slice());
        assert!(consolidator.store().pending_relocations().unwrap().is_empty());

        // A second run finds the recorded plan and has nothing left to do
        let again = consolidator.run_bulk(&mut executor, None).unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.already_planned, 4);
    }

    #[test]
    fn test_materialize_retries_from_scratch() {
        let store = sample();
        // second page read fails once
        store.inject_outage(1, 1);
        let config = ConsolidationConfig::new(10)
            .with_page_size(4)
            .with_retry(RetryPolicy {
                max_attempts: 2,
                initial_backoff_ms: 0,
                max_backoff_ms: 0,
            });
        let consolidator = Consolidator::new(store, config).unwrap();

        let view = consolidator.materialize().unwrap();
        assert_eq!(view.records_read, 10);
        assert_eq!(view.table.allocated_count(), 6);
    }
}
