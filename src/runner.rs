//! Plan execution
//!
//! Each pair goes through three steps, strictly in plan order:
//!
//! 1. record the destination in the store (the checkpoint)
//! 2. hand the pair to the relocation executor
//! 3. mark the pair applied
//!
//! A crash between 1 and 3 leaves a recorded but unconfirmed pair behind.
//! [`Runner::reconcile`] resolves those before any new pair is planned, by
//! asking the executor what physically happened. If the executor cannot
//! tell, the run stops with `IncompleteApply` instead of risking a second
//! copy over live data.

use crate::cancel::CancellationToken;
use crate::config::RetryPolicy;
use crate::error::{ConsolidationError, Result};
use crate::executor::{ApplyState, RelocationExecutor};
use crate::materialize::MaterializedTable;
use crate::planner::{BulkPlan, StreamingPlanner};
use crate::record::RelocationPair;
use crate::retry::with_backoff;
use crate::store::AllocationStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Outcome of one consolidation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Pairs recorded and executed by this run
    pub applied: u64,

    /// Pairs a previous run had already recorded
    pub already_planned: u64,

    /// Unconfirmed pairs resolved before planning resumed
    pub reconciled: u64,

    /// Stopped by the cancellation token
    pub cancelled: bool,

    /// The plan ran to the end
    pub completed: bool,
}

impl RunSummary {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub struct Runner<'a, S, E>
where
    S: AllocationStore + ?Sized,
    E: RelocationExecutor + ?Sized,
{
    store: &'a mut S,
    executor: &'a mut E,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<'a, S, E> Runner<'a, S, E>
where
    S: AllocationStore + ?Sized,
    E: RelocationExecutor + ?Sized,
{
    pub fn new(store: &'a mut S, executor: &'a mut E, retry: RetryPolicy) -> Self {
        Runner {
            store,
            executor,
            retry,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Resolve pairs that were recorded but never confirmed
    ///
    /// Returns the number of pairs resolved.
    pub fn reconcile(&mut self) -> Result<u64> {
        let pending = with_backoff(&self.retry, "load pending relocations", || {
            self.store.pending_relocations()
        })?;
        if pending.is_empty() {
            return Ok(0);
        }

        warn!(
            "Found {} recorded relocations without confirmation",
            pending.len()
        );
        let mut resolved = 0;
        for pair in pending {
            match self.executor.verify(pair)? {
                ApplyState::Applied => {
                    info!("Relocation {} already applied, confirming", pair);
                    self.confirm(pair)?;
                }
                ApplyState::NotApplied => {
                    info!("Relocation {} never ran, executing", pair);
                    self.execute(pair)?;
                }
                ApplyState::Unknown => {
                    error!(
                        "Relocation {} was recorded but its outcome is unknown",
                        pair
                    );
                    return Err(ConsolidationError::IncompleteApply {
                        src_cluster: pair.source,
                        dst_cluster: pair.destination,
                    });
                }
            }
            resolved += 1;
        }
        Ok(resolved)
    }

    /// Run a bulk plan over a materialized table
    ///
    /// Pairs recorded by an earlier run are verified and skipped.
    pub fn run_bulk(&mut self, view: MaterializedTable, first_cluster: u64) -> Result<RunSummary> {
        let mut summary = RunSummary {
            reconciled: self.reconcile()?,
            ..RunSummary::default()
        };

        let mut plan = BulkPlan::new(view.table, first_cluster);
        summary.already_planned = plan.skip_planned(&view.planned)?;
        info!(
            "Starting bulk consolidation from cluster {} ({} pairs already recorded)",
            first_cluster, summary.already_planned
        );

        for pair in plan {
            if self.cancel.is_cancelled() {
                info!("Bulk consolidation cancelled after {} pairs", summary.applied);
                summary.cancelled = true;
                return Ok(summary);
            }
            with_backoff(&self.retry, "record destination", || {
                self.store.set_target(pair.source, pair.destination)
            })?;
            self.execute(pair)?;
            summary.applied += 1;
        }

        summary.completed = true;
        info!("Bulk consolidation finished: {} pairs applied", summary.applied);
        Ok(summary)
    }

    /// Run the streaming planner until the store is compacted or the run is
    /// cancelled
    pub fn run_streaming(&mut self, mut planner: StreamingPlanner) -> Result<RunSummary> {
        let mut summary = RunSummary {
            reconciled: self.reconcile()?,
            ..RunSummary::default()
        };
        info!("Starting streaming consolidation");

        loop {
            if self.cancel.is_cancelled() {
                info!(
                    "Streaming consolidation cancelled after {} pairs",
                    summary.applied
                );
                summary.cancelled = true;
                return Ok(summary);
            }

            let mut retrying = false;
            let step = with_backoff(&self.retry, "streaming step", || {
                if retrying {
                    // The failed attempt may have recorded its pair before
                    // the error surfaced
                    if let Some(pair) = self.store.pending_relocations()?.into_iter().next() {
                        return Ok(Some((pair, true)));
                    }
                }
                retrying = true;
                Ok(planner
                    .next_pair(&mut *self.store)?
                    .map(|pair| (pair, false)))
            })?;

            let Some((pair, recovered)) = step else {
                break;
            };
            if recovered {
                debug!("Recovered recorded relocation {} after a failed step", pair);
                planner.observe(pair);
            }
            self.execute(pair)?;
            summary.applied += 1;
        }

        summary.completed = true;
        info!(
            "Streaming consolidation finished: {} pairs applied",
            summary.applied
        );
        Ok(summary)
    }

    fn execute(&mut self, pair: RelocationPair) -> Result<()> {
        self.executor.relocate(pair).map_err(|err| {
            error!("Relocation {} failed: {}", pair, err);
            err
        })?;
        self.confirm(pair)
    }

    fn confirm(&mut self, pair: RelocationPair) -> Result<()> {
        with_backoff(&self.retry, "confirm relocation", || {
            self.store.mark_applied(pair.source)
        })?;
        debug!("Relocation {} applied", pair);
        Ok(())
    }
}
