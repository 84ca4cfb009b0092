//! Streaming compaction planner
//!
//! Produces the same pairs as the bulk planner without materializing the
//! table. Each step issues two queries and one update:
//!
//! 1. destination: lowest vacant cluster at or above the floor
//!    (free, or already vacated, and not claimed by another record)
//! 2. source: lowest allocated, unplanned cluster strictly above it
//! 3. record the destination on the source record, then read it back
//!
//! Progress lives entirely in the store, so a fresh planner picks up where
//! an interrupted one stopped. The store must hold a record for every
//! cluster in the range being compacted; run the gap-fill bootstrapper
//! first on a sparse table. A missing record below a chosen destination,
//! or anywhere above the floor when the plan would end, fails the step
//! with `PlanInvariantViolation` naming the first unrecorded cluster.

use crate::cancel::CancellationToken;
use crate::error::{ConsolidationError, Result};
use crate::planner::PlanState;
use crate::record::RelocationPair;
use crate::store::AllocationStore;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct StreamingPlanner {
    /// Exclusive upper bound of the address space
    end: u64,

    /// Lower bound for the next destination query
    floor: u64,

    /// Last pair this planner recorded or observed
    last: Option<RelocationPair>,

    state: PlanState,

    emitted: u64,
}

impl StreamingPlanner {
    pub fn new(first_cluster: u64, address_space_end: u64) -> Self {
        StreamingPlanner {
            end: address_space_end,
            floor: first_cluster,
            last: None,
            state: PlanState::Scanning,
            emitted: 0,
        }
    }

    pub fn state(&self) -> PlanState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == PlanState::Done
    }

    /// Pairs recorded or observed by this planner
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Plan and record the next relocation
    ///
    /// Returns `Ok(None)` once no allocated cluster remains above a vacant
    /// slot inside the address space.
    pub fn next_pair<S: AllocationStore + ?Sized>(
        &mut self,
        store: &mut S,
    ) -> Result<Option<RelocationPair>> {
        if self.state == PlanState::Done {
            return Ok(None);
        }
        self.state = PlanState::Scanning;

        let destination = match store.first_vacant_destination(self.floor)? {
            Some(cluster) if cluster < self.end => cluster,
            _ => return self.finish(store),
        };
        // An unrecorded cluster below the destination is a free slot the
        // query cannot see
        check_recorded(store, self.floor, destination + 1)?;
        let source = match store.first_unplanned_source(destination + 1)? {
            Some(cluster) if cluster < self.end => cluster,
            _ => return self.finish(store),
        };

        if source <= destination {
            return Err(ConsolidationError::invariant(
                "source query returned a cluster at or below the destination",
                &[source, destination],
            ));
        }
        if let Some(last) = self.last {
            if source == last.source || destination <= last.destination {
                return Err(ConsolidationError::Stalled { cluster: source });
            }
        }

        store.set_target(source, destination)?;
        // An update that does not stick would make every later step re-plan
        // the same source
        let recorded = store.get(source)?.and_then(|record| record.consolidated_target);
        if recorded != Some(destination) {
            return Err(ConsolidationError::Stalled { cluster: source });
        }

        let pair = RelocationPair::new(source, destination);
        debug!("Planned relocation {}", pair);
        self.observe(pair);
        Ok(Some(pair))
    }

    /// Account for a pair recorded outside [`next_pair`](Self::next_pair),
    /// such as one recovered after a lost acknowledgement
    pub fn observe(&mut self, pair: RelocationPair) {
        self.state = PlanState::Emitting;
        self.last = Some(pair);
        self.floor = pair.destination + 1;
        self.emitted += 1;
    }

    fn finish<S: AllocationStore + ?Sized>(
        &mut self,
        store: &S,
    ) -> Result<Option<RelocationPair>> {
        check_recorded(store, self.floor, self.end)?;
        debug!("Streaming plan complete after {} pairs", self.emitted);
        self.state = PlanState::Done;
        Ok(None)
    }
}

/// Fail unless every cluster in `from..to` has a record
fn check_recorded<S: AllocationStore + ?Sized>(store: &S, from: u64, to: u64) -> Result<()> {
    if from >= to || store.count_between(from, to)? == to - from {
        return Ok(());
    }

    // Find the first hole to report
    let mut expected = from;
    'scan: loop {
        let page = store.scan(expected, GAP_SCAN_PAGE)?;
        let page_len = page.len();
        for record in page {
            if record.cluster != expected {
                break 'scan;
            }
            expected += 1;
        }
        if page_len < GAP_SCAN_PAGE || expected >= to {
            break;
        }
    }
    Err(ConsolidationError::invariant(
        "cluster has no record; fill gaps before streaming",
        &[expected.min(to - 1)],
    ))
}

const GAP_SCAN_PAGE: usize = 1024;

/// Lazy sequence of streamed pairs over a borrowed store
///
/// Yields `Err` at most once and then ends. Stops early when the
/// cancellation token fires.
pub struct StreamingPlan<'a, S: AllocationStore + ?Sized> {
    planner: StreamingPlanner,
    store: &'a mut S,
    cancel: Option<CancellationToken>,
    failed: bool,
}

impl<'a, S: AllocationStore + ?Sized> StreamingPlan<'a, S> {
    pub fn new(planner: StreamingPlanner, store: &'a mut S) -> Self {
        StreamingPlan {
            planner,
            store,
            cancel: None,
            failed: false,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn planner(&self) -> &StreamingPlanner {
        &self.planner
    }
}

impl<S: AllocationStore + ?Sized> Iterator for StreamingPlan<'_, S> {
    type Item = Result<RelocationPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
            return None;
        }
        match self.planner.next_pair(&mut *self.store) {
            Ok(pair) => pair.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
