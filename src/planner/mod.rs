//! Compaction planners
//!
//! Both planners produce the same ordered sequence of [`RelocationPair`]s:
//! every allocated cluster above the lowest free slot slides down to the
//! next vacant slot, in ascending order. A slot vacated by an earlier pair
//! becomes the destination of a later one, so pairs must be applied in the
//! order they are produced.
//!
//! - [`bulk`] - two-pointer merge over a fully materialized table
//! - [`streaming`] - one store query round per pair, no materialization
//!
//! [`RelocationPair`]: crate::record::RelocationPair

pub mod bulk;
pub mod streaming;

pub use bulk::BulkPlan;
pub use streaming::{StreamingPlan, StreamingPlanner};

/// Progress of a planner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    /// Looking for the next destination/source pair
    Scanning,
    /// A pair was just produced
    Emitting,
    /// No allocated cluster remains above a vacant slot
    Done,
}
