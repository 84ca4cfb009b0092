//! Relocation executors
//!
//! The executor performs the physical data move for each planned pair. It
//! lives outside this crate; the trait is the seam, and two small
//! implementations are provided for dry runs and plan capture.

use crate::error::Result;
use crate::record::RelocationPair;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Physical state of a relocation as seen by the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyState {
    /// Data is at the destination and the source may be reused
    Applied,
    /// Nothing was moved yet; running the relocation again is safe
    NotApplied,
    /// The executor cannot tell
    Unknown,
}

/// Relocation executor trait
pub trait RelocationExecutor {
    /// Move the contents of `pair.source` into `pair.destination`
    ///
    /// Called in plan order, only after the pair has been recorded in the
    /// store. An error stops the run.
    fn relocate(&mut self, pair: RelocationPair) -> Result<()>;

    /// Inspect a pair that was recorded but never confirmed
    fn verify(&self, _pair: RelocationPair) -> Result<ApplyState> {
        Ok(ApplyState::Unknown)
    }
}

impl<E: RelocationExecutor + ?Sized> RelocationExecutor for &mut E {
    fn relocate(&mut self, pair: RelocationPair) -> Result<()> {
        (**self).relocate(pair)
    }

    fn verify(&self, pair: RelocationPair) -> Result<ApplyState> {
        (**self).verify(pair)
    }
}

/// Logs each relocation without moving anything
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    relocations: u64,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relocations(&self) -> u64 {
        self.relocations
    }
}

impl RelocationExecutor for DryRunExecutor {
    fn relocate(&mut self, pair: RelocationPair) -> Result<()> {
        info!("Dry run: relocate cluster {}", pair);
        self.relocations += 1;
        Ok(())
    }

    fn verify(&self, _pair: RelocationPair) -> Result<ApplyState> {
        // Nothing was ever moved
        Ok(ApplyState::NotApplied)
    }
}

/// Collects relocations in order, e.g. to export a plan
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RecordingExecutor {
    pairs: Vec<RelocationPair>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pairs(&self) -> &[RelocationPair] {
        &self.pairs
    }

    pub fn into_pairs(self) -> Vec<RelocationPair> {
        self.pairs
    }

    /// JSON array of `{source, destination}` objects
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.pairs)?)
    }
}

impl RelocationExecutor for RecordingExecutor {
    fn relocate(&mut self, pair: RelocationPair) -> Result<()> {
        self.pairs.push(pair);
        Ok(())
    }

    fn verify(&self, pair: RelocationPair) -> Result<ApplyState> {
        if self.pairs.contains(&pair) {
            Ok(ApplyState::Applied)
        } else {
            Ok(ApplyState::NotApplied)
        }
    }
}
