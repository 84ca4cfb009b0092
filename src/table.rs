//! Dense allocation table
//!
//! One bit per cluster, 64 clusters per word:
//! - 0 = free cluster
//! - 1 = allocated cluster
//!
//! Fifteen million clusters fit in under 2 MB, so the bulk planner can hold
//! the whole address space of a large volume in memory.

use crate::error::{ConsolidationError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationTable {
    /// Bitmap words (each word = 64 clusters)
    bitmap: Vec<u64>,

    /// Number of clusters tracked
    len: u64,

    /// Number of allocated clusters
    allocated: u64,
}

impl AllocationTable {
    /// Create a table of `len` clusters, all free
    pub fn new(len: u64) -> Self {
        let num_words = len.div_ceil(64) as usize;
        AllocationTable {
            bitmap: vec![0u64; num_words],
            len,
            allocated: 0,
        }
    }

    /// Build a table from the list of allocated clusters
    pub fn from_allocated<I>(len: u64, clusters: I) -> Result<Self>
    where
        I: IntoIterator<Item = u64>,
    {
        let mut table = Self::new(len);
        for cluster in clusters {
            table.set_allocated(cluster, true)?;
        }
        Ok(table)
    }

    /// Build a table from one flag per cluster, starting at cluster 0
    pub fn from_flags(flags: &[bool]) -> Self {
        let mut table = Self::new(flags.len() as u64);
        for (cluster, &allocated) in flags.iter().enumerate() {
            if allocated {
                table.mark(cluster as u64, true);
            }
        }
        table
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn allocated_count(&self) -> u64 {
        self.allocated
    }

    pub fn free_count(&self) -> u64 {
        self.len - self.allocated
    }

    /// Check if a cluster is allocated. Clusters past the end read as free.
    pub fn is_allocated(&self, cluster: u64) -> bool {
        if cluster >= self.len {
            return false;
        }
        let (word_idx, bit_idx) = Self::position(cluster);
        (self.bitmap[word_idx] & (1u64 << bit_idx)) != 0
    }

    /// Set the allocation flag of a cluster
    pub fn set_allocated(&mut self, cluster: u64, allocated: bool) -> Result<()> {
        if cluster >= self.len {
            return Err(ConsolidationError::OutOfRange {
                cluster,
                limit: self.len,
            });
        }
        self.mark(cluster, allocated);
        Ok(())
    }

    /// Lowest free cluster at or above `from`
    pub fn next_free(&self, from: u64) -> Option<u64> {
        self.scan(from, |word| !word)
    }

    /// Lowest allocated cluster at or above `from`
    pub fn next_allocated(&self, from: u64) -> Option<u64> {
        self.scan(from, |word| word)
    }

    /// Number of allocated clusters at or above `from`
    pub fn allocated_from(&self, from: u64) -> u64 {
        if from >= self.len {
            return 0;
        }
        let (word_idx, bit_idx) = Self::position(from);
        let head = (self.bitmap[word_idx] & (u64::MAX << bit_idx)).count_ones() as u64;
        let tail: u64 = self.bitmap[word_idx + 1..]
            .iter()
            .map(|word| word.count_ones() as u64)
            .sum();
        head + tail
    }

    /// End of the contiguous allocated run once compaction from
    /// `first_cluster` has finished
    pub fn compaction_boundary(&self, first_cluster: u64) -> u64 {
        first_cluster + self.allocated_from(first_cluster)
    }

    /// Whether every allocated cluster at or above `first_cluster` sits
    /// below every free one
    pub fn is_compacted(&self, first_cluster: u64) -> bool {
        match self.next_free(first_cluster) {
            Some(free) => self.next_allocated(free).is_none(),
            None => true,
        }
    }

    /// Fragmentation as free/allocated transitions per cluster
    /// (0.0 = one run, higher = more fragmented)
    pub fn fragmentation_score(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }

        let mut transitions = 0u64;
        let mut prev_allocated = false;
        for cluster in 0..self.len {
            let is_allocated = self.is_allocated(cluster);
            if is_allocated != prev_allocated {
                transitions += 1;
            }
            prev_allocated = is_allocated;
        }

        (transitions as f64) / (self.len as f64)
    }

    /// Flip a bit known to be in range, keeping the counter in sync
    pub(crate) fn mark(&mut self, cluster: u64, allocated: bool) {
        let (word_idx, bit_idx) = Self::position(cluster);
        let mask = 1u64 << bit_idx;
        let was_allocated = (self.bitmap[word_idx] & mask) != 0;
        match (was_allocated, allocated) {
            (false, true) => {
                self.bitmap[word_idx] |= mask;
                self.allocated += 1;
            }
            (true, false) => {
                self.bitmap[word_idx] &= !mask;
                self.allocated -= 1;
            }
            _ => {}
        }
    }

    fn position(cluster: u64) -> (usize, u32) {
        ((cluster / 64) as usize, (cluster % 64) as u32)
    }

    /// Find the lowest set bit of `project(word)` at or above `from`
    fn scan(&self, from: u64, project: impl Fn(u64) -> u64) -> Option<u64> {
        if from >= self.len {
            return None;
        }

        let (mut word_idx, bit_idx) = Self::position(from);
        let mut bits = project(self.bitmap[word_idx]) & (u64::MAX << bit_idx);
        loop {
            if bits != 0 {
                let cluster = word_idx as u64 * 64 + bits.trailing_zeros() as u64;
                // Padding bits past `len` read as free; never report them
                return (cluster < self.len).then_some(cluster);
            }
            word_idx += 1;
            if word_idx >= self.bitmap.len() {
                return None;
            }
            bits = project(self.bitmap[word_idx]);
        }
    }
}
