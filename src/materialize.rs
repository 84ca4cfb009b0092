//! Table materializer
//!
//! Pages through the allocation store in fixed windows and projects it into
//! a dense [`AllocationTable`]. Peak memory is one page of records plus the
//! bitmap. Any store failure aborts the whole operation; a partial table is
//! never returned.

use crate::error::{ConsolidationError, Result};
use crate::store::AllocationStore;
use crate::table::AllocationTable;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// A read projection of the store
#[derive(Debug, Clone)]
pub struct MaterializedTable {
    /// Allocation flags; unrecorded clusters read as free
    pub table: AllocationTable,

    /// Destinations already recorded: source -> destination
    pub planned: BTreeMap<u64, u64>,

    /// Number of records read from the store
    pub records_read: u64,
}

pub struct Materializer {
    page_size: usize,
}

impl Materializer {
    pub fn new(page_size: usize) -> Self {
        Materializer {
            page_size: page_size.max(1),
        }
    }

    /// Read every record below `address_space_end`
    pub fn materialize<S: AllocationStore + ?Sized>(
        &self,
        store: &S,
        address_space_end: u64,
    ) -> Result<MaterializedTable> {
        // The bitmap is indexed by usize words
        usize::try_from(address_space_end.div_ceil(64)).map_err(|_| {
            ConsolidationError::OutOfRange {
                cluster: address_space_end,
                limit: usize::MAX as u64,
            }
        })?;

        let mut table = AllocationTable::new(address_space_end);
        let mut planned = BTreeMap::new();
        let mut records_read = 0u64;
        let mut from = 0u64;
        let mut pages = 0u64;

        'pages: loop {
            let page = store.scan(from, self.page_size)?;
            let page_len = page.len();
            pages += 1;
            debug!("Materializer page {} from cluster {}: {} rows", pages, from, page_len);

            for record in page {
                if record.cluster >= address_space_end {
                    debug!(
                        "Stopping at cluster {}: outside address space (end {})",
                        record.cluster, address_space_end
                    );
                    break 'pages;
                }
                table.mark(record.cluster, record.allocated);
                if let Some(target) = record.consolidated_target {
                    planned.insert(record.cluster, target);
                }
                records_read += 1;
                from = record.cluster + 1;
            }

            if page_len < self.page_size {
                break;
            }
        }

        info!(
            "Materialized {} records in {} pages: {} allocated of {} clusters, {} already planned",
            records_read,
            pages,
            table.allocated_count(),
            table.len(),
            planned.len()
        );

        Ok(MaterializedTable {
            table,
            planned,
            records_read,
        })
    }
}
