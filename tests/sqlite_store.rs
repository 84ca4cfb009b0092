//! End-to-end consolidation over a file-backed SQLite store

mod common;

use cluster_consolidator::{
    AllocationStore, CancellationToken, ClusterRecord, ConsolidationConfig, ConsolidationError,
    Consolidator, RelocationPair, SqliteStore,
};
use common::SimulatedMedium;
use tempfile::TempDir;

const END: u64 = 120;

/// Clusters 20 and up, every third one allocated
fn allocated_clusters() -> Vec<u64> {
    (20..END).filter(|cluster| cluster % 3 == 0).collect()
}

fn flags() -> Vec<bool> {
    let allocated = allocated_clusters();
    (0..END).map(|cluster| allocated.contains(&cluster)).collect()
}

fn config() -> ConsolidationConfig {
    ConsolidationConfig::new(END)
        .with_first_cluster(20)
        .with_page_size(25)
        .with_batch_size(16)
}

/// Sparse import: allocated clusters only
fn import(dir: &TempDir) -> SqliteStore {
    let mut store = SqliteStore::open(dir.path().join("clusters.db")).unwrap();
    let records: Vec<ClusterRecord> = allocated_clusters()
        .into_iter()
        .map(ClusterRecord::allocated)
        .collect();
    store.insert_batch(&records).unwrap();
    store
}

#[test]
fn test_streaming_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let mut medium = SimulatedMedium::from_flags(&flags());

    let expected: Vec<RelocationPair> = {
        let mut consolidator = Consolidator::new(import(&dir), config()).unwrap();
        let filled = consolidator.bootstrap_gaps().unwrap();
        assert_eq!(filled.inserted, END - allocated_clusters().len() as u64);

        let plan: Vec<RelocationPair> = consolidator.bulk_plan().unwrap().collect();

        let token = CancellationToken::new();
        medium.cancel_after(10, token.clone());
        let summary = consolidator.run_streaming(&mut medium, Some(token)).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.applied, 10);
        plan
    };

    // Connection closed; a new process opens the same file
    let store = SqliteStore::open(dir.path().join("clusters.db")).unwrap();
    assert_eq!(store.stats().unwrap().applied, 10);

    let mut consolidator = Consolidator::new(store, config()).unwrap();
    let summary = consolidator.run_streaming(&mut medium, None).unwrap();
    assert!(summary.completed);
    assert_eq!(summary.applied as usize, expected.len() - 10);

    assert_eq!(medium.relocations(), expected.as_slice());
    assert!(medium.is_compacted(20));
    // Reserved clusters never take part
    assert!(medium
        .relocations()
        .iter()
        .all(|pair| pair.destination >= 20 && pair.source >= 20));
}

#[test]
fn test_bulk_run_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let mut consolidator = Consolidator::new(import(&dir), config()).unwrap();
    consolidator.bootstrap_gaps().unwrap();

    let mut medium = SimulatedMedium::from_flags(&flags());
    let summary = consolidator.run_bulk(&mut medium, None).unwrap();

    assert!(summary.completed);
    assert_eq!(summary.applied as usize, medium.relocations().len());
    assert!(medium.is_compacted(20));

    let stats = consolidator.stats().unwrap();
    assert_eq!(stats.records, END);
    assert_eq!(stats.planned, summary.applied);
    assert_eq!(stats.applied, summary.applied);
}

#[test]
fn test_bulk_needs_records_for_destinations() {
    let dir = TempDir::new().unwrap();
    // No gap fill: free clusters have no records to claim
    let mut consolidator = Consolidator::new(import(&dir), config()).unwrap();
    let mut medium = SimulatedMedium::from_flags(&flags());

    let result = consolidator.run_bulk(&mut medium, None);
    assert!(matches!(
        result,
        Err(ConsolidationError::PlanInvariantViolation { .. })
    ));
    assert!(medium.relocations().is_empty());
}

#[test]
fn test_destination_reuse_rejected_by_schema() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    store
        .insert_batch(&[
            ClusterRecord::free(0),
            ClusterRecord::allocated(1),
            ClusterRecord::allocated(2),
        ])
        .unwrap();

    store.set_target(1, 0).unwrap();
    let result = store.set_target(2, 0);
    assert!(matches!(
        result,
        Err(ConsolidationError::PlanInvariantViolation { .. })
    ));
    assert_eq!(store.get(2).unwrap().unwrap().consolidated_target, None);
}
