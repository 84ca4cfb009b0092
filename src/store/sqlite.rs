//! SQLite allocation store
//!
//! Schema:
//!
//! ```sql
//! CREATE TABLE cluster (
//!     cluster              INTEGER PRIMARY KEY,
//!     allocated            INTEGER NOT NULL,
//!     consolidated_cluster INTEGER,
//!     applied              INTEGER NOT NULL DEFAULT 0
//! );
//! ```
//!
//! A partial unique index on `consolidated_cluster` makes destination reuse
//! impossible at the storage level. The connection is owned by the store and
//! closed when the store is dropped.

use crate::error::{ConsolidationError, Result};
use crate::record::{ClusterRecord, RelocationPair};
use crate::store::{AllocationStore, StoreStats};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS cluster (
        cluster              INTEGER PRIMARY KEY,
        allocated            INTEGER NOT NULL,
        consolidated_cluster INTEGER,
        applied              INTEGER NOT NULL DEFAULT 0
    );
    CREATE UNIQUE INDEX IF NOT EXISTS cluster_consolidated
        ON cluster(consolidated_cluster) WHERE consolidated_cluster IS NOT NULL;
    CREATE INDEX IF NOT EXISTS cluster_unplanned
        ON cluster(cluster) WHERE allocated = 1 AND consolidated_cluster IS NULL;
";

/// Allocation store backed by a SQLite database
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a database file and ensure the schema exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening allocation store at {:?}", path.as_ref());
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore { conn })
    }

    /// Borrow the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// SQLite integers are signed 64-bit
fn to_sql(cluster: u64) -> Result<i64> {
    i64::try_from(cluster).map_err(|_| ConsolidationError::OutOfRange {
        cluster,
        limit: i64::MAX as u64,
    })
}

fn from_sql(value: i64) -> u64 {
    value as u64
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<ClusterRecord> {
    Ok(ClusterRecord {
        cluster: from_sql(row.get(0)?),
        allocated: row.get(1)?,
        consolidated_target: row.get::<_, Option<i64>>(2)?.map(from_sql),
        applied: row.get(3)?,
    })
}

impl AllocationStore for SqliteStore {
    fn scan(&self, from: u64, limit: usize) -> Result<Vec<ClusterRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT cluster, allocated, consolidated_cluster, applied FROM cluster
             WHERE cluster >= ?1 ORDER BY cluster ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![to_sql(from)?, limit as i64], read_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get(&self, cluster: u64) -> Result<Option<ClusterRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT cluster, allocated, consolidated_cluster, applied FROM cluster
             WHERE cluster = ?1",
        )?;
        Ok(stmt
            .query_row(params![to_sql(cluster)?], read_record)
            .optional()?)
    }

    fn insert_batch(&mut self, records: &[ClusterRecord]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            // Only an existing cluster is skipped; a claimed destination fails
            let mut stmt = tx.prepare_cached(
                "INSERT INTO cluster (cluster, allocated, consolidated_cluster, applied)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(cluster) DO NOTHING",
            )?;
            for record in records {
                let target = record.consolidated_target.map(to_sql).transpose()?;
                let result = stmt.execute(params![
                    to_sql(record.cluster)?,
                    record.allocated,
                    target,
                    record.applied
                ]);
                inserted += match result {
                    Ok(changed) => changed,
                    Err(err) if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                        let mut clusters = vec![record.cluster];
                        clusters.extend(record.consolidated_target);
                        return Err(ConsolidationError::invariant(
                            "destination already claimed",
                            &clusters,
                        ));
                    }
                    Err(err) => return Err(err.into()),
                };
            }
        }
        tx.commit()?;
        debug!(
            "Inserted {} of {} records ({} already present)",
            inserted,
            records.len(),
            records.len() - inserted
        );
        Ok(inserted)
    }

    fn count_between(&self, from: u64, to: u64) -> Result<u64> {
        // Clusters past the signed range cannot be stored
        let to = to.min(i64::MAX as u64);
        if from >= to {
            return Ok(0);
        }
        let mut stmt = self
            .conn
            .prepare_cached("SELECT COUNT(*) FROM cluster WHERE cluster >= ?1 AND cluster < ?2")?;
        let count: i64 = stmt.query_row(params![to_sql(from)?, to_sql(to)?], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn unplanned_sources(&self, from: u64, limit: usize) -> Result<Vec<u64>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT cluster FROM cluster
             WHERE cluster >= ?1 AND allocated = 1 AND consolidated_cluster IS NULL
             ORDER BY cluster ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![to_sql(from)?, limit as i64], |row| {
            row.get::<_, i64>(0)
        })?;
        let mut clusters = Vec::new();
        for row in rows {
            clusters.push(from_sql(row?));
        }
        Ok(clusters)
    }

    fn first_vacant_destination(&self, from: u64) -> Result<Option<u64>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT c1.cluster FROM cluster c1
             WHERE c1.cluster >= ?1
               AND (c1.allocated = 0 OR c1.consolidated_cluster IS NOT NULL)
               AND NOT EXISTS (
                   SELECT 1 FROM cluster c2 WHERE c2.consolidated_cluster = c1.cluster
               )
             ORDER BY c1.cluster ASC LIMIT 1",
        )?;
        Ok(stmt
            .query_row(params![to_sql(from)?], |row| row.get::<_, i64>(0))
            .optional()?
            .map(from_sql))
    }

    fn set_target(&mut self, cluster: u64, target: u64) -> Result<()> {
        let tx = self.conn.transaction()?;

        let source: Option<(bool, Option<i64>)> = tx
            .query_row(
                "SELECT allocated, consolidated_cluster FROM cluster WHERE cluster = ?1",
                params![to_sql(cluster)?],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match source {
            None => return Err(ConsolidationError::RecordNotFound(cluster)),
            Some((_, Some(existing))) if from_sql(existing) == target => return Ok(()),
            Some((_, Some(existing))) => {
                return Err(ConsolidationError::invariant(
                    "source already has a different destination",
                    &[cluster, from_sql(existing), target],
                ))
            }
            Some((false, None)) => {
                return Err(ConsolidationError::invariant(
                    "source cluster is not allocated",
                    &[cluster],
                ))
            }
            Some((true, None)) => {}
        }

        let destination: Option<(bool, Option<i64>)> = tx
            .query_row(
                "SELECT allocated, consolidated_cluster FROM cluster WHERE cluster = ?1",
                params![to_sql(target)?],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match destination {
            None => {
                return Err(ConsolidationError::invariant(
                    "destination has no record",
                    &[cluster, target],
                ))
            }
            Some((true, None)) => {
                return Err(ConsolidationError::invariant(
                    "destination still holds live data",
                    &[cluster, target],
                ))
            }
            Some(_) => {}
        }

        let result = tx.execute(
            "UPDATE cluster SET consolidated_cluster = ?1
             WHERE cluster = ?2 AND consolidated_cluster IS NULL",
            params![to_sql(target)?, to_sql(cluster)?],
        );
        match result {
            Ok(_) => {}
            Err(err) if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                let claimer: Option<i64> = tx
                    .query_row(
                        "SELECT cluster FROM cluster WHERE consolidated_cluster = ?1",
                        params![to_sql(target)?],
                        |row| row.get(0),
                    )
                    .optional()?;
                let mut clusters: Vec<u64> = claimer.map(from_sql).into_iter().collect();
                clusters.extend([cluster, target]);
                return Err(ConsolidationError::invariant(
                    "destination already claimed",
                    &clusters,
                ));
            }
            Err(err) => return Err(err.into()),
        }

        tx.commit()?;
        Ok(())
    }

    fn mark_applied(&mut self, cluster: u64) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE cluster SET applied = 1
             WHERE cluster = ?1 AND consolidated_cluster IS NOT NULL",
            params![to_sql(cluster)?],
        )?;
        if changed == 0 {
            return match self.get(cluster)? {
                None => Err(ConsolidationError::RecordNotFound(cluster)),
                Some(_) => Err(ConsolidationError::invariant(
                    "no planned relocation to confirm",
                    &[cluster],
                )),
            };
        }
        Ok(())
    }

    fn pending_relocations(&self) -> Result<Vec<RelocationPair>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT cluster, consolidated_cluster FROM cluster
             WHERE consolidated_cluster IS NOT NULL AND applied = 0
             ORDER BY consolidated_cluster ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RelocationPair::new(
                from_sql(row.get(0)?),
                from_sql(row.get(1)?),
            ))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn stats(&self) -> Result<StoreStats> {
        let stats = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(allocated), 0),
                    COUNT(consolidated_cluster),
                    COALESCE(SUM(CASE WHEN consolidated_cluster IS NOT NULL THEN applied ELSE 0 END), 0)
             FROM cluster",
            [],
            |row| {
                Ok(StoreStats {
                    records: from_sql(row.get(0)?),
                    allocated: from_sql(row.get(1)?),
                    planned: from_sql(row.get(2)?),
                    applied: from_sql(row.get(3)?),
                })
            },
        )?;
        Ok(stats)
    }
}
