//! Error types for consolidation runs

use rusqlite::ErrorCode;
use thiserror::Error;

/// Consolidation result type
pub type Result<T> = std::result::Result<T, ConsolidationError>;

/// Consolidation errors
#[derive(Error, Debug)]
pub enum ConsolidationError {
    /// The allocation store could not be reached. Transient: retry the whole
    /// materialization or the in-flight query.
    #[error("Allocation store unavailable: {0}")]
    StoreUnavailable(String),

    /// A record for this cluster already exists
    #[error("Constraint violation: cluster {cluster} already recorded")]
    ConstraintViolation { cluster: u64 },

    /// The plan would break injectivity or destination liveness
    #[error("Plan invariant violated: {reason} (clusters: {clusters:?})")]
    PlanInvariantViolation { reason: String, clusters: Vec<u64> },

    /// A target was persisted but physical completion could not be confirmed
    #[error(
        "Incomplete apply: relocation {src_cluster} -> {dst_cluster} needs manual reconciliation"
    )]
    IncompleteApply { src_cluster: u64, dst_cluster: u64 },

    /// The streaming planner produced the same step twice
    #[error("Streaming planner stalled at cluster {cluster}")]
    Stalled { cluster: u64 },

    #[error("No record for cluster {0}")]
    RecordNotFound(u64),

    #[error("Cluster {cluster} outside address space (limit {limit})")]
    OutOfRange { cluster: u64, limit: u64 },

    /// Relocation executor reported a failure
    #[error("Relocation executor failed: {0}")]
    Executor(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConsolidationError {
    /// Build an invariant violation naming the offending clusters
    pub fn invariant(reason: impl Into<String>, clusters: &[u64]) -> Self {
        ConsolidationError::PlanInvariantViolation {
            reason: reason.into(),
            clusters: clusters.to_vec(),
        }
    }

    /// Whether the operation may succeed if retried
    pub fn is_transient(&self) -> bool {
        matches!(self, ConsolidationError::StoreUnavailable(_))
    }
}

impl From<rusqlite::Error> for ConsolidationError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure,
            ) => ConsolidationError::StoreUnavailable(err.to_string()),
            _ => ConsolidationError::Sqlite(err),
        }
    }
}

impl From<toml::de::Error> for ConsolidationError {
    fn from(err: toml::de::Error) -> Self {
        ConsolidationError::InvalidConfig(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ConsolidationError {
    fn from(err: validator::ValidationErrors) -> Self {
        ConsolidationError::InvalidConfig(err.to_string())
    }
}
