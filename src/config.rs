//! Run configuration
//!
//! All bounds and sizes are passed in explicitly; nothing is read from the
//! environment. A config can be built in code with the `with_*` setters or
//! loaded from a TOML file:
//!
//! ```toml
//! first_cluster = 20
//! address_space_end = 15260859
//! page_size = 1000000
//! batch_size = 1024
//!
//! [retry]
//! max_attempts = 5
//! initial_backoff_ms = 50
//! max_backoff_ms = 5000
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Default number of rows fetched per materializer page
pub const DEFAULT_PAGE_SIZE: usize = 1_000_000;

/// Default number of records per bootstrap insert batch
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Backoff policy for transient store failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[validate(range(min = 1))]
    pub max_attempts: u32,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 5000,
        }
    }
}

impl RetryPolicy {
    /// Fail on the first error
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Backoff before the given retry (1-based), before jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Consolidation run configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_bounds"))]
pub struct ConsolidationConfig {
    /// Lowest cluster that may receive relocated data. Clusters below it are
    /// reserved and never touched.
    pub first_cluster: u64,

    /// Exclusive upper bound of the address space
    pub address_space_end: u64,

    /// Rows per materializer page
    #[validate(range(min = 1))]
    pub page_size: usize,

    /// Records per bootstrap insert batch
    #[validate(range(min = 1))]
    pub batch_size: usize,

    #[validate(nested)]
    pub retry: RetryPolicy,
}

fn validate_bounds(config: &ConsolidationConfig) -> std::result::Result<(), ValidationError> {
    if config.first_cluster >= config.address_space_end {
        return Err(ValidationError::new("first_cluster_not_below_address_space_end"));
    }
    Ok(())
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            first_cluster: 0,
            address_space_end: 0,
            page_size: DEFAULT_PAGE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

impl ConsolidationConfig {
    /// Create a configuration covering clusters `0..address_space_end`
    pub fn new(address_space_end: u64) -> Self {
        Self {
            address_space_end,
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ConsolidationConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Set the lowest cluster eligible as a destination
    pub fn with_first_cluster(mut self, cluster: u64) -> Self {
        self.first_cluster = cluster;
        self
    }

    pub fn with_address_space_end(mut self, end: u64) -> Self {
        self.address_space_end = end;
        self
    }

    pub fn with_page_size(mut self, rows: usize) -> Self {
        self.page_size = rows;
        self
    }

    pub fn with_batch_size(mut self, records: usize) -> Self {
        self.batch_size = records;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate, returning the config on success
    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }
}
