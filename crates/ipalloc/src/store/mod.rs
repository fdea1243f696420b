//! Partitioned entity storage for allocation records
//!
//! # Layers
//!
//! - [`EntityTable`]: a generic partitioned key/value table (one row per
//!   `(partition_key, row_key)`), queried one page at a time with opaque
//!   continuation tokens
//! - [`AllocationRepository`]: typed access to [`AllocationRecord`]s on top
//!   of a table, including batched deletes and paginated listing
//!
//! [`AllocationRecord`]: crate::models::AllocationRecord

mod memory;
mod pager;
mod repository;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryTable;
pub use pager::RecordPager;
pub use repository::{AllocationRepository, MAX_BATCH_SIZE};

use crate::error::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of rows per query page
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// A raw row in an entity table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub partition_key: String,
    pub row_key: String,
    /// Free-form entity properties
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// Time the row was written
    pub timestamp: DateTime<Utc>,
}

/// Which rows a query should return
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    /// Every row in the table
    All,
    /// Rows of one partition
    Partition(String),
}

impl RowFilter {
    /// Whether a row passes this filter
    pub fn matches(&self, row: &TableRow) -> bool {
        match self {
            RowFilter::All => true,
            RowFilter::Partition(pk) => row.partition_key == *pk,
        }
    }
}

/// Opaque cursor to the next page of a query.
///
/// Points at the first row the next page starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken {
    next_partition_key: String,
    next_row_key: String,
}

impl ContinuationToken {
    pub fn new(next_partition_key: impl Into<String>, next_row_key: impl Into<String>) -> Self {
        Self {
            next_partition_key: next_partition_key.into(),
            next_row_key: next_row_key.into(),
        }
    }

    pub fn next_partition_key(&self) -> &str {
        &self.next_partition_key
    }

    pub fn next_row_key(&self) -> &str {
        &self.next_row_key
    }
}

/// One page of query results
#[derive(Debug, Clone, Default)]
pub struct Segment {
    pub rows: Vec<TableRow>,
    /// Present while more rows remain
    pub continuation: Option<ContinuationToken>,
}

/// A partitioned entity table.
///
/// Rows are ordered by `(partition_key, row_key)`. Implementations must be
/// safe to share between tasks and processes that address the same table.
#[async_trait]
pub trait EntityTable: Send + Sync {
    /// Table name
    fn name(&self) -> &str;

    /// Insert a new row; fails with [`BackendError::Conflict`] if a row with
    /// the same identity exists
    async fn insert(&self, row: TableRow) -> Result<TableRow, BackendError>;

    /// Point lookup
    async fn get(&self, partition_key: &str, row_key: &str)
        -> Result<Option<TableRow>, BackendError>;

    /// Atomically delete rows of a single partition.
    ///
    /// Batches hold at most [`MAX_BATCH_SIZE`] row keys. If any row is
    /// missing the whole batch fails with [`BackendError::NotFound`] and
    /// nothing is deleted.
    async fn delete_batch(
        &self,
        partition_key: &str,
        row_keys: &[String],
    ) -> Result<(), BackendError>;

    /// Fetch one page of rows matching `filter`, starting at `continuation`
    async fn query_segment(
        &self,
        filter: &RowFilter,
        continuation: Option<&ContinuationToken>,
    ) -> Result<Segment, BackendError>;
}
