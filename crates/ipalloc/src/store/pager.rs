//! Cursor-paginated reads of allocation records

use super::{ContinuationToken, EntityTable, RowFilter};
use crate::models::AllocationRecord;
use crate::Result;
use std::sync::Arc;

use super::repository::record_from_row;

/// Explicit cursor over a paginated query.
///
/// Each call to [`RecordPager::next_batch`] fetches one page and keeps the
/// continuation token for the next call. A pager cannot be resumed once
/// dropped; issue the query again to restart from the beginning.
pub struct RecordPager {
    table: Arc<dyn EntityTable>,
    filter: RowFilter,
    continuation: Option<ContinuationToken>,
    exhausted: bool,
    pages_fetched: usize,
}

impl RecordPager {
    pub(crate) fn new(table: Arc<dyn EntityTable>, filter: RowFilter) -> Self {
        Self {
            table,
            filter,
            continuation: None,
            exhausted: false,
            pages_fetched: 0,
        }
    }

    /// Fetch the next page, or `None` once the query is exhausted.
    ///
    /// A page may be empty while a continuation token is still present;
    /// callers should keep polling until `None`.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<AllocationRecord>>> {
        if self.exhausted {
            return Ok(None);
        }

        let segment = self
            .table
            .query_segment(&self.filter, self.continuation.as_ref())
            .await?;

        self.pages_fetched += 1;
        self.continuation = segment.continuation;
        self.exhausted = self.continuation.is_none();

        let records = segment
            .rows
            .into_iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(records))
    }

    /// Drain every remaining page into one vector
    pub async fn collect_all(mut self) -> Result<Vec<AllocationRecord>> {
        let mut all = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            all.extend(batch);
        }
        Ok(all)
    }

    /// Number of pages fetched so far
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Whether the query has no more pages
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}
