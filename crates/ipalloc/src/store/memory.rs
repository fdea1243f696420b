//! In-memory entity table

use super::{
    ContinuationToken, EntityTable, RowFilter, Segment, TableRow, DEFAULT_PAGE_SIZE,
    MAX_BATCH_SIZE,
};
use crate::error::BackendError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;

type RowKey = (String, String);

/// Entity table held in process memory.
///
/// Rows live in an ordered map so pages come back in
/// `(partition_key, row_key)` order and continuation tokens stay valid
/// across concurrent inserts.
#[derive(Debug)]
pub struct InMemoryTable {
    name: String,
    page_size: usize,
    rows: RwLock<BTreeMap<RowKey, TableRow>>,
}

impl InMemoryTable {
    /// Create an empty table with the default page size
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_page_size(name, DEFAULT_PAGE_SIZE)
    }

    /// Create an empty table returning at most `page_size` rows per query page
    pub fn with_page_size(name: impl Into<String>, page_size: usize) -> Self {
        Self {
            name: name.into(),
            page_size: page_size.max(1),
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of stored rows
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Whether the table holds no rows
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl EntityTable for InMemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert(&self, row: TableRow) -> Result<TableRow, BackendError> {
        let key = (row.partition_key.clone(), row.row_key.clone());
        let mut rows = self.rows.write();
        if rows.contains_key(&key) {
            return Err(BackendError::Conflict(format!(
                "entity '{}'/'{}' already exists in table '{}'",
                key.0, key.1, self.name
            )));
        }
        rows.insert(key, row.clone());
        Ok(row)
    }

    async fn get(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableRow>, BackendError> {
        let key = (partition_key.to_string(), row_key.to_string());
        Ok(self.rows.read().get(&key).cloned())
    }

    async fn delete_batch(
        &self,
        partition_key: &str,
        row_keys: &[String],
    ) -> Result<(), BackendError> {
        if row_keys.is_empty() || row_keys.len() > MAX_BATCH_SIZE {
            return Err(BackendError::InvalidRequest(format!(
                "batch must hold 1..={} operations, got {}",
                MAX_BATCH_SIZE,
                row_keys.len()
            )));
        }

        let mut seen = HashSet::with_capacity(row_keys.len());
        if let Some(repeated) = row_keys.iter().find(|rk| !seen.insert(rk.as_str())) {
            return Err(BackendError::InvalidRequest(format!(
                "batch names entity '{}'/'{}' more than once",
                partition_key, repeated
            )));
        }

        let mut rows = self.rows.write();
        let keys: Vec<RowKey> = row_keys
            .iter()
            .map(|rk| (partition_key.to_string(), rk.clone()))
            .collect();

        if let Some(missing) = keys.iter().find(|k| !rows.contains_key(*k)) {
            return Err(BackendError::NotFound(format!(
                "entity '{}'/'{}' not found in table '{}'",
                missing.0, missing.1, self.name
            )));
        }

        for key in &keys {
            rows.remove(key);
        }
        Ok(())
    }

    async fn query_segment(
        &self,
        filter: &RowFilter,
        continuation: Option<&ContinuationToken>,
    ) -> Result<Segment, BackendError> {
        let rows = self.rows.read();

        let start = match continuation {
            Some(token) => Bound::Included((
                token.next_partition_key().to_string(),
                token.next_row_key().to_string(),
            )),
            None => match filter {
                RowFilter::All => Bound::Unbounded,
                RowFilter::Partition(pk) => Bound::Included((pk.clone(), String::new())),
            },
        };

        let mut matching = rows
            .range((start, Bound::Unbounded))
            .map(|(_, row)| row)
            .take_while(|row| filter.matches(row));

        let page: Vec<TableRow> = matching.by_ref().take(self.page_size).cloned().collect();
        let continuation = matching
            .next()
            .map(|row| ContinuationToken::new(&row.partition_key, &row.row_key));

        Ok(Segment {
            rows: page,
            continuation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(pk: &str, rk: &str) -> TableRow {
        TableRow {
            partition_key: pk.to_string(),
            row_key: rk.to_string(),
            properties: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_conflict() {
        let table = InMemoryTable::new("t");
        table.insert(row("a", "1")).await.unwrap();

        let result = table.insert(row("a", "1")).await;
        assert!(matches!(result, Err(BackendError::Conflict(_))));

        // Same row key in another partition is a different entity
        table.insert(row("b", "1")).await.unwrap();
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_query_pages_in_order() {
        let table = InMemoryTable::with_page_size("t", 2);
        for (pk, rk) in [("b", "2"), ("a", "1"), ("b", "1"), ("c", "1"), ("a", "2")] {
            table.insert(row(pk, rk)).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut token = None;
        let mut pages = 0;
        loop {
            let segment = table.query_segment(&RowFilter::All, token.as_ref()).await.unwrap();
            pages += 1;
            seen.extend(segment.rows.into_iter().map(|r| format!("{}{}", r.partition_key, r.row_key)));
            token = segment.continuation;
            if token.is_none() {
                break;
            }
        }

        assert_eq!(pages, 3);
        assert_eq!(seen, vec!["a1", "a2", "b1", "b2", "c1"]);
    }

    #[tokio::test]
    async fn test_query_partition() {
        let table = InMemoryTable::with_page_size("t", 1);
        for (pk, rk) in [("a", "1"), ("b", "1"), ("b", "2"), ("c", "1")] {
            table.insert(row(pk, rk)).await.unwrap();
        }

        let filter = RowFilter::Partition("b".into());
        let first = table.query_segment(&filter, None).await.unwrap();
        assert_eq!(first.rows[0].row_key, "1");
        let token = first.continuation.expect("second page");

        let second = table.query_segment(&filter, Some(&token)).await.unwrap();
        assert_eq!(second.rows[0].row_key, "2");
        assert!(second.continuation.is_none());
    }

    #[tokio::test]
    async fn test_delete_batch_is_atomic() {
        let table = InMemoryTable::new("t");
        table.insert(row("a", "1")).await.unwrap();
        table.insert(row("a", "2")).await.unwrap();

        let result = table
            .delete_batch("a", &["1".to_string(), "missing".to_string()])
            .await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));
        assert_eq!(table.len(), 2);

        table
            .delete_batch("a", &["1".to_string(), "2".to_string()])
            .await
            .unwrap();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_delete_batch_limits() {
        let table = InMemoryTable::new("t");
        let too_many: Vec<String> = (0..=MAX_BATCH_SIZE).map(|i| i.to_string()).collect();

        assert!(matches!(
            table.delete_batch("a", &too_many).await,
            Err(BackendError::InvalidRequest(_))
        ));
        assert!(matches!(
            table.delete_batch("a", &[]).await,
            Err(BackendError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_batch_rejects_repeated_keys() {
        let table = InMemoryTable::new("t");
        table.insert(row("a", "1")).await.unwrap();

        let result = table
            .delete_batch("a", &["1".to_string(), "1".to_string()])
            .await;
        assert!(matches!(result, Err(BackendError::InvalidRequest(_))));
        assert_eq!(table.len(), 1);
    }
}
