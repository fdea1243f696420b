//! Typed access to allocation records

use super::{EntityTable, RecordPager, RowFilter, TableRow};
use crate::cidr;
use crate::error::BackendError;
use crate::models::AllocationRecord;
use crate::{Error, Result};
use futures::future::try_join_all;
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Largest number of operations a table accepts in one batch
pub const MAX_BATCH_SIZE: usize = 100;

const ENVIRONMENT_PROPERTY: &str = "environment";

/// Repository of committed allocations.
///
/// Records are keyed by `(caller key, network)`: the caller key is the
/// partition key and the canonical network is the row key.
#[derive(Clone)]
pub struct AllocationRepository {
    table: Arc<dyn EntityTable>,
}

impl AllocationRepository {
    pub fn new(table: Arc<dyn EntityTable>) -> Self {
        Self { table }
    }

    /// Underlying table
    pub fn table(&self) -> &Arc<dyn EntityTable> {
        &self.table
    }

    /// Persist a new record.
    ///
    /// Fails with [`Error::Conflict`] if the key already holds the network.
    pub async fn insert(&self, record: AllocationRecord) -> Result<AllocationRecord> {
        let row = record_to_row(&record);
        match self.table.insert(row).await {
            Ok(row) => record_from_row(row),
            Err(BackendError::Conflict(_)) => Err(Error::Conflict(format!(
                "{} is already allocated under key '{}'",
                record.network, record.partition_key
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Point lookup of one record
    pub async fn get(&self, key: &str, network: &Ipv4Net) -> Result<Option<AllocationRecord>> {
        self.table
            .get(key, &cidr::to_row_key(network))
            .await?
            .map(record_from_row)
            .transpose()
    }

    /// Records held under one caller key
    pub fn list_partition(&self, key: &str) -> RecordPager {
        RecordPager::new(self.table.clone(), RowFilter::Partition(key.to_string()))
    }

    /// Every record in the table
    pub fn list_all(&self) -> RecordPager {
        RecordPager::new(self.table.clone(), RowFilter::All)
    }

    /// Delete every record held under a caller key.
    ///
    /// Returns the number of records removed; unknown keys remove nothing.
    pub async fn delete_partition(&self, key: &str) -> Result<usize> {
        let records = self.list_partition(key).collect_all().await?;
        let count = records.len();
        self.delete(&records).await?;
        Ok(count)
    }

    /// Delete a set of records.
    ///
    /// Records are grouped by partition and each group is sent in batches
    /// of at most [`MAX_BATCH_SIZE`]; partitions are deleted concurrently.
    /// Repeated records are deleted once.
    pub async fn delete(&self, records: &[AllocationRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut unique: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for record in records {
            unique
                .entry(record.partition_key.as_str())
                .or_default()
                .insert(cidr::to_row_key(&record.network));
        }
        let partitions: BTreeMap<&str, Vec<String>> = unique
            .into_iter()
            .map(|(pk, row_keys)| (pk, row_keys.into_iter().collect()))
            .collect();

        let batches = partitions.iter().flat_map(|(pk, row_keys)| {
            row_keys
                .chunks(MAX_BATCH_SIZE)
                .map(move |chunk| self.table.delete_batch(pk, chunk))
        });

        try_join_all(batches).await?;

        tracing::debug!(
            records = records.len(),
            partitions = partitions.len(),
            "Deleted allocation records"
        );
        Ok(())
    }
}

fn record_to_row(record: &AllocationRecord) -> TableRow {
    let mut properties = serde_json::Map::new();
    properties.insert(
        ENVIRONMENT_PROPERTY.to_string(),
        serde_json::Value::String(record.environment.clone()),
    );

    TableRow {
        partition_key: record.partition_key.clone(),
        row_key: cidr::to_row_key(&record.network),
        properties,
        timestamp: record.created_at,
    }
}

pub(super) fn record_from_row(row: TableRow) -> Result<AllocationRecord> {
    let network = cidr::from_row_key(&row.row_key).map_err(|e| {
        Error::Store(format!(
            "row '{}'/'{}' does not hold a network: {}",
            row.partition_key, row.row_key, e
        ))
    })?;

    let environment = row
        .properties
        .get(ENVIRONMENT_PROPERTY)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(AllocationRecord {
        partition_key: row.partition_key,
        network,
        environment,
        created_at: row.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTable;

    fn repo(page_size: usize) -> (Arc<InMemoryTable>, AllocationRepository) {
        let table = Arc::new(InMemoryTable::with_page_size("allocations", page_size));
        (table.clone(), AllocationRepository::new(table))
    }

    fn record(key: &str, net: &str) -> AllocationRecord {
        AllocationRecord::new(key, cidr::parse(net).unwrap(), "dev")
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (_, repo) = repo(10);
        let inserted = repo.insert(record("k1", "10.0.0.0/24")).await.unwrap();

        let fetched = repo
            .get("k1", &cidr::parse("10.0.0.0/24").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.network, inserted.network);
        assert_eq!(fetched.environment, "dev");

        assert!(repo
            .get("k2", &cidr::parse("10.0.0.0/24").unwrap())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_insert_same_identity_conflicts() {
        let (_, repo) = repo(10);
        repo.insert(record("k1", "10.0.0.0/24")).await.unwrap();

        let result = repo.insert(record("k1", "10.0.0.0/24")).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_list_paginates() {
        let (_, repo) = repo(3);
        for i in 0..10 {
            repo.insert(record("k1", &format!("10.0.{}.0/24", i)))
                .await
                .unwrap();
        }
        repo.insert(record("k2", "10.1.0.0/24")).await.unwrap();

        let mut pager = repo.list_partition("k1");
        let mut total = 0;
        while let Some(batch) = pager.next_batch().await.unwrap() {
            assert!(batch.len() <= 3);
            total += batch.len();
        }
        assert_eq!(total, 10);
        assert_eq!(pager.pages_fetched(), 4);
        assert!(pager.is_exhausted());
        assert!(pager.next_batch().await.unwrap().is_none());

        assert_eq!(repo.list_all().collect_all().await.unwrap().len(), 11);
    }

    #[tokio::test]
    async fn test_delete_chunks_large_mixed_batches() {
        let (table, repo) = repo(1000);
        let mut records = Vec::new();
        for i in 0..250u32 {
            let key = if i % 2 == 0 { "even" } else { "odd" };
            let net = format!("10.{}.{}.0/24", i / 256, i % 256);
            records.push(repo.insert(record(key, &net)).await.unwrap());
        }
        repo.insert(record("keep", "192.168.0.0/24")).await.unwrap();

        repo.delete(&records).await.unwrap();
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_repeated_records_once() {
        let (table, repo) = repo(10);
        let a = repo.insert(record("k1", "10.0.0.0/24")).await.unwrap();
        let b = repo.insert(record("k1", "10.0.1.0/24")).await.unwrap();
        repo.insert(record("k2", "10.0.2.0/24")).await.unwrap();

        repo.delete(&[a.clone(), b, a]).await.unwrap();
        assert_eq!(table.len(), 1);
        assert!(repo
            .get("k2", &cidr::parse("10.0.2.0/24").unwrap())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_delete_partition() {
        let (table, repo) = repo(2);
        for i in 0..5 {
            repo.insert(record("k1", &format!("10.0.{}.0/24", i)))
                .await
                .unwrap();
        }
        repo.insert(record("k2", "10.1.0.0/24")).await.unwrap();

        assert_eq!(repo.delete_partition("k1").await.unwrap(), 5);
        assert_eq!(table.len(), 1);

        // Unknown keys are a no-op
        assert_eq!(repo.delete_partition("k1").await.unwrap(), 0);
        assert_eq!(repo.delete_partition("nope").await.unwrap(), 0);
    }
}
