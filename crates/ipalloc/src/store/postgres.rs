//! Postgres entity table
//!
//! All logical tables share one `entities` relation keyed by
//! `(table_name, partition_key, row_key)`.

use super::{
    ContinuationToken, EntityTable, RowFilter, Segment, TableRow, DEFAULT_PAGE_SIZE,
    MAX_BATCH_SIZE,
};
use crate::error::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    table_name    TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    row_key       TEXT NOT NULL,
    properties    JSONB NOT NULL DEFAULT '{}'::jsonb,
    timestamp     TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (table_name, partition_key, row_key)
)
"#;

#[derive(Debug, sqlx::FromRow)]
struct EntityRow {
    partition_key: String,
    row_key: String,
    properties: Json<serde_json::Map<String, serde_json::Value>>,
    timestamp: DateTime<Utc>,
}

impl From<EntityRow> for TableRow {
    fn from(row: EntityRow) -> Self {
        TableRow {
            partition_key: row.partition_key,
            row_key: row.row_key,
            properties: row.properties.0,
            timestamp: row.timestamp,
        }
    }
}

/// Entity table stored in Postgres
#[derive(Clone)]
pub struct PgTable {
    pool: PgPool,
    name: String,
    page_size: usize,
}

impl PgTable {
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Create the backing relation if it does not exist
    pub async fn migrate(&self) -> Result<(), BackendError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EntityTable for PgTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert(&self, row: TableRow) -> Result<TableRow, BackendError> {
        sqlx::query(
            r#"
            INSERT INTO entities (table_name, partition_key, row_key, properties, timestamp)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&self.name)
        .bind(&row.partition_key)
        .bind(&row.row_key)
        .bind(Json(&row.properties))
        .bind(row.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(row)
    }

    async fn get(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableRow>, BackendError> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT partition_key, row_key, properties, timestamp
            FROM entities
            WHERE table_name = $1 AND partition_key = $2 AND row_key = $3
            "#,
        )
        .bind(&self.name)
        .bind(partition_key)
        .bind(row_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(TableRow::from))
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

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            DELETE FROM entities
            WHERE table_name = $1 AND partition_key = $2 AND row_key = ANY($3)
            "#,
        )
        .bind(&self.name)
        .bind(partition_key)
        .bind(row_keys)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != row_keys.len() as u64 {
            tx.rollback().await?;
            return Err(BackendError::NotFound(format!(
                "batch on partition '{}' of table '{}' references missing entities",
                partition_key, self.name
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query_segment(
        &self,
        filter: &RowFilter,
        continuation: Option<&ContinuationToken>,
    ) -> Result<Segment, BackendError> {
        let partition = match filter {
            RowFilter::All => None,
            RowFilter::Partition(pk) => Some(pk.as_str()),
        };
        let (start_pk, start_rk) = match continuation {
            Some(token) => (token.next_partition_key(), token.next_row_key()),
            None => ("", ""),
        };

        // One extra row tells whether another page follows
        let mut rows = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT partition_key, row_key, properties, timestamp
            FROM entities
            WHERE table_name = $1
              AND ($2::text IS NULL OR partition_key = $2)
              AND (partition_key, row_key) >= ($3, $4)
            ORDER BY partition_key, row_key
            LIMIT $5
            "#,
        )
        .bind(&self.name)
        .bind(partition)
        .bind(start_pk)
        .bind(start_rk)
        .bind(self.page_size as i64 + 1)
        .fetch_all(&self.pool)
        .await?;

        let continuation = if rows.len() > self.page_size {
            rows.pop()
                .map(|next| ContinuationToken::new(next.partition_key, next.row_key))
        } else {
            None
        };

        Ok(Segment {
            rows: rows.into_iter().map(TableRow::from).collect(),
            continuation,
        })
    }
}
