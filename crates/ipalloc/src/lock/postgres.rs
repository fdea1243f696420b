//! Postgres lease backend
//!
//! Each lease object is one row of `lease_objects`. Lease checks run in the
//! `UPDATE ... WHERE` clause against the database clock, so concurrent
//! acquirers in different processes cannot both win.

use super::backend::{LeaseBackend, LeaseProperties, LeaseState, LeaseStatus};
use crate::error::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS lease_objects (
    path            TEXT PRIMARY KEY,
    lease_id        TEXT,
    lease_period_ms BIGINT,
    expires_at      TIMESTAMPTZ,
    broken          BOOLEAN NOT NULL DEFAULT FALSE,
    metadata        JSONB NOT NULL DEFAULT '{}'::jsonb
)
"#;

#[derive(Debug, sqlx::FromRow)]
struct LeaseRow {
    lease_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    broken: bool,
    metadata: Json<HashMap<String, String>>,
    observed_at: DateTime<Utc>,
}

impl LeaseRow {
    fn into_properties(self) -> LeaseProperties {
        let state = match (self.lease_id, self.expires_at) {
            (Some(_), Some(expires)) if expires > self.observed_at => LeaseState::Leased,
            (Some(_), _) => LeaseState::Expired,
            (None, _) if self.broken => LeaseState::Broken,
            (None, _) => LeaseState::Available,
        };
        LeaseProperties {
            state,
            status: if state == LeaseState::Leased {
                LeaseStatus::Locked
            } else {
                LeaseStatus::Unlocked
            },
            expires_at: self.expires_at,
            metadata: self.metadata.0,
        }
    }
}

/// Lease backend over a shared Postgres database
#[derive(Clone)]
pub struct PgLeaseBackend {
    pool: PgPool,
}

impl PgLeaseBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the backing table if it does not exist
    pub async fn migrate(&self) -> Result<(), BackendError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, BackendError> {
        let found: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM lease_objects WHERE path = $1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Turn a write that matched no row into the matching error
    async fn explain_miss(
        &self,
        path: &str,
        on_exists: impl FnOnce(String) -> BackendError,
    ) -> BackendError {
        match self.exists(path).await {
            Ok(true) => on_exists(format!("lease condition not met on '{}'", path)),
            Ok(false) => BackendError::NotFound(format!("lease object '{}' does not exist", path)),
            Err(e) => e,
        }
    }
}

fn period_ms(period: Duration) -> i64 {
    i64::try_from(period.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl LeaseBackend for PgLeaseBackend {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn properties(&self, path: &str) -> Result<Option<LeaseProperties>, BackendError> {
        let row = sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT lease_id, expires_at, broken, metadata, now() AS observed_at
            FROM lease_objects
            WHERE path = $1
            "#,
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(LeaseRow::into_properties))
    }

    async fn create(&self, path: &str) -> Result<(), BackendError> {
        sqlx::query("INSERT INTO lease_objects (path) VALUES ($1)")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn acquire(
        &self,
        path: &str,
        proposed_lease_id: &str,
        period: Duration,
    ) -> Result<String, BackendError> {
        let acquired: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE lease_objects
            SET lease_id = $2,
                lease_period_ms = $3,
                expires_at = now() + $3 * interval '1 millisecond',
                broken = FALSE
            WHERE path = $1
              AND (lease_id IS NULL OR expires_at <= now() OR lease_id = $2)
            RETURNING lease_id
            "#,
        )
        .bind(path)
        .bind(proposed_lease_id)
        .bind(period_ms(period))
        .fetch_optional(&self.pool)
        .await?;

        match acquired {
            Some((lease_id,)) => Ok(lease_id),
            None => Err(self.explain_miss(path, BackendError::Conflict).await),
        }
    }

    async fn renew(&self, path: &str, lease_id: &str) -> Result<(), BackendError> {
        let result = sqlx::query(
            r#"
            UPDATE lease_objects
            SET expires_at = now() + lease_period_ms * interval '1 millisecond'
            WHERE path = $1 AND lease_id = $2
            "#,
        )
        .bind(path)
        .bind(lease_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_miss(path, BackendError::Conflict).await);
        }
        Ok(())
    }

    async fn release(&self, path: &str, lease_id: &str) -> Result<(), BackendError> {
        let result = sqlx::query(
            r#"
            UPDATE lease_objects
            SET lease_id = NULL, expires_at = NULL
            WHERE path = $1 AND lease_id = $2
            "#,
        )
        .bind(path)
        .bind(lease_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_miss(path, BackendError::Conflict).await);
        }
        Ok(())
    }

    async fn set_metadata(
        &self,
        path: &str,
        lease_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), BackendError> {
        let result = sqlx::query(
            r#"
            UPDATE lease_objects
            SET metadata = $3
            WHERE path = $1 AND lease_id = $2 AND expires_at > now()
            "#,
        )
        .bind(path)
        .bind(lease_id)
        .bind(Json(&metadata))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .explain_miss(path, BackendError::PreconditionFailed)
                .await);
        }
        Ok(())
    }

    async fn break_lease(&self, path: &str) -> Result<(), BackendError> {
        let result = sqlx::query(
            r#"
            UPDATE lease_objects
            SET lease_id = NULL, expires_at = NULL, broken = TRUE
            WHERE path = $1 AND lease_id IS NOT NULL AND expires_at > now()
            "#,
        )
        .bind(path)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_miss(path, BackendError::Conflict).await);
        }
        Ok(())
    }
}
