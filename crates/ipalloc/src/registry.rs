//! Backend registry
//!
//! Built once at startup from [`StorageConfig`] and handed to whatever
//! needs storage. Table handles are created lazily and cached by name;
//! [`BackendRegistry::shutdown`] drops them and closes connections.

use crate::config::{StorageBackend, StorageConfig};
use crate::lock::{DistributedLockManager, InMemoryLeaseBackend, LeaseBackend, LeaseLockManager};
use crate::store::{AllocationRepository, EntityTable, InMemoryTable};
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(feature = "postgres")]
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Shared handles to the storage and lease backends
pub struct BackendRegistry {
    config: StorageConfig,
    tables: DashMap<String, Arc<dyn EntityTable>>,
    leases: Arc<dyn LeaseBackend>,
    #[cfg(feature = "postgres")]
    pg_pool: Option<PgPool>,
    closed: AtomicBool,
}

impl BackendRegistry {
    /// Connect to the configured backend
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        match config.backend {
            StorageBackend::Memory => Ok(Self::in_memory(config.clone())),
            StorageBackend::Postgres => Self::connect_postgres(config).await,
        }
    }

    /// Registry whose tables and leases live in process memory
    pub fn in_memory(config: StorageConfig) -> Self {
        Self {
            config,
            tables: DashMap::new(),
            leases: Arc::new(InMemoryLeaseBackend::new()),
            #[cfg(feature = "postgres")]
            pg_pool: None,
            closed: AtomicBool::new(false),
        }
    }

    #[cfg(feature = "postgres")]
    async fn connect_postgres(config: &StorageConfig) -> Result<Self> {
        use crate::lock::postgres::PgLeaseBackend;
        use crate::store::postgres::PgTable;

        let url = config
            .url
            .as_deref()
            .ok_or_else(|| Error::Config("storage.url is required for postgres".into()))?;

        tracing::info!(max_connections = config.max_connections, "Connecting to database");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await
            .map_err(crate::error::BackendError::from)?;

        PgTable::new(pool.clone(), config.table.clone())
            .migrate()
            .await?;
        let leases = PgLeaseBackend::new(pool.clone());
        leases.migrate().await?;

        Ok(Self {
            config: config.clone(),
            tables: DashMap::new(),
            leases: Arc::new(leases),
            pg_pool: Some(pool),
            closed: AtomicBool::new(false),
        })
    }

    #[cfg(not(feature = "postgres"))]
    async fn connect_postgres(_config: &StorageConfig) -> Result<Self> {
        Err(Error::Config(
            "the postgres backend requires building with the `postgres` feature".into(),
        ))
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Handle to a named table
    pub fn table(&self, name: &str) -> Result<Arc<dyn EntityTable>> {
        self.ensure_open()?;
        let table = self
            .tables
            .entry(name.to_string())
            .or_insert_with(|| self.open_table(name))
            .clone();
        Ok(table)
    }

    fn open_table(&self, name: &str) -> Arc<dyn EntityTable> {
        tracing::debug!(table = %name, backend = %self.config.backend, "Opening table");

        #[cfg(feature = "postgres")]
        if let Some(pool) = &self.pg_pool {
            return Arc::new(
                crate::store::postgres::PgTable::new(pool.clone(), name)
                    .with_page_size(self.config.page_size),
            );
        }

        Arc::new(InMemoryTable::with_page_size(name, self.config.page_size))
    }

    /// Repository over the configured allocation table
    pub fn repository(&self) -> Result<AllocationRepository> {
        Ok(AllocationRepository::new(self.table(&self.config.table)?))
    }

    pub fn lease_backend(&self) -> Result<Arc<dyn LeaseBackend>> {
        self.ensure_open()?;
        Ok(self.leases.clone())
    }

    /// Lock manager over the shared lease backend
    pub fn lock_manager(&self) -> Result<Arc<dyn DistributedLockManager>> {
        Ok(Arc::new(LeaseLockManager::new(self.lease_backend()?)))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop cached handles and close connections. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tables.clear();

        #[cfg(feature = "postgres")]
        if let Some(pool) = &self.pg_pool {
            pool.close().await;
        }

        tracing::info!(backend = %self.config.backend, "Backend registry shut down");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Internal("backend registry is shut down".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tables_are_cached() {
        let registry = BackendRegistry::in_memory(StorageConfig::default());
        let a = registry.table("allocations").unwrap();
        let b = registry.table("allocations").unwrap();
        let other = registry.table("other").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn test_registries_are_isolated() {
        let first = BackendRegistry::in_memory(StorageConfig::default());
        let second = BackendRegistry::in_memory(StorageConfig::default());

        let record = crate::models::AllocationRecord::new(
            "k",
            crate::cidr::parse("10.0.0.0/24").unwrap(),
            "dev",
        );
        first.repository().unwrap().insert(record).await.unwrap();

        let listed = second.repository().unwrap().list_all().collect_all().await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_registry() {
        let registry = BackendRegistry::connect(&StorageConfig::default())
            .await
            .unwrap();
        registry.table("allocations").unwrap();

        registry.shutdown().await;
        registry.shutdown().await;

        assert!(registry.is_closed());
        assert!(registry.table("allocations").is_err());
        assert!(registry.lock_manager().is_err());
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn test_postgres_needs_feature() {
        let config = StorageConfig {
            backend: StorageBackend::Postgres,
            url: Some("postgres://localhost/ipalloc".into()),
            ..Default::default()
        };
        assert!(matches!(
            BackendRegistry::connect(&config).await,
            Err(Error::Config(_))
        ));
    }
}
