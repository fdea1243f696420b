//! Allocation service
//!
//! Orchestrates one allocation request:
//! - takes the global allocation lock
//! - snapshots every committed allocation
//! - finds and persists one block per requested prefix length
//! - rolls back everything it created if any length cannot be satisfied
//! - releases the lock on every exit path
//!
//! Lock-held work runs on its own task, so a caller that goes away (client
//! disconnect, timeout, `select!`) cannot strand the lock or leave a partial
//! allocation behind. The caller's departure cancels a per-call token; the
//! task finishes its current storage call, rolls back and releases.

use super::FirstFitAllocator;
use crate::cidr::MAX_PREFIX_LEN;
use crate::lock::{AcquireOptions, DistributedLockManager, LockHandle};
use crate::models::{validate_key, AllocationRecord, Pool};
use crate::store::AllocationRepository;
use crate::{Error, Result};
use ipnet::Ipv4Net;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Name of the lock serializing all allocations
pub const ALLOCATION_LOCK_ID: &str = "Allocation";

/// Configuration for [`AllocationService`]
#[derive(Debug, Clone)]
pub struct AllocationServiceConfig {
    /// Lock taken around every mutation
    pub lock_id: String,
    /// Lease and wait settings for the lock
    pub acquire: AcquireOptions,
}

impl Default for AllocationServiceConfig {
    fn default() -> Self {
        Self {
            lock_id: ALLOCATION_LOCK_ID.to_string(),
            acquire: AcquireOptions::default(),
        }
    }
}

/// Allocates, lists and releases subnets held under caller keys
pub struct AllocationService {
    inner: Arc<ServiceInner>,
}

/// State shared with detached lock-held tasks
struct ServiceInner {
    config: AllocationServiceConfig,
    repository: AllocationRepository,
    locks: Arc<dyn DistributedLockManager>,
    shutdown: CancellationToken,
}

impl AllocationService {
    pub fn new(repository: AllocationRepository, locks: Arc<dyn DistributedLockManager>) -> Self {
        Self::with_config(AllocationServiceConfig::default(), repository, locks)
    }

    pub fn with_config(
        config: AllocationServiceConfig,
        repository: AllocationRepository,
        locks: Arc<dyn DistributedLockManager>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                config,
                repository,
                locks,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &AllocationServiceConfig {
        &self.inner.config
    }

    pub fn repository(&self) -> &AllocationRepository {
        &self.inner.repository
    }

    /// Token that aborts pending lock waits and in-flight allocations when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Allocate one subnet per requested prefix length.
    ///
    /// All or nothing: if any length cannot be satisfied, every record
    /// created by this call is deleted and the error is returned. Dropping
    /// the returned future before it completes also rolls back.
    #[tracing::instrument(skip(self, pool), fields(environment = %pool.environment))]
    pub async fn allocate(
        &self,
        key: &str,
        pool: &Pool,
        prefix_lengths: &[u8],
    ) -> Result<Vec<Ipv4Net>> {
        validate_key(key)?;
        validate_prefix_lengths(prefix_lengths)?;

        let (owned_key, pool, prefix_lengths) =
            (key.to_string(), pool.clone(), prefix_lengths.to_vec());
        let networks = self
            .run_detached(move |inner, cancel| async move {
                inner
                    .with_lock(&cancel, || {
                        inner.allocate_locked(&owned_key, &pool, &prefix_lengths, &cancel)
                    })
                    .await
            })
            .await?;

        tracing::info!(
            key = %key,
            subnets = ?networks.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
            "Allocated subnets"
        );
        Ok(networks)
    }

    /// Records currently held under a key.
    ///
    /// Read-only and lock-free: the result may be stale by the time it is
    /// returned if an allocation is in flight.
    pub async fn list(&self, key: &str) -> Result<Vec<AllocationRecord>> {
        validate_key(key)?;
        self.inner.repository.list_partition(key).collect_all().await
    }

    /// Delete every record held under a key and return how many were removed.
    ///
    /// Releasing an unknown key removes nothing and succeeds.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, key: &str) -> Result<usize> {
        validate_key(key)?;

        let owned_key = key.to_string();
        let released = self
            .run_detached(move |inner, cancel| async move {
                inner
                    .with_lock(&cancel, || inner.repository.delete_partition(&owned_key))
                    .await
            })
            .await?;

        tracing::info!(key = %key, released, "Released subnets");
        Ok(released)
    }

    /// Current holder of the allocation lock, if any
    pub async fn lock_owner(&self) -> Result<Option<String>> {
        self.inner.locks.owner(&self.inner.config.lock_id).await
    }

    /// Run `task` on its own tokio task and wait for it.
    ///
    /// The task gets a token that is cancelled when this future is dropped
    /// or the service shuts down. It keeps running after the caller leaves,
    /// so it can roll back and release the lock.
    async fn run_detached<T, F, Fut>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<ServiceInner>, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let cancel = self.inner.shutdown.child_token();
        let _cancel_on_drop = cancel.clone().drop_guard();

        let work = task(self.inner.clone(), cancel).instrument(tracing::Span::current());
        tokio::spawn(work)
            .await
            .map_err(|e| Error::Internal(format!("Lock-held task failed: {}", e)))?
    }
}

impl ServiceInner {
    async fn with_lock<T, F, Fut>(&self, cancel: &CancellationToken, critical: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self
            .locks
            .acquire_with_timeout(&self.config.lock_id, &self.config.acquire, cancel)
            .await?;

        // Caller gone between acquiring and starting
        let result = if cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            critical().await
        };
        self.release_lock(&handle).await;
        result
    }

    async fn release_lock(&self, handle: &LockHandle) {
        if let Err(e) = self.locks.release(handle).await {
            tracing::warn!(
                lock_id = %handle.lock_id(),
                error = %e,
                "Failed to release lock, it will free itself when the lease expires"
            );
        }
    }

    async fn allocate_locked(
        &self,
        key: &str,
        pool: &Pool,
        prefix_lengths: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<Ipv4Net>> {
        let committed = self.repository.list_all().collect_all().await?;
        tracing::debug!(committed = committed.len(), "Loaded allocation snapshot");

        let mut allocator =
            FirstFitAllocator::new(pool.clone(), committed.into_iter().map(|r| r.network));
        let mut created: Vec<AllocationRecord> = Vec::with_capacity(prefix_lengths.len());

        for &prefix_len in prefix_lengths {
            let error = match self.allocate_one(&mut allocator, key, pool, prefix_len).await {
                Ok(record) => {
                    created.push(record);
                    if !cancel.is_cancelled() {
                        continue;
                    }
                    Error::Cancelled
                }
                Err(e) => e,
            };

            tracing::warn!(
                key = %key,
                prefix_len,
                error = %error,
                rollback = created.len(),
                "Allocation failed, rolling back"
            );
            self.rollback(&created).await;
            return Err(error);
        }

        Ok(created.into_iter().map(|r| r.network).collect())
    }

    async fn allocate_one(
        &self,
        allocator: &mut FirstFitAllocator,
        key: &str,
        pool: &Pool,
        prefix_len: u8,
    ) -> Result<AllocationRecord> {
        let network = allocator.allocate(prefix_len)?;
        let record = AllocationRecord::new(key, network, pool.environment.clone());
        let record = self.repository.insert(record).await?;
        tracing::debug!(key = %key, cidr = %record.network, "Persisted allocation");
        Ok(record)
    }

    /// Best effort: a failed rollback is logged and leaves orphaned records
    async fn rollback(&self, created: &[AllocationRecord]) {
        if created.is_empty() {
            return;
        }
        if let Err(e) = self.repository.delete(created).await {
            tracing::error!(
                error = %e,
                orphaned = ?created.iter().map(|r| r.network.to_string()).collect::<Vec<_>>(),
                "Rollback failed, orphaned allocations need manual cleanup"
            );
        }
    }
}

fn validate_prefix_lengths(prefix_lengths: &[u8]) -> Result<()> {
    if prefix_lengths.is_empty() {
        return Err(Error::Validation(
            "At least one prefix length is required".into(),
        ));
    }
    if let Some(bad) = prefix_lengths.iter().find(|&&p| p > MAX_PREFIX_LEN) {
        return Err(Error::Validation(format!(
            "Prefix length {} is out of range 0-{}",
            bad, MAX_PREFIX_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{InMemoryLeaseBackend, LeaseLockManager};
    use crate::store::InMemoryTable;

    fn service() -> AllocationService {
        let table = Arc::new(InMemoryTable::new("allocations"));
        let locks = Arc::new(LeaseLockManager::new(Arc::new(InMemoryLeaseBackend::new())));
        AllocationService::new(AllocationRepository::new(table), locks)
    }

    #[test]
    fn test_validate_prefix_lengths() {
        assert!(validate_prefix_lengths(&[0, 24, 32]).is_ok());
        assert!(matches!(
            validate_prefix_lengths(&[]),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            validate_prefix_lengths(&[24, 33]),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_allocate_list_release() {
        let service = service();
        let pool = Pool::parse("dev", "10.0.0.0/16");

        let nets = service.allocate("key-1", &pool, &[24, 26]).await.unwrap();
        assert_eq!(nets[0].to_string(), "10.0.0.0/24");
        assert_eq!(nets[1].to_string(), "10.0.1.0/26");

        let listed = service.list("key-1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|r| r.environment == "dev"));

        assert_eq!(service.release("key-1").await.unwrap(), 2);
        assert!(service.list("key-1").await.unwrap().is_empty());
        assert_eq!(service.release("key-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_input_touches_nothing() {
        let service = service();
        let pool = Pool::parse("dev", "10.0.0.0/16");

        assert!(matches!(
            service.allocate("key-1", &pool, &[]).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            service.allocate("bad/key", &pool, &[24]).await,
            Err(Error::Validation(_))
        ));
        assert!(service.lock_owner().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_released_after_failure() {
        let service = service();
        let pool = Pool::parse("dev", "10.0.0.0/24");

        assert!(service.allocate("k", &pool, &[24, 24]).await.is_err());
        // The lock is free again, so the next call goes through immediately
        assert_eq!(service.allocate("k", &pool, &[25]).await.unwrap().len(), 1);
    }
}
