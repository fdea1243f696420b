//! Lease-based distributed lock manager

use super::backend::{LeaseBackend, LeaseProperties};
use crate::error::BackendError;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Metadata key holding the lock owner
pub const OWNER_ID_METADATA: &str = "OwnerId";

/// Default lease period
pub const DEFAULT_LEASE_PERIOD: Duration = Duration::from_secs(60);

/// Default time to wait for a lock
pub const DEFAULT_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default delay between acquisition attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Attempts made for idempotent backend writes (owner metadata, release)
const IDEMPOTENT_ATTEMPTS: u32 = 3;

/// Path of the lease object backing a lock
pub fn lock_path(lock_id: &str) -> String {
    format!("locks/{}", lock_id)
}

/// Proof of holding a lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    lock_id: String,
    lease_id: String,
    owner_id: Option<String>,
    lease_period: Duration,
    acquired_at: DateTime<Utc>,
}

impl LockHandle {
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Opaque token proving ownership
    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    pub fn lease_period(&self) -> Duration {
        self.lease_period
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

/// Options for [`DistributedLockManager::acquire_with_timeout`]
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub lease_period: Duration,
    pub acquisition_timeout: Duration,
    pub retry_interval: Duration,
    /// Recorded on the lock for diagnostics
    pub owner_id: Option<String>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            lease_period: DEFAULT_LEASE_PERIOD,
            acquisition_timeout: DEFAULT_ACQUISITION_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            owner_id: None,
        }
    }
}

/// Named, time-bounded mutual exclusion shared between processes
#[async_trait]
pub trait DistributedLockManager: Send + Sync {
    /// Make one attempt to take the lock.
    ///
    /// Returns `Ok(None)` when someone else holds it. The proposed lease id
    /// defaults to a fresh UUID.
    async fn try_lock(
        &self,
        lock_id: &str,
        owner_id: Option<&str>,
        proposed_lease_id: Option<&str>,
        lease_period: Duration,
    ) -> Result<Option<LockHandle>>;

    /// Extend a held lock.
    ///
    /// Returns `Ok(false)` on a transient backend failure, in which case the
    /// caller should retry sooner. Any other failure means the lease is lost.
    async fn renew(&self, handle: &LockHandle) -> Result<bool>;

    /// Give up a lock. Releasing an expired or superseded lease is not an error.
    async fn release(&self, handle: &LockHandle) -> Result<()>;

    /// Current owner of a lock, `None` if the lock is free
    async fn owner(&self, lock_id: &str) -> Result<Option<String>>;

    /// Poll [`try_lock`](Self::try_lock) until the lock is taken, the
    /// acquisition timeout elapses, or `cancel` fires.
    async fn acquire_with_timeout(
        &self,
        lock_id: &str,
        options: &AcquireOptions,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        let started = Instant::now();
        let deadline = started + options.acquisition_timeout;
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            attempts += 1;
            if let Some(handle) = self
                .try_lock(
                    lock_id,
                    options.owner_id.as_deref(),
                    None,
                    options.lease_period,
                )
                .await?
            {
                tracing::debug!(
                    lock_id = %lock_id,
                    lease_id = %handle.lease_id(),
                    attempts,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Acquired lock"
                );
                return Ok(handle);
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    lock_id = %lock_id,
                    attempts,
                    timeout_secs = options.acquisition_timeout.as_secs_f64(),
                    "Timed out waiting for lock"
                );
                return Err(Error::LockTimeout {
                    lock_id: lock_id.to_string(),
                    timeout_secs: options.acquisition_timeout.as_secs_f64(),
                });
            }

            let wait = options.retry_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// Lock manager over a [`LeaseBackend`].
///
/// Each lock is one lease object at `locks/<lock_id>`; holding the lock
/// means holding the object's lease.
#[derive(Clone)]
pub struct LeaseLockManager {
    backend: Arc<dyn LeaseBackend>,
}

impl LeaseLockManager {
    pub fn new(backend: Arc<dyn LeaseBackend>) -> Self {
        Self { backend }
    }

    async fn read_properties(&self, path: &str) -> Result<Option<LeaseProperties>> {
        match self.backend.properties(path).await {
            Ok(props) => Ok(props),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn try_acquire_lease(
        &self,
        path: &str,
        lease_id: &str,
        period: Duration,
    ) -> Result<Option<String>> {
        // Check first so that a held lock costs one read instead of a
        // rejected acquire
        if let Some(props) = self.read_properties(path).await? {
            if !props.state.is_acquirable() {
                return Ok(None);
            }
        }

        match self.backend.acquire(path, lease_id, period).await {
            Ok(id) => return Ok(Some(id)),
            Err(BackendError::Conflict(_)) => return Ok(None),
            Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.create_lock_object(path).await?;

        match self.backend.acquire(path, lease_id, period).await {
            Ok(id) => Ok(Some(id)),
            Err(BackendError::Conflict(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lock_object(&self, path: &str) -> Result<()> {
        match self.backend.create(path).await {
            Ok(()) => {
                tracing::debug!(path = %path, backend = self.backend.name(), "Created lock object");
                Ok(())
            }
            // Someone else created it first
            Err(BackendError::Conflict(_)) | Err(BackendError::PreconditionFailed(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_owner(&self, path: &str, lease_id: &str, owner_id: &str) -> Result<()> {
        retry_transient("write lock owner", move || async move {
            let Some(props) = self.backend.properties(path).await? else {
                return Ok(());
            };
            let mut metadata = props.metadata;
            metadata.insert(OWNER_ID_METADATA.to_string(), owner_id.to_string());
            self.backend.set_metadata(path, lease_id, metadata).await
        })
        .await
        .map_err(Error::from)
    }

    async fn release_lease(&self, path: &str, lease_id: &str) -> Result<()> {
        let result = retry_transient("release lease", move || {
            self.backend.release(path, lease_id)
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            // Nothing to release: the object is gone or another lease holds it
            Err(BackendError::NotFound(_)) | Err(BackendError::Conflict(_)) => {
                tracing::debug!(path = %path, lease_id = %lease_id, "Lease already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DistributedLockManager for LeaseLockManager {
    async fn try_lock(
        &self,
        lock_id: &str,
        owner_id: Option<&str>,
        proposed_lease_id: Option<&str>,
        lease_period: Duration,
    ) -> Result<Option<LockHandle>> {
        let path = lock_path(lock_id);
        let proposed = proposed_lease_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let Some(lease_id) = self.try_acquire_lease(&path, &proposed, lease_period).await? else {
            return Ok(None);
        };

        let owner_id = owner_id.filter(|o| !o.is_empty());
        if let Some(owner) = owner_id {
            if let Err(e) = self.write_owner(&path, &lease_id, owner).await {
                if let Err(release_err) = self.release_lease(&path, &lease_id).await {
                    tracing::warn!(
                        lock_id = %lock_id,
                        error = %release_err,
                        "Failed to release lease after owner write failure"
                    );
                }
                return Err(e);
            }
        }

        Ok(Some(LockHandle {
            lock_id: lock_id.to_string(),
            lease_id,
            owner_id: owner_id.map(str::to_string),
            lease_period,
            acquired_at: Utc::now(),
        }))
    }

    async fn renew(&self, handle: &LockHandle) -> Result<bool> {
        let path = lock_path(&handle.lock_id);
        match self.backend.renew(&path, &handle.lease_id).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    lock_id = %handle.lock_id,
                    error = %e,
                    "Transient failure renewing lease"
                );
                Ok(false)
            }
            Err(e) => Err(Error::LeaseLost {
                lock_id: handle.lock_id.clone(),
                lease_id: handle.lease_id.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<()> {
        self.release_lease(&lock_path(&handle.lock_id), &handle.lease_id)
            .await?;
        tracing::debug!(lock_id = %handle.lock_id, lease_id = %handle.lease_id, "Released lock");
        Ok(())
    }

    async fn owner(&self, lock_id: &str) -> Result<Option<String>> {
        let Some(props) = self.read_properties(&lock_path(lock_id)).await? else {
            return Ok(None);
        };
        // A free lock keeps the last owner's metadata; it has no current owner
        if props.is_free() {
            return Ok(None);
        }
        Ok(props.metadata.get(OWNER_ID_METADATA).cloned())
    }
}

/// Run an idempotent backend call, retrying transient failures
async fn retry_transient<F, Fut, T>(
    operation: &str,
    mut call: F,
) -> std::result::Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, BackendError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Err(e) if e.is_transient() && attempt < IDEMPOTENT_ATTEMPTS => {
                tracing::debug!(operation, attempt, error = %e, "Retrying backend call");
                tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
