//! Lease-bearing object store interface
//!
//! A lease backend stores named objects that can each carry at most one
//! time-bounded lease. The lock manager builds mutual exclusion on top of
//! it; backends only have to report conflicts faithfully.

use crate::error::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Lease lifecycle state of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseState {
    /// No lease has been taken, or the last one was released
    Available,
    /// A lease is active
    Leased,
    /// The last lease ran out without being renewed or released
    Expired,
    /// A break is in progress
    Breaking,
    /// The lease was broken and can be acquired again
    Broken,
}

impl LeaseState {
    /// Whether a new lease may be taken in this state
    pub fn is_acquirable(&self) -> bool {
        matches!(
            self,
            LeaseState::Available | LeaseState::Expired | LeaseState::Broken
        )
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseState::Available => write!(f, "available"),
            LeaseState::Leased => write!(f, "leased"),
            LeaseState::Expired => write!(f, "expired"),
            LeaseState::Breaking => write!(f, "breaking"),
            LeaseState::Broken => write!(f, "broken"),
        }
    }
}

/// Whether the object is currently locked by a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseStatus {
    Locked,
    Unlocked,
}

/// Properties of a lease-bearing object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseProperties {
    pub state: LeaseState,
    pub status: LeaseStatus,
    /// Expiry of the current (or last) lease
    pub expires_at: Option<DateTime<Utc>>,
    /// User metadata stored on the object
    pub metadata: HashMap<String, String>,
}

impl LeaseProperties {
    /// Properties of a freshly created, unleased object
    pub fn available() -> Self {
        Self {
            state: LeaseState::Available,
            status: LeaseStatus::Unlocked,
            expires_at: None,
            metadata: HashMap::new(),
        }
    }

    /// Whether nobody currently holds the object
    pub fn is_free(&self) -> bool {
        self.state.is_acquirable() && self.status == LeaseStatus::Unlocked
    }
}

/// Lease-bearing object store.
///
/// Error contract (mirrors HTTP status classes):
/// - [`BackendError::NotFound`] when the object does not exist
/// - [`BackendError::Conflict`] when another lease holds the object, or
///   when creating an object that already exists
/// - [`BackendError::PreconditionFailed`] when a lease-conditioned write
///   presents the wrong lease id
/// - [`BackendError::Unavailable`] for transient server-side failures
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Backend name used in logs
    fn name(&self) -> &str;

    /// Read object properties; `None` if the object does not exist
    async fn properties(&self, path: &str) -> Result<Option<LeaseProperties>, BackendError>;

    /// Create an empty object
    async fn create(&self, path: &str) -> Result<(), BackendError>;

    /// Take a lease on an object and return its lease id.
    ///
    /// Acquiring with the lease id that already holds the object renews it.
    async fn acquire(
        &self,
        path: &str,
        proposed_lease_id: &str,
        period: Duration,
    ) -> Result<String, BackendError>;

    /// Extend a lease by its original period
    async fn renew(&self, path: &str, lease_id: &str) -> Result<(), BackendError>;

    /// Give up a lease. Releasing an expired lease succeeds.
    async fn release(&self, path: &str, lease_id: &str) -> Result<(), BackendError>;

    /// Replace object metadata; the write is conditioned on holding `lease_id`
    async fn set_metadata(
        &self,
        path: &str,
        lease_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), BackendError>;

    /// Break the current lease immediately, whoever holds it
    async fn break_lease(&self, path: &str) -> Result<(), BackendError>;
}

pub(crate) fn lease_deadline(period: Duration) -> Result<DateTime<Utc>, BackendError> {
    let period = chrono::Duration::from_std(period)
        .map_err(|e| BackendError::InvalidRequest(format!("invalid lease period: {}", e)))?;
    Ok(Utc::now() + period)
}
