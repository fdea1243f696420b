//! In-memory lease backend

use super::backend::{lease_deadline, LeaseBackend, LeaseProperties, LeaseState, LeaseStatus};
use crate::error::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
struct ActiveLease {
    id: String,
    period: Duration,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct LeaseObject {
    lease: Option<ActiveLease>,
    broken: bool,
    metadata: HashMap<String, String>,
}

impl LeaseObject {
    fn state(&self, now: DateTime<Utc>) -> LeaseState {
        match &self.lease {
            Some(lease) if lease.expires_at > now => LeaseState::Leased,
            Some(_) => LeaseState::Expired,
            None if self.broken => LeaseState::Broken,
            None => LeaseState::Available,
        }
    }

    /// Lease id currently holding the object, ignoring expired leases
    fn holder(&self, now: DateTime<Utc>) -> Option<&str> {
        self.lease
            .as_ref()
            .filter(|l| l.expires_at > now)
            .map(|l| l.id.as_str())
    }
}

/// Lease backend held in process memory.
///
/// Expiry is evaluated lazily against the wall clock on every call, so an
/// abandoned lease frees itself without a background task.
#[derive(Debug, Default)]
pub struct InMemoryLeaseBackend {
    objects: DashMap<String, LeaseObject>,
}

impl InMemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

fn not_found(path: &str) -> BackendError {
    BackendError::NotFound(format!("lease object '{}' does not exist", path))
}

#[async_trait]
impl LeaseBackend for InMemoryLeaseBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn properties(&self, path: &str) -> Result<Option<LeaseProperties>, BackendError> {
        let now = Utc::now();
        Ok(self.objects.get(path).map(|obj| {
            let state = obj.state(now);
            LeaseProperties {
                state,
                status: if state == LeaseState::Leased {
                    LeaseStatus::Locked
                } else {
                    LeaseStatus::Unlocked
                },
                expires_at: obj.lease.as_ref().map(|l| l.expires_at),
                metadata: obj.metadata.clone(),
            }
        }))
    }

    async fn create(&self, path: &str) -> Result<(), BackendError> {
        match self.objects.entry(path.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BackendError::Conflict(format!(
                "lease object '{}' already exists",
                path
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(LeaseObject::default());
                Ok(())
            }
        }
    }

    async fn acquire(
        &self,
        path: &str,
        proposed_lease_id: &str,
        period: Duration,
    ) -> Result<String, BackendError> {
        let expires_at = lease_deadline(period)?;
        let mut obj = self.objects.get_mut(path).ok_or_else(|| not_found(path))?;

        if let Some(holder) = obj.holder(Utc::now()) {
            if holder != proposed_lease_id {
                return Err(BackendError::Conflict(format!(
                    "lease object '{}' is already leased",
                    path
                )));
            }
        }

        obj.lease = Some(ActiveLease {
            id: proposed_lease_id.to_string(),
            period,
            expires_at,
        });
        obj.broken = false;
        Ok(proposed_lease_id.to_string())
    }

    async fn renew(&self, path: &str, lease_id: &str) -> Result<(), BackendError> {
        let mut obj = self.objects.get_mut(path).ok_or_else(|| not_found(path))?;

        match obj.lease.as_mut() {
            Some(lease) if lease.id == lease_id => {
                lease.expires_at = lease_deadline(lease.period)?;
                Ok(())
            }
            Some(_) => Err(BackendError::Conflict(format!(
                "lease id mismatch on '{}'",
                path
            ))),
            None => Err(BackendError::Conflict(format!(
                "no lease present on '{}'",
                path
            ))),
        }
    }

    async fn release(&self, path: &str, lease_id: &str) -> Result<(), BackendError> {
        let mut obj = self.objects.get_mut(path).ok_or_else(|| not_found(path))?;

        match obj.lease.as_ref().map(|l| l.id == lease_id) {
            Some(true) => {
                obj.lease = None;
                Ok(())
            }
            Some(false) => Err(BackendError::Conflict(format!(
                "lease id mismatch on '{}'",
                path
            ))),
            None => Err(BackendError::Conflict(format!(
                "no lease present on '{}'",
                path
            ))),
        }
    }

    async fn set_metadata(
        &self,
        path: &str,
        lease_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), BackendError> {
        let mut obj = self.objects.get_mut(path).ok_or_else(|| not_found(path))?;

        if obj.holder(Utc::now()) != Some(lease_id) {
            return Err(BackendError::PreconditionFailed(format!(
                "lease '{}' does not hold '{}'",
                lease_id, path
            )));
        }
        obj.metadata = metadata;
        Ok(())
    }

    async fn break_lease(&self, path: &str) -> Result<(), BackendError> {
        let mut obj = self.objects.get_mut(path).ok_or_else(|| not_found(path))?;

        if obj.holder(Utc::now()).is_none() {
            return Err(BackendError::Conflict(format!(
                "no lease present on '{}'",
                path
            )));
        }
        obj.lease = None;
        obj.broken = true;
        Ok(())
    }
}
