//! Distributed locking
//!
//! A lock is a lease on a named object in a shared [`LeaseBackend`]. At most
//! one unexpired lease exists per lock id, so any number of processes
//! sharing the backend are serialized by it.
//!
//! Acquisition is polling based: [`DistributedLockManager::try_lock`] makes
//! one attempt and returns `None` when the lock is held;
//! [`DistributedLockManager::acquire_with_timeout`] retries at a fixed
//! interval until a deadline.

mod backend;
mod manager;
mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use backend::{LeaseBackend, LeaseProperties, LeaseState, LeaseStatus};
pub use manager::{
    lock_path, AcquireOptions, DistributedLockManager, LeaseLockManager, LockHandle,
    DEFAULT_ACQUISITION_TIMEOUT, DEFAULT_LEASE_PERIOD, DEFAULT_RETRY_INTERVAL, OWNER_ID_METADATA,
};
pub use memory::InMemoryLeaseBackend;
