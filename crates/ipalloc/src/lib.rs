//! IPv4 subnet allocation service
//!
//! Hands out non-overlapping IPv4 subnets from per-environment pools:
//! - Pools are lists of included and excluded CIDR blocks
//! - Allocation is first-fit, all-or-nothing per request
//! - Allocations are stored per caller key and released as a group
//! - Concurrent allocators are serialized by a lease-based distributed lock
//!
//! Storage and lease backends are in-memory by default, or PostgreSQL with
//! the `postgres` feature.

pub mod allocator;
pub mod api;
pub mod cidr;
pub mod config;
pub mod error;
pub mod lock;
pub mod models;
pub mod pool;
pub mod registry;
pub mod store;
pub mod telemetry;

// Re-export core types
pub use allocator::{AllocationService, AllocationServiceConfig, FirstFitAllocator};
pub use config::Config;
pub use error::{BackendError, Error, Result};
pub use lock::{DistributedLockManager, LeaseLockManager, LockHandle};
pub use models::{AllocationRecord, Pool};
pub use pool::{PoolResolver, StaticPoolResolver};
pub use registry::BackendRegistry;
