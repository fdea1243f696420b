//! Subnet allocation
//!
//! - [`FirstFitAllocator`]: pure, in-memory first-fit search over a pool
//! - [`AllocationService`]: the locked, all-or-nothing allocation
//!   transaction against the store

mod first_fit;
mod service;

pub use first_fit::FirstFitAllocator;
pub use service::{AllocationService, AllocationServiceConfig, ALLOCATION_LOCK_ID};
