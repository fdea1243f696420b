//! Data models for subnet allocation

mod allocation;
mod pool;

pub use allocation::{validate_key, AllocationRecord, MAX_KEY_LEN};
pub use pool::Pool;
