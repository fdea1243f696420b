//! Application state shared across handlers

use super::authz::AccessTable;
use crate::allocator::AllocationService;
use crate::pool::PoolResolver;
use std::sync::Arc;

pub struct AppState {
    /// Allocation service
    pub service: Arc<AllocationService>,
    /// Pool definitions by environment
    pub pools: Arc<dyn PoolResolver>,
    /// Route authorization rules
    pub access: AccessTable,
    /// Accept caller identity from request headers
    pub trust_identity_headers: bool,
}

impl AppState {
    /// State with the standard access table and no header identity
    pub fn new(service: Arc<AllocationService>, pools: Arc<dyn PoolResolver>) -> Self {
        Self {
            service,
            pools,
            access: AccessTable::standard(),
            trust_identity_headers: false,
        }
    }

    pub fn with_access(mut self, access: AccessTable) -> Self {
        self.access = access;
        self
    }

    pub fn trusting_identity_headers(mut self, trust: bool) -> Self {
        self.trust_identity_headers = trust;
        self
    }
}
