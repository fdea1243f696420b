//! Pool definition resolution
//!
//! Maps environment names to the [`Pool`] they allocate from.

use crate::models::Pool;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Source of pool definitions
pub trait PoolResolver: Send + Sync {
    /// Pool configured for an environment
    fn resolve(&self, environment: &str) -> Option<Pool>;

    /// Every configured environment, sorted
    fn environments(&self) -> Vec<String>;

    /// Pick the pool for an allocation request.
    ///
    /// An explicit environment must be configured. Without one, the only
    /// configured environment is used; if there are several the caller has
    /// to choose.
    fn select(&self, environment: Option<&str>) -> Result<Pool> {
        match environment.map(str::trim).filter(|e| !e.is_empty()) {
            Some(env) => self.resolve(env).ok_or_else(|| {
                Error::Validation(format!("No pool is configured for environment '{}'", env))
            }),
            None => {
                let envs = self.environments();
                match envs.as_slice() {
                    [only] => self.resolve(only).ok_or_else(|| {
                        Error::Internal(format!("Pool for '{}' disappeared", only))
                    }),
                    [] => Err(Error::Validation("No pools are configured".into())),
                    _ => Err(Error::Validation(format!(
                        "Environment is required, choose one of: {}",
                        envs.join(", ")
                    ))),
                }
            }
        }
    }
}

/// Resolver over a fixed set of pools.
///
/// Environment names are matched case-insensitively and stored lowercase.
#[derive(Debug, Clone, Default)]
pub struct StaticPoolResolver {
    pools: BTreeMap<String, Pool>,
}

impl StaticPoolResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(environment, pool spec)` pairs
    pub fn from_specs<I, K, V>(specs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut resolver = Self::new();
        for (env, spec) in specs {
            resolver.insert(Pool::parse(env.as_ref(), spec.as_ref()));
        }
        resolver
    }

    /// Add or replace a pool
    pub fn insert(&mut self, mut pool: Pool) {
        pool.environment = pool.environment.to_lowercase();
        if pool.is_empty() {
            tracing::warn!(environment = %pool.environment, "Pool has no included networks");
        }
        self.pools.insert(pool.environment.clone(), pool);
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }
}

impl PoolResolver for StaticPoolResolver {
    fn resolve(&self, environment: &str) -> Option<Pool> {
        self.pools.get(&environment.to_lowercase()).cloned()
    }

    fn environments(&self) -> Vec<String> {
        self.pools.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> StaticPoolResolver {
        StaticPoolResolver::from_specs([
            ("DEV", "10.0.0.0/16"),
            ("prod", "10.1.0.0/16, !10.1.0.0/24"),
        ])
    }

    #[test]
    fn test_resolve_case_insensitive() {
        let resolver = resolver();
        let pool = resolver.resolve("Dev").unwrap();
        assert_eq!(pool.environment, "dev");
        assert_eq!(resolver.resolve("prod").unwrap().excluded.len(), 1);
        assert!(resolver.resolve("qa").is_none());
        assert_eq!(resolver.environments(), vec!["dev", "prod"]);
    }

    #[test]
    fn test_select_explicit() {
        let resolver = resolver();
        assert_eq!(resolver.select(Some("prod")).unwrap().environment, "prod");
        assert!(matches!(
            resolver.select(Some("qa")),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_select_default() {
        let single = StaticPoolResolver::from_specs([("dev", "10.0.0.0/16")]);
        assert_eq!(single.select(None).unwrap().environment, "dev");
        assert_eq!(single.select(Some("  ")).unwrap().environment, "dev");

        let err = resolver().select(None).unwrap_err();
        assert!(err.to_string().contains("dev, prod"));

        assert!(StaticPoolResolver::new().select(None).is_err());
    }
}
