//! Service configuration
//!
//! Loaded from a TOML file (or defaults) and then overlaid with environment
//! variables:
//! - `IPALLOC_HOST`, `IPALLOC_PORT`: listen address
//! - `DATABASE_URL`: storage connection string
//! - `IPALLOC_LOCK_OWNER`: owner id recorded on the allocation lock
//! - `IPPOOL_<ENVIRONMENT>`: pool spec for one environment

use crate::allocator::{AllocationServiceConfig, ALLOCATION_LOCK_ID};
use crate::lock::AcquireOptions;
use crate::pool::StaticPoolResolver;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Prefix of per-environment pool variables
pub const POOL_ENV_PREFIX: &str = "IPPOOL_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Environment name -> pool spec
    #[serde(default)]
    pub pools: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock serializing allocations
    #[serde(default = "default_lock_name")]
    pub name: String,
    #[serde(default = "default_lease_period")]
    pub lease_period_secs: u64,
    #[serde(default = "default_acquisition_timeout")]
    pub acquisition_timeout_secs: u64,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
    /// Recorded on the lock while held
    #[serde(default)]
    pub owner_id: Option<String>,
}

fn default_lock_name() -> String {
    ALLOCATION_LOCK_ID.to_string()
}
fn default_lease_period() -> u64 {
    60
}
fn default_acquisition_timeout() -> u64 {
    300
}
fn default_retry_interval() -> u64 {
    100
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: default_lock_name(),
            lease_period_secs: default_lease_period(),
            acquisition_timeout_secs: default_acquisition_timeout(),
            retry_interval_ms: default_retry_interval(),
            owner_id: None,
        }
    }
}

impl LockConfig {
    pub fn acquire_options(&self) -> AcquireOptions {
        AcquireOptions {
            lease_period: Duration::from_secs(self.lease_period_secs),
            acquisition_timeout: Duration::from_secs(self.acquisition_timeout_secs),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            owner_id: self.owner_id.clone(),
        }
    }

    pub fn service_config(&self) -> AllocationServiceConfig {
        AllocationServiceConfig {
            lock_id: self.name.clone(),
            acquire: self.acquire_options(),
        }
    }
}

/// Which backend stores allocations and leases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Memory => write!(f, "memory"),
            StorageBackend::Postgres => write!(f, "postgres"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Connection string, required for `postgres`
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Logical table holding allocation records
    #[serde(default = "default_table")]
    pub table: String,
}

fn default_max_connections() -> u32 {
    10
}
fn default_page_size() -> usize {
    crate::store::DEFAULT_PAGE_SIZE
}
fn default_table() -> String {
    "allocations".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            url: None,
            max_connections: default_max_connections(),
            page_size: default_page_size(),
            table: default_table(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Build caller identity from `x-caller-id` / `x-caller-roles` headers.
    ///
    /// Only enable behind a proxy that authenticates callers and sets them.
    #[serde(default)]
    pub trust_identity_headers: bool,
}

impl Config {
    /// Load from a TOML file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Overlay values from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(std::env::vars())
    }

    /// Overlay values from `(name, value)` pairs
    pub fn apply_vars<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (name, value) in vars {
            let name = name.as_ref();
            match name {
                "IPALLOC_HOST" => self.server.host = value.into(),
                "IPALLOC_PORT" => {
                    let value = value.into();
                    self.server.port = value.parse().map_err(|_| {
                        Error::Config(format!("IPALLOC_PORT is not a port number: '{}'", value))
                    })?;
                }
                "DATABASE_URL" => self.storage.url = Some(value.into()),
                "IPALLOC_LOCK_OWNER" => self.lock.owner_id = Some(value.into()),
                _ => {
                    if let Some(env) = name.strip_prefix(POOL_ENV_PREFIX) {
                        if !env.is_empty() {
                            self.pools.insert(env.to_lowercase(), value.into());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.lock.name.trim().is_empty() {
            return Err(Error::Config("lock.name must not be empty".into()));
        }
        if self.lock.lease_period_secs == 0 {
            return Err(Error::Config("lock.lease_period_secs must be positive".into()));
        }
        if self.lock.retry_interval_ms == 0 {
            return Err(Error::Config("lock.retry_interval_ms must be positive".into()));
        }
        if self.storage.page_size == 0 {
            return Err(Error::Config("storage.page_size must be positive".into()));
        }
        if self.storage.backend == StorageBackend::Postgres && self.storage.url.is_none() {
            return Err(Error::Config(
                "storage.url (or DATABASE_URL) is required for the postgres backend".into(),
            ));
        }
        Ok(())
    }

    /// Resolver over the configured pools
    pub fn pool_resolver(&self) -> StaticPoolResolver {
        StaticPoolResolver::from_specs(&self.pools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolResolver;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.lock.name, "Allocation");

        let options = config.lock.acquire_options();
        assert_eq!(options.lease_period, Duration::from_secs(60));
        assert_eq!(options.acquisition_timeout, Duration::from_secs(300));
        assert_eq!(options.retry_interval, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config = Config::from_toml(
            r#"
            [server]
            port = 9000

            [lock]
            acquisition_timeout_secs = 10

            [storage]
            backend = "postgres"
            url = "postgres://localhost/ipalloc"

            [pools]
            dev = "10.0.0.0/16, !10.0.0.0/24"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.lock.acquisition_timeout_secs, 10);
        assert_eq!(config.lock.lease_period_secs, 60);
        assert_eq!(config.storage.backend, StorageBackend::Postgres);
        assert!(config.validate().is_ok());

        let pool = config.pool_resolver().resolve("dev").unwrap();
        assert_eq!(pool.excluded.len(), 1);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Config::from_toml("[server]\nport = \"nope\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_env_overlay() {
        let mut config = Config::default();
        config
            .apply_vars([
                ("IPALLOC_PORT", "7000"),
                ("IPALLOC_LOCK_OWNER", "worker-1"),
                ("IPPOOL_PROD", "10.1.0.0/16"),
                ("IPPOOL_", "10.9.0.0/16"),
                ("UNRELATED", "x"),
            ])
            .unwrap();

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.lock.owner_id.as_deref(), Some("worker-1"));
        assert_eq!(config.pools.len(), 1);
        assert_eq!(config.pools["prod"], "10.1.0.0/16");

        assert!(config.apply_vars([("IPALLOC_PORT", "eighty")]).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipalloc.toml");
        std::fs::write(&path, "[pools]\nstaging = \"172.16.0.0/12\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.pools["staging"], "172.16.0.0/12");

        assert!(matches!(
            Config::load_from(dir.path().join("missing.toml")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_postgres_requires_url() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Postgres;
        assert!(config.validate().is_err());

        config.apply_vars([("DATABASE_URL", "postgres://db/ipalloc")]).unwrap();
        assert!(config.validate().is_ok());
    }
}
