//! Error types for subnet allocation

use thiserror::Error;

/// Result type for allocation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a storage or lease backend.
///
/// Modelled on the status classes a remote entity store answers with, so
/// that adapters can map their transport errors onto it without losing
/// the distinction the lock protocol depends on (404 vs 409 vs 5xx).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend error: {0}")]
    Other(String),
}

impl BackendError {
    /// HTTP-style status code of this failure
    pub fn status(&self) -> u16 {
        match self {
            BackendError::NotFound(_) => 404,
            BackendError::Conflict(_) => 409,
            BackendError::PreconditionFailed(_) => 412,
            BackendError::InvalidRequest(_) => 400,
            BackendError::Unavailable(_) => 503,
            BackendError::Other(_) => 500,
        }
    }

    /// Whether the failure is a transient server-side one (5xx class)
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// Allocation errors
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Caller input
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid CIDR: {0}")]
    Parse(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Allocation
    #[error("Could not allocate subnet with prefix length /{prefix_len}")]
    PoolExhausted { prefix_len: u8 },

    #[error("Allocation already exists: {0}")]
    Conflict(String),

    // Locking
    #[error("Failed to acquire lock '{lock_id}' within {timeout_secs:.1} sec")]
    LockTimeout { lock_id: String, timeout_secs: f64 },

    #[error("Lease '{lease_id}' on lock '{lock_id}' was lost: {reason}")]
    LeaseLost {
        lock_id: String,
        lease_id: String,
        reason: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    // Storage
    #[error("Store error: {0}")]
    Store(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    // General
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short type name reported to HTTP callers
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) | Error::InvalidArgument(_) => "ValidationError",
            Error::Parse(_) => "ParseError",
            Error::PoolExhausted { .. } => "PoolExhaustedError",
            Error::Conflict(_) => "ConflictError",
            Error::LockTimeout { .. } => "LockTimeoutError",
            Error::LeaseLost { .. } => "LeaseLostError",
            Error::Cancelled => "CancelledError",
            Error::Store(_) | Error::Backend(_) => "StoreError",
            Error::Config(_) => "ConfigError",
            Error::Internal(_) => "InternalError",
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::LockTimeout { .. } => true,
            Error::Backend(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<ipnet::PrefixLenError> for Error {
    fn from(e: ipnet::PrefixLenError) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<ipnet::AddrParseError> for Error {
    fn from(e: ipnet::AddrParseError) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Store(format!("malformed entity: {}", e))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for BackendError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => BackendError::NotFound(e.to_string()),
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                BackendError::Conflict(db_err.to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                BackendError::Unavailable(e.to_string())
            }
            _ => BackendError::Other(e.to_string()),
        }
    }
}
