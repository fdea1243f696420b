//! Request and response bodies

use serde::{Deserialize, Serialize};

/// Body of `POST /api/allocation/:key`
#[derive(Debug, Clone, Deserialize)]
pub struct AllocateRequest {
    /// One subnet is allocated per entry, in order.
    /// Kept wide so out-of-range values reach validation instead of failing
    /// deserialization.
    #[serde(default)]
    pub prefix_lengths: Vec<i64>,
    /// Pool to allocate from; optional when only one is configured
    #[serde(default)]
    pub environment: Option<String>,
}

/// Successful response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPayload<T> {
    pub data: T,
}

impl<T> DataPayload<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn forbidden() -> Self {
        Self::new("AuthorizationError", "Caller is not allowed to use this route")
    }
}

/// Result of `DELETE /api/allocation/:key`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub released: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
