//! Committed allocation records

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Longest accepted caller key
pub const MAX_KEY_LEN: usize = 512;

/// A subnet handed out to a caller.
///
/// Identity is `(partition_key, network)`: two records with the same key
/// and network cannot coexist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    /// Caller key the subnet is held under
    pub partition_key: String,
    /// Allocated network (canonical form)
    pub network: Ipv4Net,
    /// Environment whose pool the subnet came from
    pub environment: String,
    /// When the allocation was committed
    pub created_at: DateTime<Utc>,
}

impl AllocationRecord {
    /// Create a new record stamped with the current time
    pub fn new(
        partition_key: impl Into<String>,
        network: Ipv4Net,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            partition_key: partition_key.into(),
            network: network.trunc(),
            environment: environment.into(),
            created_at: Utc::now(),
        }
    }
}

/// Check that a caller key can be used as a partition key.
///
/// Rejects empty keys, keys longer than [`MAX_KEY_LEN`], and keys containing
/// `/`, `\`, `#`, `?` or control characters.
pub fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::Validation("Allocation key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::Validation(format!(
            "Allocation key exceeds {} characters",
            MAX_KEY_LEN
        )));
    }
    if let Some(c) = key
        .chars()
        .find(|c| matches!(c, '/' | '\\' | '#' | '?') || c.is_control())
    {
        return Err(Error::Validation(format!(
            "Allocation key contains invalid character {:?}",
            c
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cidr;

    #[test]
    fn test_new_record_is_canonical() {
        let record = AllocationRecord::new("key-1", "10.0.0.7/24".parse().unwrap(), "dev");
        assert_eq!(record.network, cidr::parse("10.0.0.0/24").unwrap());
        assert_eq!(record.partition_key, "key-1");
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("6f1c2a1e-8d8b-4c1f-9f7a-0c2d3e4f5a6b").is_ok());
        assert!(validate_key("team-a.build").is_ok());

        for bad in ["", "  ", "a/b", "a\\b", "a#b", "a?b", "a\nb"] {
            assert!(matches!(validate_key(bad), Err(Error::Validation(_))), "{:?}", bad);
        }
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN + 1)).is_err());
    }
}
