//! Address pool definitions

use crate::cidr;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Networks an environment may allocate from.
///
/// Included networks are searched in order (first-fit priority); any
/// candidate overlapping an excluded network is skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    /// Environment this pool belongs to
    pub environment: String,
    /// Networks to allocate from, in priority order
    pub included: Vec<Ipv4Net>,
    /// Networks that must never be handed out
    pub excluded: Vec<Ipv4Net>,
}

impl Pool {
    /// Create a pool from explicit network lists
    pub fn new(
        environment: impl Into<String>,
        included: Vec<Ipv4Net>,
        excluded: Vec<Ipv4Net>,
    ) -> Self {
        Self {
            environment: environment.into(),
            included: included.into_iter().map(|n| n.trunc()).collect(),
            excluded: excluded.into_iter().map(|n| n.trunc()).collect(),
        }
    }

    /// Parse a pool spec such as `10.0.0.0/24, 192.168.0.0/16, !10.0.0.128/25`.
    ///
    /// Entries prefixed with `!` are excluded networks. Malformed entries
    /// are skipped with a warning.
    pub fn parse(environment: impl Into<String>, spec: &str) -> Self {
        let environment = environment.into();
        let mut included = Vec::new();
        let mut excluded = Vec::new();

        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (target, text) = match entry.strip_prefix('!') {
                Some(rest) => (&mut excluded, rest.trim()),
                None => (&mut included, entry),
            };

            match cidr::parse(text) {
                Ok(net) => target.push(net),
                Err(e) => {
                    tracing::warn!(
                        environment = %environment,
                        entry = %entry,
                        error = %e,
                        "Ignoring malformed pool entry"
                    );
                }
            }
        }

        Self {
            environment,
            included,
            excluded,
        }
    }

    /// Whether the pool has nothing to allocate from
    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }

    /// Whether a network is covered by an excluded range
    pub fn is_excluded(&self, net: &Ipv4Net) -> bool {
        self.excluded.iter().any(|ex| cidr::overlaps(ex, net))
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .included
            .iter()
            .map(|n| n.to_string())
            .chain(self.excluded.iter().map(|n| format!("!{}", n)))
            .collect();
        write!(f, "{}: {}", self.environment, entries.join(", "))
    }
}
