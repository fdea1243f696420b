//! First-fit subnet search
//!
//! Finds the first block of a requested size inside a pool that overlaps
//! neither an excluded network nor anything already allocated.
//! Blocked space is kept as disjoint address ranges in a BTreeMap, so each
//! overlap test is an O(log n) lookup and the search jumps over a blocked
//! range in one step.

use crate::cidr::{self, MAX_PREFIX_LEN};
use crate::models::Pool;
use crate::{Error, Result};
use ipnet::Ipv4Net;
use std::collections::BTreeMap;

/// Disjoint, sorted address ranges that candidates must not touch
#[derive(Debug, Clone, Default)]
struct BlockedRanges {
    /// Range start -> inclusive range end
    ranges: BTreeMap<u32, u32>,
}

impl BlockedRanges {
    fn insert(&mut self, net: &Ipv4Net) {
        let (mut start, mut end) = cidr::bounds(net);

        if let Some((&prev_start, &prev_end)) = self.ranges.range(..=start).next_back() {
            if prev_end >= start {
                start = prev_start;
                end = end.max(prev_end);
            }
        }

        let absorbed: Vec<u32> = self.ranges.range(start..=end).map(|(&s, _)| s).collect();
        for s in absorbed {
            if let Some(e) = self.ranges.remove(&s) {
                end = end.max(e);
            }
        }

        self.ranges.insert(start, end);
    }

    /// Blocked range overlapping `net`, if any
    fn overlapping(&self, net: &Ipv4Net) -> Option<(u32, u32)> {
        let (start, end) = cidr::bounds(net);
        self.ranges
            .range(..=end)
            .next_back()
            .filter(|(_, &blocked_end)| blocked_end >= start)
            .map(|(&s, &e)| (s, e))
    }
}

/// First-fit allocator over one pool.
///
/// Seeded with the networks already committed anywhere in the store; every
/// successful [`allocate`](Self::allocate) blocks its result for later calls,
/// so one request never hands out overlapping blocks to itself.
#[derive(Debug, Clone)]
pub struct FirstFitAllocator {
    pool: Pool,
    blocked: BlockedRanges,
    /// Networks handed out by this allocator, in order
    allocated: Vec<Ipv4Net>,
}

impl FirstFitAllocator {
    /// Create an allocator for `pool` that avoids every `committed` network
    pub fn new<I>(pool: Pool, committed: I) -> Self
    where
        I: IntoIterator<Item = Ipv4Net>,
    {
        let mut blocked = BlockedRanges::default();
        for net in pool.excluded.iter().copied().chain(committed) {
            blocked.insert(&net);
        }

        Self {
            pool,
            blocked,
            allocated: Vec::new(),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Networks allocated so far, in request order
    pub fn allocated(&self) -> &[Ipv4Net] {
        &self.allocated
    }

    /// Whether `net` overlaps excluded or allocated space
    pub fn is_blocked(&self, net: &Ipv4Net) -> bool {
        self.blocked.overlapping(net).is_some()
    }

    /// Find the first free block of `prefix_len` without claiming it.
    ///
    /// Included networks are tried in pool order, then ascending address
    /// order. An included network shorter than the requested block yields no
    /// candidates. This deliberately differs from [`cidr::subnets`], which
    /// rejects such a split with `InvalidArgument`: skipping lets one pool mix
    /// block sizes, and a request no included network can hold ends as
    /// `PoolExhausted` rather than a bad-request error.
    pub fn find(&self, prefix_len: u8) -> Result<Option<Ipv4Net>> {
        if prefix_len > MAX_PREFIX_LEN {
            return Err(Error::InvalidArgument(format!(
                "Prefix length {} is greater than {}",
                prefix_len, MAX_PREFIX_LEN
            )));
        }

        for included in &self.pool.included {
            if prefix_len < included.prefix_len() {
                continue;
            }

            let mut candidates = cidr::subnets(*included, prefix_len)?;
            while let Some(candidate) = candidates.next() {
                match self.blocked.overlapping(&candidate) {
                    None => return Ok(Some(candidate)),
                    Some((_, blocked_end)) => candidates.skip_past(blocked_end),
                }
            }
        }

        Ok(None)
    }

    /// Claim the first free block of `prefix_len`
    pub fn allocate(&mut self, prefix_len: u8) -> Result<Ipv4Net> {
        let net = self
            .find(prefix_len)?
            .ok_or(Error::PoolExhausted { prefix_len })?;

        self.blocked.insert(&net);
        self.allocated.push(net);
        Ok(net)
    }
}
