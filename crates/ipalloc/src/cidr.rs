//! CIDR math over IPv4 networks
//!
//! Pure functions used by the allocator:
//! - canonical parsing and formatting of `address/prefix` strings
//! - overlap testing between two networks
//! - lazy, restartable enumeration of the subnetworks of a parent network

use crate::{Error, Result};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Longest valid IPv4 prefix
pub const MAX_PREFIX_LEN: u8 = 32;

/// Parse an `address/prefix` string into a canonical network.
///
/// Host bits beyond the prefix are cleared, so `10.0.0.5/24` parses as
/// `10.0.0.0/24`. A string without a prefix length is rejected.
pub fn parse(s: &str) -> Result<Ipv4Net> {
    let net = Ipv4Net::from_str(s.trim())
        .map_err(|e| Error::Parse(format!("'{}': {}", s, e)))?;
    Ok(net.trunc())
}

/// Canonical `address/prefix` form of a network
pub fn format(net: &Ipv4Net) -> String {
    net.trunc().to_string()
}

/// Check whether two networks share at least one address
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    let (a_start, a_end) = bounds(a);
    let (b_start, b_end) = bounds(b);
    a_start <= b_end && b_start <= a_end
}

/// First and last address of a network as integers
pub fn bounds(net: &Ipv4Net) -> (u32, u32) {
    (u32::from(net.network()), u32::from(net.broadcast()))
}

/// Enumerate every subnetwork of `parent` with the given prefix length.
///
/// Fails when the prefix length is shorter than the parent's or longer
/// than 32.
pub fn subnets(parent: Ipv4Net, prefix_len: u8) -> Result<Subnets> {
    Subnets::new(parent, prefix_len)
}

/// Lazy, ascending sequence of the subnetworks of a parent network.
///
/// Holds the next base address as explicit state. Calling
/// [`Subnets::skip_past`] moves the cursor to the first block that starts
/// after a given address, which lets a search jump over a blocking range
/// without visiting every block inside it.
#[derive(Debug, Clone)]
pub struct Subnets {
    parent: Ipv4Net,
    prefix_len: u8,
    /// Next base address to yield; `None` once exhausted
    next: Option<u64>,
    /// Base address of the last block inside the parent
    last: u64,
}

impl Subnets {
    fn new(parent: Ipv4Net, prefix_len: u8) -> Result<Self> {
        let parent = parent.trunc();
        if prefix_len > MAX_PREFIX_LEN {
            return Err(Error::InvalidArgument(format!(
                "Prefix length {} is greater than {}",
                prefix_len, MAX_PREFIX_LEN
            )));
        }
        if prefix_len < parent.prefix_len() {
            return Err(Error::InvalidArgument(format!(
                "Prefix length {} is shorter than parent network {}",
                prefix_len, parent
            )));
        }

        let (start, end) = bounds(&parent);
        let last = end as u64 + 1 - block_size(prefix_len);

        Ok(Self {
            parent,
            prefix_len,
            next: Some(start as u64),
            last,
        })
    }

    /// Parent network being enumerated
    pub fn parent(&self) -> Ipv4Net {
        self.parent
    }

    /// Prefix length of the yielded networks
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Total number of blocks in the full sequence
    pub fn total(&self) -> u64 {
        1u64 << (self.prefix_len - self.parent.prefix_len())
    }

    /// Advance the cursor to the first block starting after `addr`.
    ///
    /// Never moves backwards.
    pub fn skip_past(&mut self, addr: u32) {
        let Some(next) = self.next else {
            return;
        };
        let addr = addr as u64;
        if addr < next {
            return;
        }
        let size = block_size(self.prefix_len);
        let aligned = (addr + 1).div_ceil(size) * size;
        self.next = (aligned <= self.last).then_some(aligned);
    }
}

impl Iterator for Subnets {
    type Item = Ipv4Net;

    fn next(&mut self) -> Option<Ipv4Net> {
        let base = self.next?;
        self.next = if base >= self.last {
            None
        } else {
            Some(base + block_size(self.prefix_len))
        };
        Ipv4Net::new(Ipv4Addr::from(base as u32), self.prefix_len).ok()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.next {
            None => (0, Some(0)),
            Some(next) => {
                let remaining = (self.last - next) / block_size(self.prefix_len) + 1;
                let remaining = usize::try_from(remaining).unwrap_or(usize::MAX);
                (remaining, Some(remaining))
            }
        }
    }
}

/// Number of addresses in a block of the given prefix length
fn block_size(prefix_len: u8) -> u64 {
    1u64 << (32 - prefix_len as u32)
}

/// Row key encoding of a network (`10.0.0.0/24` -> `10.0.0.0-24`).
///
/// Entity stores commonly reserve `/` in keys.
pub fn to_row_key(net: &Ipv4Net) -> String {
    format(net).replace('/', "-")
}

/// Inverse of [`to_row_key`]
pub fn from_row_key(key: &str) -> Result<Ipv4Net> {
    parse(&key.replacen('-', "/", 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        parse(s).unwrap()
    }

    #[test]
    fn test_subnets_of_slash_24() {
        let subnets: Vec<String> = subnets(net("10.0.0.0/24"), 26)
            .unwrap()
            .map(|n| n.to_string())
            .collect();

        assert_eq!(
            subnets,
            vec![
                "10.0.0.0/26",
                "10.0.0.64/26",
                "10.0.0.128/26",
                "10.0.0.192/26"
            ]
        );
    }

    #[test]
    fn test_subnets_same_prefix_yields_parent() {
        let all: Vec<Ipv4Net> = subnets(net("192.168.1.0/24"), 24).unwrap().collect();
        assert_eq!(all, vec![net("192.168.1.0/24")]);
    }

    #[test]
    fn test_subnets_reaches_end_of_address_space() {
        let all: Vec<Ipv4Net> = subnets(net("255.255.255.0/24"), 25).unwrap().collect();
        assert_eq!(all, vec![net("255.255.255.0/25"), net("255.255.255.128/25")]);
    }

    #[test]
    fn test_subnets_of_whole_space() {
        let mut iter = subnets(net("0.0.0.0/0"), 1).unwrap();
        assert_eq!(iter.total(), 2);
        assert_eq!(iter.next(), Some(net("0.0.0.0/1")));
        assert_eq!(iter.next(), Some(net("128.0.0.0/1")));
        assert_eq!(iter.next(), None);

        let whole: Vec<Ipv4Net> = subnets(net("0.0.0.0/0"), 0).unwrap().collect();
        assert_eq!(whole, vec![net("0.0.0.0/0")]);
    }

    #[test]
    fn test_subnets_count_and_restartable() {
        let iter = subnets(net("10.0.0.0/16"), 24).unwrap();
        assert_eq!(iter.total(), 256);
        assert_eq!(iter.size_hint(), (256, Some(256)));

        let first: Vec<Ipv4Net> = iter.clone().take(3).collect();
        let again: Vec<Ipv4Net> = subnets(net("10.0.0.0/16"), 24).unwrap().take(3).collect();
        assert_eq!(first, again);
        assert_eq!(iter.count(), 256);
    }

    #[test]
    fn test_subnets_invalid_prefix() {
        assert!(matches!(
            subnets(net("10.0.0.0/24"), 23),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            subnets(net("10.0.0.0/24"), 33),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_skip_past() {
        let mut iter = subnets(net("10.0.0.0/24"), 26).unwrap();
        assert_eq!(iter.next(), Some(net("10.0.0.0/26")));

        // Jump over 10.0.0.64/25
        let (_, end) = bounds(&net("10.0.0.64/25"));
        iter.skip_past(end);
        assert_eq!(iter.next(), Some(net("10.0.0.192/26")));
        assert_eq!(iter.next(), None);

        // Skipping past the end exhausts the sequence
        let mut iter = subnets(net("10.0.0.0/24"), 26).unwrap();
        iter.skip_past(u32::from(Ipv4Addr::new(10, 0, 0, 255)));
        assert_eq!(iter.next(), None);

        // Never moves backwards
        let mut iter = subnets(net("10.0.0.0/24"), 26).unwrap();
        iter.nth(1);
        iter.skip_past(0);
        assert_eq!(iter.next(), Some(net("10.0.0.128/26")));
    }

    #[test]
    fn test_overlap() {
        let a = net("10.0.0.0/24");
        assert!(overlaps(&a, &net("10.0.0.128/25")));
        assert!(overlaps(&a, &net("10.0.0.0/16")));
        assert!(overlaps(&a, &a));
        assert!(!overlaps(&a, &net("10.0.1.0/24")));
        assert!(overlaps(&net("0.0.0.0/0"), &net("192.168.0.1/32")));
    }

    #[test]
    fn test_overlap_symmetry() {
        let nets = [
            "10.0.0.0/8",
            "10.0.0.0/24",
            "10.0.0.128/25",
            "10.0.1.0/24",
            "192.168.0.0/16",
            "0.0.0.0/0",
            "10.0.0.255/32",
        ];
        for a in nets {
            for b in nets {
                assert_eq!(
                    overlaps(&net(a), &net(b)),
                    overlaps(&net(b), &net(a)),
                    "{} vs {}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_parse_canonicalises() {
        assert_eq!(format(&net("10.0.0.5/24")), "10.0.0.0/24");
        assert_eq!(format(&net(" 172.16.4.0/22 ")), "172.16.4.0/22");
    }

    #[test]
    fn test_round_trip() {
        for s in ["10.0.0.0/24", "0.0.0.0/0", "192.168.255.255/32", "172.16.0.0/12"] {
            assert_eq!(format(&parse(s).unwrap()), s);
        }
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["10.0.0.0", "10.0.0.0/33", "10.0.0/24", "not-a-network", ""] {
            assert!(matches!(parse(bad), Err(Error::Parse(_))), "{}", bad);
        }
    }

    #[test]
    fn test_row_key() {
        let n = net("10.0.200.0/24");
        assert_eq!(to_row_key(&n), "10.0.200.0-24");
        assert_eq!(from_row_key("10.0.200.0-24").unwrap(), n);
    }
}
