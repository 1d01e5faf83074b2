//! CIDR parsing and address arithmetic.
//!
//! Addresses are handled as `u128` values in their family's address space,
//! which makes offset math uniform across IPv4 and IPv6. The host range
//! excludes addresses reserved by convention:
//!
//! | Prefix class        | First allocatable | Last allocatable |
//! |---------------------|-------------------|------------------|
//! | IPv4 prefix ≤ /30   | network + 1       | broadcast − 1    |
//! | IPv4 /31 (RFC 3021) | network           | network + 1      |
//! | IPv4 /32            | network           | network          |
//! | IPv6 prefix < /127  | network + 1       | last address     |
//! | IPv6 /127, /128     | network           | last address     |

use ipam_common::{Error, Result};
use ipnet::IpNet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Cap on free-pool size: networks larger than this allocate from a
/// window over their first 2^24 host slots to bound bitmap memory.
pub const MAX_POOL_SLOTS: u64 = 1 << 24;

/// A parsed, canonical CIDR block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cidr {
    net: IpNet,
}

impl Cidr {
    /// Parse a CIDR string. Fails on malformed input and on host bits set
    /// beyond the prefix (the canonical form is required).
    pub fn parse(s: &str) -> Result<Self> {
        let net: IpNet = s
            .trim()
            .parse()
            .map_err(|e| Error::InvalidCidr(format!("{s}: {e}")))?;
        if net.addr() != net.network() {
            return Err(Error::InvalidCidr(format!("{s}: host bits set")));
        }
        Ok(Self { net })
    }

    /// Whether this is an IPv4 block
    #[must_use]
    pub fn is_ipv4(&self) -> bool {
        matches!(self.net, IpNet::V4(_))
    }

    /// Prefix length in bits
    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    /// The network (first) address of the block
    #[must_use]
    pub fn network_addr(&self) -> IpAddr {
        self.net.network()
    }

    fn bits(&self) -> u8 {
        if self.is_ipv4() {
            32
        } else {
            128
        }
    }

    fn host_mask(&self) -> u128 {
        let host_bits = u32::from(self.bits() - self.prefix_len());
        if host_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        }
    }

    fn network_value(&self) -> u128 {
        addr_value(self.network_addr())
    }

    /// Total addresses covered by the block: `2^(bits − prefix)`,
    /// saturating at `u128::MAX` for an IPv6 /0.
    #[must_use]
    pub fn total_addresses(&self) -> u128 {
        self.host_mask().saturating_add(1)
    }

    fn host_bounds(&self) -> (u128, u128) {
        let network = self.network_value();
        let last = network | self.host_mask();
        if self.is_ipv4() {
            match self.prefix_len() {
                32 => (network, network),
                31 => (network, network + 1),
                // Network and broadcast addresses are reserved
                _ => (network + 1, last - 1),
            }
        } else {
            match self.prefix_len() {
                127 | 128 => (network, last),
                // Subnet-router anycast address is reserved
                _ => (network + 1, last),
            }
        }
    }

    /// First allocatable address
    #[must_use]
    pub fn first_host(&self) -> IpAddr {
        self.value_to_addr(self.host_bounds().0)
    }

    /// Last allocatable address
    #[must_use]
    pub fn last_host(&self) -> IpAddr {
        self.value_to_addr(self.host_bounds().1)
    }

    /// Number of allocatable addresses
    #[must_use]
    pub fn capacity(&self) -> u128 {
        let (first, last) = self.host_bounds();
        last - first + 1
    }

    /// Free-pool size: capacity clamped to [`MAX_POOL_SLOTS`]
    #[must_use]
    pub fn pool_size(&self) -> u64 {
        self.capacity().min(u128::from(MAX_POOL_SLOTS)) as u64
    }

    /// Position of `addr` within the host range
    pub fn offset(&self, addr: IpAddr) -> Result<u64> {
        if addr.is_ipv4() != self.is_ipv4() {
            return Err(Error::OutOfRange(format!(
                "{addr} is not in the address family of {self}"
            )));
        }
        let value = addr_value(addr);
        let (first, last) = self.host_bounds();
        if value < first || value > last {
            return Err(Error::OutOfRange(format!(
                "{addr} is outside the host range of {self}"
            )));
        }
        let offset = value - first;
        u64::try_from(offset)
            .map_err(|_| Error::OutOfRange(format!("{addr} is beyond the pool window of {self}")))
    }

    /// Address at `offset` within the host range (inverse of [`offset`](Self::offset))
    pub fn addr_at(&self, offset: u64) -> Result<IpAddr> {
        let (first, last) = self.host_bounds();
        let value = first + u128::from(offset);
        if value > last {
            return Err(Error::OutOfRange(format!(
                "offset {offset} is outside the host range of {self}"
            )));
        }
        Ok(self.value_to_addr(value))
    }

    /// Whether the block covers `addr`
    #[must_use]
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.net.contains(&addr)
    }

    /// Number of addresses in the inclusive range `[start, end]`
    pub fn span(&self, start: IpAddr, end: IpAddr) -> Result<u128> {
        let start_value = addr_value(start);
        let end_value = addr_value(end);
        if start.is_ipv4() != end.is_ipv4() || end_value < start_value {
            return Err(Error::OutOfRange(format!("invalid range {start}-{end}")));
        }
        Ok(end_value - start_value + 1)
    }

    fn value_to_addr(&self, value: u128) -> IpAddr {
        if self.is_ipv4() {
            IpAddr::V4(Ipv4Addr::from(value as u32))
        } else {
            IpAddr::V6(Ipv6Addr::from(value))
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net)
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn addr_value(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}
