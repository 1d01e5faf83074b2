//! Core entity types for the IPAM service.
//!
//! This module defines the records held by every storage backend:
//! networks, allocations, and audit entries, plus the request and
//! statistics types exchanged with the allocation engine.

use chrono::{DateTime, Utc};
use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum number of audit entries retained; older entries are discarded FIFO.
pub const AUDIT_LOG_LIMIT: usize = 10_000;

/// Unique identifier for a network
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct NetworkId(Uuid);

impl NetworkId {
    /// Generate a new random network ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NetworkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkId({})", self.0)
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NetworkId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unique identifier for an allocation
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct AllocationId(Uuid);

impl AllocationId {
    /// Generate a new random allocation ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AllocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AllocationId({})", self.0)
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AllocationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A declared CIDR block under management
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Unique network ID
    pub id: NetworkId,
    /// Canonical CIDR string (unique across networks)
    pub cidr: String,
    /// Human-readable description
    pub description: String,
    /// User-defined tags
    pub tags: Vec<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Network {
    /// Create a new network record with a fresh id and timestamps
    pub fn new(cidr: impl Into<String>, description: impl Into<String>, tags: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: NetworkId::new(),
            cidr: cidr.into(),
            description: description.into(),
            tags,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Allocation lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    /// Currently leased
    Allocated,
    /// Returned to the pool; record retained for audit
    Released,
    /// Past its expiry time (derived at read time, never stored)
    Expired,
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocated => write!(f, "allocated"),
            Self::Released => write!(f, "released"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// One leased address or contiguous range within a network
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Unique allocation ID
    pub id: AllocationId,
    /// Owning network
    pub network_id: NetworkId,
    /// Start address
    pub ip: IpAddr,
    /// Inclusive end address for ranged allocations
    pub end_ip: Option<IpAddr>,
    /// Stored status (allocated or released)
    pub status: AllocationStatus,
    /// When the lease was granted
    pub allocated_at: DateTime<Utc>,
    /// Lease expiry, if a TTL was requested
    pub expires_at: Option<DateTime<Utc>>,
    /// When the lease was released
    pub released_at: Option<DateTime<Utc>>,
    /// Hostname for the allocation
    pub hostname: String,
    /// Human-readable description
    pub description: String,
    /// User-defined tags
    pub tags: Vec<String>,
}

impl Allocation {
    /// Whether this allocation still holds addresses in the pool
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.released_at.is_none()
    }

    /// Status as observed at `now`: expiry is derived, not stored
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> AllocationStatus {
        if self.released_at.is_some() {
            AllocationStatus::Released
        } else if self.expires_at.is_some_and(|exp| exp < now) {
            AllocationStatus::Expired
        } else {
            AllocationStatus::Allocated
        }
    }
}

/// Request for one or more contiguous addresses
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// Target network by id (takes precedence over `cidr`)
    #[serde(default)]
    pub network_id: Option<NetworkId>,
    /// Target network by CIDR
    #[serde(default)]
    pub cidr: Option<String>,
    /// Number of contiguous addresses required
    #[serde(default = "default_count")]
    pub count: u64,
    /// Hostname for the allocation
    #[serde(default)]
    pub hostname: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// User-defined tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Lease time in seconds; 0 means no expiry
    #[serde(default, alias = "ttl")]
    pub ttl_seconds: u64,
}

fn default_count() -> u64 {
    1
}

impl Default for AllocationRequest {
    fn default() -> Self {
        Self {
            network_id: None,
            cidr: None,
            count: 1,
            hostname: String::new(),
            description: String::new(),
            tags: Vec::new(),
            ttl_seconds: 0,
        }
    }
}

impl AllocationRequest {
    /// Request a single address from the network with the given id
    #[must_use]
    pub fn for_network(network_id: NetworkId) -> Self {
        Self {
            network_id: Some(network_id),
            count: 1,
            ..Self::default()
        }
    }

    /// Request a single address from the network with the given CIDR
    #[must_use]
    pub fn for_cidr(cidr: impl Into<String>) -> Self {
        Self {
            cidr: Some(cidr.into()),
            count: 1,
            ..Self::default()
        }
    }

    /// Set the number of contiguous addresses
    #[must_use]
    pub fn count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    /// Set the lease TTL in seconds
    #[must_use]
    pub fn ttl_seconds(mut self, ttl: u64) -> Self {
        self.ttl_seconds = ttl;
        self
    }
}

/// Actions recorded in the audit log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    NetworkAdded,
    NetworkDeleted,
    IpAllocated,
    IpReleased,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkAdded => write!(f, "network_added"),
            Self::NetworkDeleted => write!(f, "network_deleted"),
            Self::IpAllocated => write!(f, "ip_allocated"),
            Self::IpReleased => write!(f, "ip_released"),
        }
    }
}

/// Append-only audit event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry ID
    pub id: Uuid,
    /// When the action happened
    pub timestamp: DateTime<Utc>,
    /// What happened
    pub action: AuditAction,
    /// Id of the affected network or allocation
    pub resource_id: String,
    /// Free-form detail text
    pub details: String,
    /// Caller identity as reported by the front-end
    pub user: String,
}

/// Per-network utilization report
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Total addresses covered by the CIDR
    pub total_ips: u128,
    /// Addresses held by unreleased allocations
    pub allocated_ips: u128,
    /// Addresses free for allocation
    pub available_ips: u128,
    /// Addresses excluded by host-range policy
    pub reserved_ips: u128,
    /// allocated / (total - reserved), as a percentage
    pub utilization_percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_id_round_trip() {
        let id = NetworkId::new();
        let parsed: NetworkId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_status_derivation() {
        let now = Utc::now();
        let mut alloc = Allocation {
            id: AllocationId::new(),
            network_id: NetworkId::new(),
            ip: "10.0.0.1".parse().unwrap(),
            end_ip: None,
            status: AllocationStatus::Allocated,
            allocated_at: now,
            expires_at: None,
            released_at: None,
            hostname: String::new(),
            description: String::new(),
            tags: Vec::new(),
        };
        assert_eq!(alloc.status_at(now), AllocationStatus::Allocated);

        alloc.expires_at = Some(now - chrono::Duration::seconds(1));
        assert_eq!(alloc.status_at(now), AllocationStatus::Expired);

        alloc.released_at = Some(now);
        assert_eq!(alloc.status_at(now), AllocationStatus::Released);
        assert!(!alloc.is_active());
    }

    #[test]
    fn test_allocation_request_defaults() {
        let req: AllocationRequest = serde_json::from_str(r#"{"cidr":"10.0.0.0/24"}"#).unwrap();
        assert_eq!(req.count, 1);
        assert_eq!(req.ttl_seconds, 0);

        // The REST API historically used "ttl"
        let req: AllocationRequest =
            serde_json::from_str(r#"{"cidr":"10.0.0.0/24","ttl":300}"#).unwrap();
        assert_eq!(req.ttl_seconds, 300);
    }
}
