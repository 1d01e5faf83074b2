//! Storage backends for the IPAM service.
//!
//! Every backend implements the same [`Store`] contract:
//!
//! - **`local`** — an embedded ordered key-value store (redb) for
//!   standalone deployments.
//! - **`state_machine`** + **`raft`** — a deterministic replicated state
//!   machine driven by a totally-ordered command log for clustered
//!   deployments.
//!
//! The semantics are identical modulo latency: record + secondary index
//! updates are atomic, cascades are all-or-nothing, and reads observe
//! either the pre-write or post-write state.

pub mod local;
pub mod raft;
pub mod state_machine;
pub mod wire;

pub use local::LocalStore;
pub use raft::{ClusterInfo, NodeHost, NodeInfo, RaftStore, SingleNodeHost};
pub use state_machine::StateMachine;
pub use wire::{Command, IpLookup, Query, QueryOutput};

use ipam_common::{Allocation, AllocationId, AuditEntry, Network, NetworkId, Result};
use std::net::IpAddr;

/// Uniform operation surface over networks, allocations, and audit.
///
/// Implementations must make each `save_*` and its index update a single
/// atomic write, and `delete_network` an atomic cascade over the network,
/// its allocations, and all their index entries.
pub trait Store: Send + Sync {
    // Networks

    /// Create or replace a network by id, updating the CIDR index.
    fn save_network(&self, network: &Network) -> Result<()>;

    /// Fetch a network by id; `network_not_found` if absent.
    fn get_network(&self, id: &NetworkId) -> Result<Network>;

    /// Fetch a network by canonical CIDR; `network_not_found` if absent.
    fn get_network_by_cidr(&self, cidr: &str) -> Result<Network>;

    /// List all networks.
    fn list_networks(&self) -> Result<Vec<Network>>;

    /// Delete a network and cascade over its allocations and indexes.
    fn delete_network(&self, id: &NetworkId) -> Result<()>;

    // Allocations

    /// Create or replace an allocation by id, updating the IP index.
    fn save_allocation(&self, allocation: &Allocation) -> Result<()>;

    /// Fetch an allocation by id; `ip_not_allocated` if absent.
    fn get_allocation(&self, id: &AllocationId) -> Result<Allocation>;

    /// Fetch an allocation by its start address; `ip_not_allocated` if absent.
    fn get_allocation_by_ip(&self, network_id: &NetworkId, ip: IpAddr) -> Result<Allocation>;

    /// List all allocations under a network.
    fn list_allocations(&self, network_id: &NetworkId) -> Result<Vec<Allocation>>;

    /// Delete an allocation and its IP index entry.
    fn delete_allocation(&self, id: &AllocationId) -> Result<()>;

    // Audit

    /// Append an audit entry. The log is bounded to
    /// [`ipam_common::AUDIT_LOG_LIMIT`] entries, discarded FIFO.
    fn save_audit_entry(&self, entry: &AuditEntry) -> Result<()>;

    /// List the most recent `limit` audit entries, newest first.
    /// A limit of 0 returns everything.
    fn list_audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>>;
}
