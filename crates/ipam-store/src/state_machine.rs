//! Deterministic replicated state machine.
//!
//! The state machine is an in-memory arena of networks, allocations, and a
//! bounded audit list, plus id-only secondary indexes. It never consults
//! the wall clock or any random source during apply: timestamps and ids
//! are minted by the allocation engine before submission, so every replica
//! performs identical state transitions.
//!
//! Snapshots serialize only the entity collections; indexes are rebuilt on
//! recovery.

use crate::wire::{Command, IpLookup, Query, QueryOutput};
use ipam_common::{
    Allocation, AllocationId, AuditEntry, Error, Network, NetworkId, Result, AUDIT_LOG_LIMIT,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Default)]
struct RsmState {
    networks: HashMap<NetworkId, Network>,
    allocations: HashMap<AllocationId, Allocation>,
    audit: Vec<AuditEntry>,

    // Secondary indexes hold ids only, never records
    network_by_cidr: HashMap<String, NetworkId>,
    allocation_by_ip: HashMap<(NetworkId, IpAddr), AllocationId>,
    allocations_by_network: HashMap<NetworkId, Vec<AllocationId>>,
}

impl RsmState {
    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::SaveNetwork(network) => {
                self.network_by_cidr.insert(network.cidr.clone(), network.id);
                self.networks.insert(network.id, network);
            }
            Command::DeleteNetwork(id) => {
                let Some(network) = self.networks.remove(&id) else {
                    return;
                };
                self.network_by_cidr.remove(&network.cidr);
                if let Some(allocation_ids) = self.allocations_by_network.remove(&id) {
                    for allocation_id in allocation_ids {
                        if let Some(allocation) = self.allocations.remove(&allocation_id) {
                            self.allocation_by_ip
                                .remove(&(allocation.network_id, allocation.ip));
                        }
                    }
                }
            }
            Command::SaveAllocation(allocation) => {
                self.allocation_by_ip
                    .insert((allocation.network_id, allocation.ip), allocation.id);
                let ids = self
                    .allocations_by_network
                    .entry(allocation.network_id)
                    .or_default();
                if !ids.contains(&allocation.id) {
                    ids.push(allocation.id);
                }
                self.allocations.insert(allocation.id, allocation);
            }
            Command::DeleteAllocation(id) => {
                let Some(allocation) = self.allocations.remove(&id) else {
                    return;
                };
                self.allocation_by_ip
                    .remove(&(allocation.network_id, allocation.ip));
                if let Some(ids) = self.allocations_by_network.get_mut(&allocation.network_id) {
                    ids.retain(|existing| *existing != id);
                }
            }
            Command::SaveAudit(entry) => {
                self.audit.push(entry);
                if self.audit.len() > AUDIT_LOG_LIMIT {
                    let excess = self.audit.len() - AUDIT_LOG_LIMIT;
                    self.audit.drain(..excess);
                }
            }
        }
    }

    fn lookup(&self, query: Query) -> QueryOutput {
        match query {
            Query::GetNetwork(id) => QueryOutput::Network(self.networks.get(&id).cloned()),
            Query::GetNetworkByCidr(cidr) => QueryOutput::Network(
                self.network_by_cidr
                    .get(&cidr)
                    .and_then(|id| self.networks.get(id))
                    .cloned(),
            ),
            Query::ListNetworks => {
                let mut networks: Vec<Network> = self.networks.values().cloned().collect();
                networks.sort_by(|a, b| a.cidr.cmp(&b.cidr));
                QueryOutput::Networks(networks)
            }
            Query::GetAllocation(id) => {
                QueryOutput::Allocation(self.allocations.get(&id).cloned())
            }
            Query::GetAllocationByIp(IpLookup { network_id, ip }) => QueryOutput::Allocation(
                self.allocation_by_ip
                    .get(&(network_id, ip))
                    .and_then(|id| self.allocations.get(id))
                    .cloned(),
            ),
            Query::ListAllocations(network_id) => QueryOutput::Allocations(
                self.allocations_by_network
                    .get(&network_id)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|id| self.allocations.get(id))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default(),
            ),
            Query::ListAudit { limit } => {
                let start = if limit == 0 {
                    0
                } else {
                    self.audit.len().saturating_sub(limit)
                };
                QueryOutput::Audit(self.audit[start..].iter().rev().cloned().collect())
            }
        }
    }

    fn rebuild_indexes(&mut self) {
        self.network_by_cidr.clear();
        self.allocation_by_ip.clear();
        self.allocations_by_network.clear();

        for (id, network) in &self.networks {
            self.network_by_cidr.insert(network.cidr.clone(), *id);
        }

        let mut by_network: HashMap<NetworkId, Vec<&Allocation>> = HashMap::new();
        for allocation in self.allocations.values() {
            self.allocation_by_ip
                .insert((allocation.network_id, allocation.ip), allocation.id);
            by_network
                .entry(allocation.network_id)
                .or_default()
                .push(allocation);
        }
        // Per-network id lists are kept in allocation order so list output
        // is identical on every replica after recovery
        for (network_id, mut allocations) in by_network {
            allocations.sort_by_key(|a| (a.allocated_at, a.id));
            self.allocations_by_network
                .insert(network_id, allocations.iter().map(|a| a.id).collect());
        }
    }
}

/// Serialized snapshot artifact: entity collections only
#[derive(Serialize, Deserialize)]
struct Snapshot {
    networks: Vec<Network>,
    allocations: Vec<Allocation>,
    audit: Vec<AuditEntry>,
}

/// The IPAM replicated state machine
pub struct StateMachine {
    cluster_id: u64,
    node_id: u64,
    state: RwLock<RsmState>,
    applied: AtomicU64,
}

impl StateMachine {
    /// Create an empty state machine for the given replica
    #[must_use]
    pub fn new(cluster_id: u64, node_id: u64) -> Self {
        Self {
            cluster_id,
            node_id,
            state: RwLock::new(RsmState::default()),
            applied: AtomicU64::new(0),
        }
    }

    /// Cluster this replica belongs to
    #[must_use]
    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    /// Replica id
    #[must_use]
    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Number of commands applied since start or last recovery
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Apply one framed command from the committed log
    pub fn apply(&self, data: &[u8]) -> Result<()> {
        self.apply_command(Command::decode(data)?);
        Ok(())
    }

    /// Apply one decoded command
    pub fn apply_command(&self, cmd: Command) {
        self.state.write().apply(cmd);
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Answer one framed read-only query
    pub fn lookup(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.execute_query(Query::decode(data)?).encode()
    }

    /// Answer one decoded query
    pub fn execute_query(&self, query: Query) -> QueryOutput {
        self.state.read().lookup(query)
    }

    /// Serialize the entity collections to `w`
    pub fn save_snapshot<W: Write>(&self, w: &mut W) -> Result<()> {
        let state = self.state.read();
        let mut networks: Vec<Network> = state.networks.values().cloned().collect();
        networks.sort_by_key(|n| n.id);
        let mut allocations: Vec<Allocation> = state.allocations.values().cloned().collect();
        allocations.sort_by_key(|a| a.id);
        let snapshot = Snapshot {
            networks,
            allocations,
            audit: state.audit.clone(),
        };
        serde_json::to_writer(w, &snapshot).map_err(Error::from)
    }

    /// Replace all state from a snapshot and rebuild the indexes
    pub fn recover_from_snapshot<R: Read>(&self, r: R) -> Result<()> {
        let snapshot: Snapshot = serde_json::from_reader(r).map_err(Error::from)?;
        let mut state = self.state.write();
        state.networks = snapshot
            .networks
            .into_iter()
            .map(|n| (n.id, n))
            .collect();
        state.allocations = snapshot
            .allocations
            .into_iter()
            .map(|a| (a.id, a))
            .collect();
        state.audit = snapshot.audit;
        state.rebuild_indexes();
        debug!(
            networks = state.networks.len(),
            allocations = state.allocations.len(),
            audit = state.audit.len(),
            "recovered state machine from snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ipam_common::{AllocationStatus, AuditAction};
    use uuid::Uuid;

    fn sample_allocation(network_id: NetworkId, ip: &str) -> Allocation {
        Allocation {
            id: AllocationId::new(),
            network_id,
            ip: ip.parse().unwrap(),
            end_ip: None,
            status: AllocationStatus::Allocated,
            allocated_at: Utc::now(),
            expires_at: None,
            released_at: None,
            hostname: String::new(),
            description: String::new(),
            tags: Vec::new(),
        }
    }

    fn sample_audit(details: &str) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action: AuditAction::IpAllocated,
            resource_id: "r".into(),
            details: details.into(),
            user: "test".into(),
        }
    }

    #[test]
    fn test_save_and_query_network() {
        let sm = StateMachine::new(1, 1);
        let network = Network::new("10.0.0.0/24", "", vec![]);
        sm.apply_command(Command::SaveNetwork(network.clone()));

        assert_eq!(
            sm.execute_query(Query::GetNetwork(network.id)),
            QueryOutput::Network(Some(network.clone()))
        );
        assert_eq!(
            sm.execute_query(Query::GetNetworkByCidr("10.0.0.0/24".into())),
            QueryOutput::Network(Some(network))
        );
        assert_eq!(
            sm.execute_query(Query::GetNetworkByCidr("10.1.0.0/24".into())),
            QueryOutput::Network(None)
        );
        assert_eq!(sm.applied(), 1);
    }

    #[test]
    fn test_delete_network_cascades() {
        let sm = StateMachine::new(1, 1);
        let network = Network::new("10.0.0.0/24", "", vec![]);
        sm.apply_command(Command::SaveNetwork(network.clone()));

        let allocation = sample_allocation(network.id, "10.0.0.1");
        sm.apply_command(Command::SaveAllocation(allocation.clone()));

        sm.apply_command(Command::DeleteNetwork(network.id));

        assert_eq!(
            sm.execute_query(Query::GetNetwork(network.id)),
            QueryOutput::Network(None)
        );
        assert_eq!(
            sm.execute_query(Query::ListAllocations(network.id)),
            QueryOutput::Allocations(vec![])
        );
        assert_eq!(
            sm.execute_query(Query::GetAllocationByIp(IpLookup {
                network_id: network.id,
                ip: "10.0.0.1".parse().unwrap(),
            })),
            QueryOutput::Allocation(None)
        );
    }

    #[test]
    fn test_resave_allocation_does_not_duplicate_listing() {
        let sm = StateMachine::new(1, 1);
        let network = Network::new("10.0.0.0/24", "", vec![]);
        sm.apply_command(Command::SaveNetwork(network.clone()));

        let mut allocation = sample_allocation(network.id, "10.0.0.1");
        sm.apply_command(Command::SaveAllocation(allocation.clone()));

        // Release writes the same record back with released_at set
        allocation.released_at = Some(Utc::now());
        allocation.status = AllocationStatus::Released;
        sm.apply_command(Command::SaveAllocation(allocation.clone()));

        assert_eq!(
            sm.execute_query(Query::ListAllocations(network.id)),
            QueryOutput::Allocations(vec![allocation])
        );
    }

    #[test]
    fn test_audit_bounded_and_newest_first() {
        let sm = StateMachine::new(1, 1);
        for i in 0..(AUDIT_LOG_LIMIT + 5) {
            sm.apply_command(Command::SaveAudit(sample_audit(&format!("entry {i}"))));
        }

        let QueryOutput::Audit(all) = sm.execute_query(Query::ListAudit { limit: 0 }) else {
            panic!("wrong output variant");
        };
        assert_eq!(all.len(), AUDIT_LOG_LIMIT);
        assert_eq!(all[0].details, format!("entry {}", AUDIT_LOG_LIMIT + 4));

        let QueryOutput::Audit(top) = sm.execute_query(Query::ListAudit { limit: 3 }) else {
            panic!("wrong output variant");
        };
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].details, format!("entry {}", AUDIT_LOG_LIMIT + 4));
        assert_eq!(top[2].details, format!("entry {}", AUDIT_LOG_LIMIT + 2));
    }

    #[test]
    fn test_snapshot_round_trip_rebuilds_indexes() {
        let sm = StateMachine::new(1, 1);
        let network = Network::new("10.0.0.0/24", "snapshotted", vec!["a".into()]);
        sm.apply_command(Command::SaveNetwork(network.clone()));
        let a1 = sample_allocation(network.id, "10.0.0.1");
        let a2 = sample_allocation(network.id, "10.0.0.2");
        sm.apply_command(Command::SaveAllocation(a1.clone()));
        sm.apply_command(Command::SaveAllocation(a2.clone()));
        sm.apply_command(Command::SaveAudit(sample_audit("one")));

        let mut buf = Vec::new();
        sm.save_snapshot(&mut buf).unwrap();

        let recovered = StateMachine::new(1, 2);
        recovered.recover_from_snapshot(buf.as_slice()).unwrap();

        // Entities and every derived index answer identically
        for query in [
            Query::GetNetwork(network.id),
            Query::GetNetworkByCidr(network.cidr.clone()),
            Query::ListNetworks,
            Query::GetAllocation(a1.id),
            Query::GetAllocationByIp(IpLookup {
                network_id: network.id,
                ip: a2.ip,
            }),
            Query::ListAllocations(network.id),
            Query::ListAudit { limit: 0 },
        ] {
            assert_eq!(
                sm.execute_query(query.clone()),
                recovered.execute_query(query)
            );
        }
    }

    #[test]
    fn test_apply_is_wire_driven() {
        let sm = StateMachine::new(1, 1);
        let network = Network::new("10.0.0.0/24", "", vec![]);
        let framed = Command::SaveNetwork(network.clone()).encode().unwrap();
        sm.apply(&framed).unwrap();

        let answer = sm
            .lookup(&Query::GetNetwork(network.id).encode().unwrap())
            .unwrap();
        assert_eq!(
            QueryOutput::decode(&answer).unwrap(),
            QueryOutput::Network(Some(network))
        );
    }
}
