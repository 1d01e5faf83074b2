//! Consensus driver for clustered deployments.
//!
//! [`RaftStore`] implements the [`Store`] contract by framing every
//! mutation as a command proposed through a [`NodeHost`] and every read as
//! a linearizable query. The concrete Raft transport, log, and snapshot
//! file I/O live behind the `NodeHost` trait; the driver only guarantees
//! the framing, deadlines, and error translation.
//!
//! Commands are idempotent by primary key and deletes by absence, so a
//! caller that observes `timeout` can safely retry.

use crate::state_machine::StateMachine;
use crate::wire::{Command, IpLookup, Query, QueryOutput};
use crate::Store;
use ipam_common::{
    Allocation, AllocationId, AuditEntry, ClusterConfig, Error, Network, NetworkId, RaftConfig,
    Result,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Transport-side surface of a Raft replica.
///
/// `propose` blocks until the command is committed and applied on this
/// replica or the deadline expires; `linearizable_read` first confirms
/// leadership with a read-index quorum so the answer observes every
/// previously committed command. Implementations surface
/// [`Error::Timeout`] and [`Error::NoLeader`] as appropriate.
pub trait NodeHost: Send + Sync {
    /// Submit a framed command to the replicated log.
    fn propose(&self, cmd: &[u8], deadline: Duration) -> Result<()>;

    /// Perform a linearizable read of a framed query.
    fn linearizable_read(&self, query: &[u8], deadline: Duration) -> Result<Vec<u8>>;

    /// Current leader id and whether one is known.
    fn leader(&self) -> Result<(u64, bool)>;

    /// Current membership as node_id -> raft address.
    fn membership(&self, deadline: Duration) -> Result<BTreeMap<u64, String>>;

    /// Add a node to the cluster.
    fn add_node(&self, node_id: u64, addr: &str, deadline: Duration) -> Result<()>;

    /// Remove a node from the cluster.
    fn remove_node(&self, node_id: u64, deadline: Duration) -> Result<()>;
}

/// Observed cluster topology
#[derive(Clone, Debug, Serialize)]
pub struct ClusterInfo {
    pub cluster_id: u64,
    pub leader_id: u64,
    pub has_leader: bool,
    pub nodes: Vec<NodeInfo>,
}

/// One cluster member
#[derive(Clone, Debug, Serialize)]
pub struct NodeInfo {
    pub node_id: u64,
    pub raft_addr: String,
    pub is_leader: bool,
}

/// Store that routes every operation through consensus
pub struct RaftStore {
    cluster_id: u64,
    node_id: u64,
    host: Arc<dyn NodeHost>,
    proposal_deadline: Duration,
    membership_deadline: Duration,
}

impl RaftStore {
    /// Create a driver over an already-started replica host
    pub fn new(config: &ClusterConfig, raft: &RaftConfig, host: Arc<dyn NodeHost>) -> Result<Self> {
        config.validate()?;
        info!(
            node_id = config.node_id,
            cluster_id = config.cluster_id,
            raft_addr = %config.raft_addr,
            "starting raft store"
        );
        Ok(Self {
            cluster_id: config.cluster_id,
            node_id: config.node_id,
            host,
            proposal_deadline: raft.proposal_timeout(),
            membership_deadline: raft.membership_timeout(),
        })
    }

    /// This replica's node id
    #[must_use]
    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    fn execute(&self, cmd: &Command) -> Result<()> {
        self.host.propose(&cmd.encode()?, self.proposal_deadline)
    }

    fn query(&self, query: &Query) -> Result<QueryOutput> {
        let answer = self
            .host
            .linearizable_read(&query.encode()?, self.proposal_deadline)?;
        QueryOutput::decode(&answer)
    }

    /// Observe the cluster topology
    pub fn cluster_info(&self) -> Result<ClusterInfo> {
        let (leader_id, has_leader) = self.host.leader()?;
        let members = self.host.membership(self.membership_deadline)?;
        let nodes = members
            .into_iter()
            .map(|(node_id, raft_addr)| NodeInfo {
                node_id,
                raft_addr,
                is_leader: has_leader && node_id == leader_id,
            })
            .collect();
        Ok(ClusterInfo {
            cluster_id: self.cluster_id,
            leader_id,
            has_leader,
            nodes,
        })
    }

    /// Add a member to the cluster
    pub fn add_member(&self, node_id: u64, addr: &str) -> Result<()> {
        self.host.add_node(node_id, addr, self.membership_deadline)
    }

    /// Remove a member from the cluster
    pub fn remove_member(&self, node_id: u64) -> Result<()> {
        self.host.remove_node(node_id, self.membership_deadline)
    }
}

impl Store for RaftStore {
    fn save_network(&self, network: &Network) -> Result<()> {
        self.execute(&Command::SaveNetwork(network.clone()))
    }

    fn get_network(&self, id: &NetworkId) -> Result<Network> {
        match self.query(&Query::GetNetwork(*id))? {
            QueryOutput::Network(Some(network)) => Ok(network),
            QueryOutput::Network(None) => Err(Error::NetworkNotFound(id.to_string())),
            other => Err(unexpected(&other)),
        }
    }

    fn get_network_by_cidr(&self, cidr: &str) -> Result<Network> {
        match self.query(&Query::GetNetworkByCidr(cidr.to_string()))? {
            QueryOutput::Network(Some(network)) => Ok(network),
            QueryOutput::Network(None) => Err(Error::NetworkNotFound(cidr.to_string())),
            other => Err(unexpected(&other)),
        }
    }

    fn list_networks(&self) -> Result<Vec<Network>> {
        match self.query(&Query::ListNetworks)? {
            QueryOutput::Networks(networks) => Ok(networks),
            other => Err(unexpected(&other)),
        }
    }

    fn delete_network(&self, id: &NetworkId) -> Result<()> {
        self.execute(&Command::DeleteNetwork(*id))
    }

    fn save_allocation(&self, allocation: &Allocation) -> Result<()> {
        self.execute(&Command::SaveAllocation(allocation.clone()))
    }

    fn get_allocation(&self, id: &AllocationId) -> Result<Allocation> {
        match self.query(&Query::GetAllocation(*id))? {
            QueryOutput::Allocation(Some(allocation)) => Ok(allocation),
            QueryOutput::Allocation(None) => Err(Error::NotAllocated(id.to_string())),
            other => Err(unexpected(&other)),
        }
    }

    fn get_allocation_by_ip(&self, network_id: &NetworkId, ip: IpAddr) -> Result<Allocation> {
        let lookup = IpLookup {
            network_id: *network_id,
            ip,
        };
        match self.query(&Query::GetAllocationByIp(lookup))? {
            QueryOutput::Allocation(Some(allocation)) => Ok(allocation),
            QueryOutput::Allocation(None) => Err(Error::NotAllocated(ip.to_string())),
            other => Err(unexpected(&other)),
        }
    }

    fn list_allocations(&self, network_id: &NetworkId) -> Result<Vec<Allocation>> {
        match self.query(&Query::ListAllocations(*network_id))? {
            QueryOutput::Allocations(allocations) => Ok(allocations),
            other => Err(unexpected(&other)),
        }
    }

    fn delete_allocation(&self, id: &AllocationId) -> Result<()> {
        self.execute(&Command::DeleteAllocation(*id))
    }

    fn save_audit_entry(&self, entry: &AuditEntry) -> Result<()> {
        self.execute(&Command::SaveAudit(entry.clone()))
    }

    fn list_audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        match self.query(&Query::ListAudit { limit })? {
            QueryOutput::Audit(entries) => Ok(entries),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(output: &QueryOutput) -> Error {
    Error::Internal(format!("unexpected query output: {output:?}"))
}

/// In-process replica host for single-node clusters.
///
/// Applies proposals straight to a local [`StateMachine`]; this node is
/// always the leader. Used for `enable_single_node` deployments and tests;
/// multi-node clusters plug a real Raft transport into [`NodeHost`].
pub struct SingleNodeHost {
    node_id: u64,
    state_machine: Arc<StateMachine>,
    members: RwLock<BTreeMap<u64, String>>,
}

impl SingleNodeHost {
    /// Validate the cluster config and start an empty replica
    pub fn new(config: &ClusterConfig) -> Result<Self> {
        config.validate()?;
        let mut members = config.initial_members.clone();
        if members.is_empty() {
            members.insert(config.node_id, config.raft_addr.clone());
        }
        Ok(Self {
            node_id: config.node_id,
            state_machine: Arc::new(StateMachine::new(config.cluster_id, config.node_id)),
            members: RwLock::new(members),
        })
    }

    /// The replica's state machine, for snapshot save/restore
    #[must_use]
    pub fn state_machine(&self) -> Arc<StateMachine> {
        Arc::clone(&self.state_machine)
    }
}

impl NodeHost for SingleNodeHost {
    fn propose(&self, cmd: &[u8], _deadline: Duration) -> Result<()> {
        self.state_machine.apply(cmd)
    }

    fn linearizable_read(&self, query: &[u8], _deadline: Duration) -> Result<Vec<u8>> {
        self.state_machine.lookup(query)
    }

    fn leader(&self) -> Result<(u64, bool)> {
        Ok((self.node_id, true))
    }

    fn membership(&self, _deadline: Duration) -> Result<BTreeMap<u64, String>> {
        Ok(self.members.read().clone())
    }

    fn add_node(&self, node_id: u64, addr: &str, _deadline: Duration) -> Result<()> {
        self.members.write().insert(node_id, addr.to_string());
        Ok(())
    }

    fn remove_node(&self, node_id: u64, _deadline: Duration) -> Result<()> {
        if node_id == self.node_id {
            return Err(Error::Configuration(
                "cannot remove the only replica".into(),
            ));
        }
        self.members.write().remove(&node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_node_store() -> RaftStore {
        let config = ClusterConfig::default();
        let host = Arc::new(SingleNodeHost::new(&config).unwrap());
        RaftStore::new(&config, &RaftConfig::default(), host).unwrap()
    }

    #[test]
    fn test_raft_store_round_trip() {
        let store = single_node_store();
        let network = Network::new("10.0.0.0/24", "clustered", vec![]);

        store.save_network(&network).unwrap();
        assert_eq!(store.get_network(&network.id).unwrap(), network);
        assert_eq!(store.get_network_by_cidr("10.0.0.0/24").unwrap(), network);
        assert_eq!(store.list_networks().unwrap(), vec![network.clone()]);

        store.delete_network(&network.id).unwrap();
        assert!(store.get_network(&network.id).is_err());
        // Deletes are idempotent by absence
        store.delete_network(&network.id).unwrap();
    }

    #[test]
    fn test_cluster_info_single_node() {
        let store = single_node_store();
        let info = store.cluster_info().unwrap();
        assert_eq!(info.cluster_id, 1);
        assert!(info.has_leader);
        assert_eq!(info.leader_id, 1);
        assert_eq!(info.nodes.len(), 1);
        assert!(info.nodes[0].is_leader);
    }

    #[test]
    fn test_membership_changes() {
        let store = single_node_store();
        store.add_member(2, "localhost:5001").unwrap();
        let info = store.cluster_info().unwrap();
        assert_eq!(info.nodes.len(), 2);

        store.remove_member(2).unwrap();
        assert_eq!(store.cluster_info().unwrap().nodes.len(), 1);

        assert!(store.remove_member(1).is_err());
    }
}
