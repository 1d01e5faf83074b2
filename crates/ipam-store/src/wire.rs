//! Wire format for replicated commands and queries.
//!
//! Each frame is `[type tag: u8] ∥ JSON payload`. JSON keeps the payload
//! self-describing so records round-trip across snapshots and log replay
//! regardless of which release wrote them.

use ipam_common::{Allocation, AllocationId, AuditEntry, Error, Network, NetworkId, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

// Command type tags
pub const CMD_SAVE_NETWORK: u8 = 0;
pub const CMD_DELETE_NETWORK: u8 = 1;
pub const CMD_SAVE_ALLOCATION: u8 = 2;
pub const CMD_DELETE_ALLOCATION: u8 = 3;
pub const CMD_SAVE_AUDIT: u8 = 4;

// Query type tags
pub const QUERY_GET_NETWORK: u8 = 0;
pub const QUERY_GET_NETWORK_BY_CIDR: u8 = 1;
pub const QUERY_LIST_NETWORKS: u8 = 2;
pub const QUERY_GET_ALLOCATION: u8 = 3;
pub const QUERY_GET_ALLOCATION_BY_IP: u8 = 4;
pub const QUERY_LIST_ALLOCATIONS: u8 = 5;
pub const QUERY_LIST_AUDIT: u8 = 6;

/// State mutation applied through the replicated log
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    SaveNetwork(Network),
    DeleteNetwork(NetworkId),
    SaveAllocation(Allocation),
    DeleteAllocation(AllocationId),
    SaveAudit(AuditEntry),
}

impl Command {
    /// Encode as `[tag] ∥ JSON`
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::SaveNetwork(network) => frame(CMD_SAVE_NETWORK, network),
            Self::DeleteNetwork(id) => frame(CMD_DELETE_NETWORK, id),
            Self::SaveAllocation(allocation) => frame(CMD_SAVE_ALLOCATION, allocation),
            Self::DeleteAllocation(id) => frame(CMD_DELETE_ALLOCATION, id),
            Self::SaveAudit(entry) => frame(CMD_SAVE_AUDIT, entry),
        }
    }

    /// Decode a framed command
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (tag, payload) = split_frame(data)?;
        match tag {
            CMD_SAVE_NETWORK => Ok(Self::SaveNetwork(parse(payload)?)),
            CMD_DELETE_NETWORK => Ok(Self::DeleteNetwork(parse(payload)?)),
            CMD_SAVE_ALLOCATION => Ok(Self::SaveAllocation(parse(payload)?)),
            CMD_DELETE_ALLOCATION => Ok(Self::DeleteAllocation(parse(payload)?)),
            CMD_SAVE_AUDIT => Ok(Self::SaveAudit(parse(payload)?)),
            other => Err(Error::Serialization(format!("unknown command tag: {other}"))),
        }
    }
}

/// Key for the `(network, start address)` allocation lookup
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpLookup {
    pub network_id: NetworkId,
    pub ip: IpAddr,
}

/// Read-only query against the replicated state
#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    GetNetwork(NetworkId),
    GetNetworkByCidr(String),
    ListNetworks,
    GetAllocation(AllocationId),
    GetAllocationByIp(IpLookup),
    ListAllocations(NetworkId),
    ListAudit { limit: usize },
}

impl Query {
    /// Encode as `[tag] ∥ JSON`
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::GetNetwork(id) => frame(QUERY_GET_NETWORK, id),
            Self::GetNetworkByCidr(cidr) => frame(QUERY_GET_NETWORK_BY_CIDR, cidr),
            Self::ListNetworks => frame(QUERY_LIST_NETWORKS, &()),
            Self::GetAllocation(id) => frame(QUERY_GET_ALLOCATION, id),
            Self::GetAllocationByIp(lookup) => frame(QUERY_GET_ALLOCATION_BY_IP, lookup),
            Self::ListAllocations(id) => frame(QUERY_LIST_ALLOCATIONS, id),
            Self::ListAudit { limit } => frame(QUERY_LIST_AUDIT, limit),
        }
    }

    /// Decode a framed query
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (tag, payload) = split_frame(data)?;
        match tag {
            QUERY_GET_NETWORK => Ok(Self::GetNetwork(parse(payload)?)),
            QUERY_GET_NETWORK_BY_CIDR => Ok(Self::GetNetworkByCidr(parse(payload)?)),
            QUERY_LIST_NETWORKS => Ok(Self::ListNetworks),
            QUERY_GET_ALLOCATION => Ok(Self::GetAllocation(parse(payload)?)),
            QUERY_GET_ALLOCATION_BY_IP => Ok(Self::GetAllocationByIp(parse(payload)?)),
            QUERY_LIST_ALLOCATIONS => Ok(Self::ListAllocations(parse(payload)?)),
            QUERY_LIST_AUDIT => Ok(Self::ListAudit {
                limit: parse(payload)?,
            }),
            other => Err(Error::Serialization(format!("unknown query tag: {other}"))),
        }
    }
}

/// Result of a [`Query`], carried back across the consensus boundary
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum QueryOutput {
    Network(Option<Network>),
    Networks(Vec<Network>),
    Allocation(Option<Allocation>),
    Allocations(Vec<Allocation>),
    Audit(Vec<AuditEntry>),
}

impl QueryOutput {
    /// Encode as JSON
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::from)
    }

    /// Decode from JSON
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(Error::from)
    }
}

fn frame<T: Serialize>(tag: u8, payload: &T) -> Result<Vec<u8>> {
    let mut buf = vec![tag];
    serde_json::to_writer(&mut buf, payload).map_err(Error::from)?;
    Ok(buf)
}

fn split_frame(data: &[u8]) -> Result<(u8, &[u8])> {
    match data.split_first() {
        Some((tag, payload)) => Ok((*tag, payload)),
        None => Err(Error::Serialization("empty frame".into())),
    }
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipam_common::Network;

    #[test]
    fn test_command_round_trip() {
        let network = Network::new("10.0.0.0/24", "test", vec!["a".into()]);
        let cmd = Command::SaveNetwork(network.clone());
        let encoded = cmd.encode().unwrap();
        assert_eq!(encoded[0], CMD_SAVE_NETWORK);
        assert_eq!(Command::decode(&encoded).unwrap(), cmd);

        let cmd = Command::DeleteNetwork(network.id);
        let encoded = cmd.encode().unwrap();
        assert_eq!(encoded[0], CMD_DELETE_NETWORK);
        assert_eq!(Command::decode(&encoded).unwrap(), cmd);
    }

    #[test]
    fn test_query_round_trip() {
        let query = Query::GetAllocationByIp(IpLookup {
            network_id: NetworkId::new(),
            ip: "10.0.0.1".parse().unwrap(),
        });
        let encoded = query.encode().unwrap();
        assert_eq!(encoded[0], QUERY_GET_ALLOCATION_BY_IP);
        assert_eq!(Query::decode(&encoded).unwrap(), query);

        let query = Query::ListAudit { limit: 25 };
        assert_eq!(Query::decode(&query.encode().unwrap()).unwrap(), query);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Command::decode(&[]).is_err());
        assert!(Command::decode(&[99, b'{', b'}']).is_err());
        assert!(Query::decode(&[99]).is_err());
    }
}
