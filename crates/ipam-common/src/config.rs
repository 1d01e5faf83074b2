//! Cluster configuration for replicated deployments.
//!
//! The cluster config is a JSON document consumed by the consensus driver;
//! the raft config carries protocol tuning consumed by the transport.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a node in a replicated IPAM cluster
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Unique identifier for this node (1-based)
    pub node_id: u64,
    /// Identifies the IPAM cluster
    pub cluster_id: u64,
    /// Address for Raft communication (e.g. "localhost:5000")
    pub raft_addr: String,
    /// Address for the API server (e.g. "localhost:8080")
    pub api_addr: String,
    /// Directory for Raft log, snapshots, and node host state
    pub data_dir: PathBuf,
    /// Whether this node is joining an existing cluster
    #[serde(default)]
    pub join: bool,
    /// Map of node_id -> raft_addr for the initial cluster members
    #[serde(default)]
    pub initial_members: BTreeMap<u64, String>,
    /// Allow running a single-node cluster
    #[serde(default)]
    pub enable_single_node: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            cluster_id: 1,
            raft_addr: "localhost:5000".to_string(),
            api_addr: "localhost:8080".to_string(),
            data_dir: PathBuf::from("ipam-cluster-data"),
            join: false,
            initial_members: BTreeMap::from([(1, "localhost:5000".to_string())]),
            enable_single_node: true,
        }
    }
}

impl ClusterConfig {
    /// Load a cluster configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())
            .map_err(|e| Error::Configuration(format!("failed to read cluster config: {e}")))?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::Configuration(format!("failed to parse cluster config: {e}")))
    }

    /// Check that the configuration is internally consistent
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(Error::Configuration(
                "node ID must be greater than 0".into(),
            ));
        }
        if self.cluster_id == 0 {
            return Err(Error::Configuration(
                "cluster ID must be greater than 0".into(),
            ));
        }
        validate_host_port(&self.raft_addr)
            .map_err(|e| Error::Configuration(format!("invalid raft address: {e}")))?;
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Configuration("data directory is required".into()));
        }
        if !self.enable_single_node && self.initial_members.is_empty() {
            return Err(Error::Configuration(
                "initial members are required for cluster mode".into(),
            ));
        }
        if self.join && self.initial_members.is_empty() {
            return Err(Error::Configuration(
                "initial members are required when joining a cluster".into(),
            ));
        }
        if !self.initial_members.is_empty()
            && !self.join
            && !self.initial_members.contains_key(&self.node_id)
        {
            return Err(Error::Configuration(format!(
                "this node (ID {}) must be in the initial members list",
                self.node_id
            )));
        }
        for (node_id, addr) in &self.initial_members {
            if *node_id == 0 {
                return Err(Error::Configuration(
                    "node ID in initial members must be greater than 0".into(),
                ));
            }
            validate_host_port(addr).map_err(|e| {
                Error::Configuration(format!("invalid address for node {node_id}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Per-node persistence directory under `data_dir`
    #[must_use]
    pub fn node_dir(&self) -> PathBuf {
        self.data_dir.join(format!("node-{}", self.node_id))
    }

    /// Parse a comma-separated list of `nodeID:address` pairs.
    ///
    /// Example: `"1:localhost:5000,2:localhost:5001,3:localhost:5002"`
    pub fn parse_initial_members(members: &str) -> Result<BTreeMap<u64, String>> {
        let mut out = BTreeMap::new();
        if members.is_empty() {
            return Ok(out);
        }
        for pair in members.split(',') {
            let (id, addr) = pair.split_once(':').ok_or_else(|| {
                Error::Configuration(format!(
                    "invalid member format: {pair} (expected nodeID:address)"
                ))
            })?;
            let node_id: u64 = id
                .trim()
                .parse()
                .map_err(|e| Error::Configuration(format!("invalid node ID in {pair}: {e}")))?;
            let addr = addr.trim();
            if addr.is_empty() {
                return Err(Error::Configuration(format!(
                    "empty address for node {node_id}"
                )));
            }
            out.insert(node_id, addr.to_string());
        }
        Ok(out)
    }
}

fn validate_host_port(addr: &str) -> std::result::Result<(), String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("{addr}: expected host:port"))?;
    if host.is_empty() {
        return Err(format!("{addr}: missing hostname or IP"));
    }
    let port: u32 = port
        .parse()
        .map_err(|_| format!("{addr}: invalid port number"))?;
    if port == 0 || port > 65535 {
        return Err(format!("{addr}: invalid port number"));
    }
    Ok(())
}

/// Raft protocol tuning consumed by the consensus transport
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Election timeout in RTT units
    pub election_rtt: u64,
    /// Heartbeat interval in RTT units
    pub heartbeat_rtt: u64,
    /// Estimated round-trip time in milliseconds
    pub rtt_millis: u64,
    /// A leader that loses contact with a majority steps down
    pub check_quorum: bool,
    /// Take a snapshot after this many applied commands
    pub snapshot_entries: u64,
    /// Log entries retained after a snapshot
    pub compaction_overhead: u64,
    /// Proposal deadline in milliseconds
    pub proposal_timeout_millis: u64,
    /// Membership-change deadline in milliseconds
    pub membership_timeout_millis: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_rtt: 10,
            heartbeat_rtt: 1,
            rtt_millis: 200,
            check_quorum: true,
            snapshot_entries: 10_000,
            compaction_overhead: 5_000,
            proposal_timeout_millis: 3_000,
            membership_timeout_millis: 5_000,
        }
    }
}

impl RaftConfig {
    /// Proposal deadline as a [`Duration`]
    #[must_use]
    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_millis)
    }

    /// Membership-change deadline as a [`Duration`]
    #[must_use]
    pub fn membership_timeout(&self) -> Duration {
        Duration::from_millis(self.membership_timeout_millis)
    }
}
