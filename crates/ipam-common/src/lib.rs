//! Shared types for the IPAM service.
//!
//! This crate defines the entity records, the error taxonomy, and the
//! cluster configuration used by every other crate in the workspace.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ClusterConfig, RaftConfig};
pub use error::{Error, Result};
pub use types::{
    Allocation, AllocationId, AllocationRequest, AllocationStatus, AuditAction, AuditEntry,
    Network, NetworkId, NetworkStats, AUDIT_LOG_LIMIT,
};
