//! Error types for the IPAM service.
//!
//! This module defines the common error taxonomy propagated across the
//! store boundary and surfaced to callers.

use thiserror::Error;

/// Common result type for IPAM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the IPAM service
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Validation errors
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("invalid allocation count: {0}")]
    InvalidCount(u64),

    #[error("address out of range: {0}")]
    OutOfRange(String),

    // Network errors
    #[error("network already exists: {0}")]
    NetworkExists(String),

    #[error("network not found: {0}")]
    NetworkNotFound(String),

    #[error("network too large: {hosts} host addresses exceeds pool cap of {cap}")]
    NetworkTooLarge { hosts: u128, cap: u64 },

    // Allocation errors
    #[error("no available addresses in network {0}")]
    IpNotAvailable(String),

    #[error("address run already allocated at offset {0}")]
    AlreadyAllocated(u64),

    #[error("ip not allocated: {0}")]
    NotAllocated(String),

    // Consensus errors
    #[error("consensus deadline exceeded")]
    Timeout,

    #[error("no cluster leader")]
    NoLeader,

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not-found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NetworkNotFound(_) | Self::NotAllocated(_))
    }

    /// Check if this error is safe to retry (commands are idempotent by key)
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::NoLeader)
    }

    /// Get HTTP status code for the REST API layer
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidCidr(_)
            | Self::InvalidCount(_)
            | Self::OutOfRange(_)
            | Self::NetworkTooLarge { .. }
            | Self::Configuration(_) => 400,

            // 404 Not Found
            Self::NetworkNotFound(_) | Self::NotAllocated(_) => 404,

            // 409 Conflict
            Self::NetworkExists(_) | Self::IpNotAvailable(_) | Self::AlreadyAllocated(_) => 409,

            // 503 Service Unavailable
            Self::NoLeader => 503,

            // 504 Gateway Timeout
            Self::Timeout => 504,

            // 500 Internal Server Error
            Self::Storage(_) | Self::Serialization(_) | Self::Internal(_) => 500,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
