//! Error types for ShardLease
//!
//! Provides a unified error type for all ShardLease operations, plus the
//! coarse [`ErrorKind`] taxonomy reported to RPC callers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ShardLease operations
pub type Result<T> = std::result::Result<T, ShardLeaseError>;

/// Unified error type for ShardLease
#[derive(Error, Debug)]
pub enum ShardLeaseError {
    // ===== Input Errors =====
    #[error("Invalid format: {0}")]
    Format(String),

    #[error("Audit stream already finalized")]
    Shape,

    #[error("Audit stream not finalized")]
    NotFinalized,

    // ===== Signature Errors =====
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    // ===== Contract State Errors =====
    #[error("Contract no longer open to offers: {0}")]
    StaleOffer(String),

    #[error("Contract is not complete")]
    IncompleteContract,

    #[error("Shard size {size} exceeds the contract ({limit} bytes)")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("Consignment at {at} violates contract store time [{begin}, {end}]")]
    WindowViolation { at: i64, begin: i64, end: i64 },

    #[error("Shard hash does not match contract: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Challenge response not in audit tree")]
    ChallengeNotFound,

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // ===== Lookup Errors =====
    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Contract not found: {0}")]
    ContractNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // ===== Storage Errors =====
    #[error("Capacity exceeded: {used} + {requested} > {allocated} bytes")]
    CapacityExceeded {
        used: u64,
        requested: u64,
        allocated: u64,
    },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error classes visible to RPC callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Format,
    Signature,
    ContractState,
    NotFound,
    CapacityExceeded,
    StorageUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Format => "format",
            ErrorKind::Signature => "signature",
            ErrorKind::ContractState => "contract_state",
            ErrorKind::NotFound => "not_found",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::StorageUnavailable => "storage_unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ShardLeaseError {
    /// Classify this error for the caller
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShardLeaseError::Format(_)
            | ShardLeaseError::Shape
            | ShardLeaseError::NotFinalized => ErrorKind::Format,
            ShardLeaseError::InvalidSignature(_) => ErrorKind::Signature,
            ShardLeaseError::StaleOffer(_)
            | ShardLeaseError::IncompleteContract
            | ShardLeaseError::SizeExceeded { .. }
            | ShardLeaseError::WindowViolation { .. }
            | ShardLeaseError::HashMismatch { .. }
            | ShardLeaseError::ChallengeNotFound
            | ShardLeaseError::InvalidTransition { .. } => ErrorKind::ContractState,
            ShardLeaseError::ShardNotFound(_)
            | ShardLeaseError::ContractNotFound(_)
            | ShardLeaseError::NotFound(_) => ErrorKind::NotFound,
            ShardLeaseError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            ShardLeaseError::StorageUnavailable(_) | ShardLeaseError::Io(_) => {
                ErrorKind::StorageUnavailable
            }
            ShardLeaseError::Serialization(_)
            | ShardLeaseError::Configuration(_)
            | ShardLeaseError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error reflects the environment rather than the request
    pub fn is_environmental(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StorageUnavailable | ErrorKind::Internal
        )
    }
}

impl From<bincode::Error> for ShardLeaseError {
    fn from(err: bincode::Error) -> Self {
        ShardLeaseError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ShardLeaseError {
    fn from(err: serde_json::Error) -> Self {
        ShardLeaseError::Format(err.to_string())
    }
}
