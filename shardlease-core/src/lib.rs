//! ShardLease Core Library
//!
//! Core abstractions for the ShardLease storage market.
//! This crate provides:
//! - Content hashing (Blake3) and Ed25519 node identities
//! - Merkle audit records built over shard bytes and random challenges
//! - Compact inclusion proofs answering a single audit challenge
//! - Signed storage contracts and their negotiation lifecycle
//! - Common types and error handling

pub mod audit;
pub mod contract;
pub mod crypto;
pub mod error;
pub mod proof;

pub use audit::{
    audit_leaf, leaf_count_for, AuditStream, AuditTree, Challenge, PrivateRecord, PublicRecord,
};
pub use contract::{Contract, NegotiationState, Role};
pub use crypto::{identity_key, ContentHash, Keypair};
pub use error::{ErrorKind, Result, ShardLeaseError};
pub use proof::{ProofEngine, ProofPath, ProofStep, Side};

/// Size in bytes of every hash and challenge in the audit protocol
pub const HASH_SIZE: usize = 32;

/// Shards at or above this size are hashed with the multi-threaded Blake3 path
pub const PARALLEL_HASH_THRESHOLD: usize = 1024 * 1024; // 1 MB

/// Current time as milliseconds since the UNIX epoch.
///
/// Contract windows and activity timestamps are all expressed in this unit.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
