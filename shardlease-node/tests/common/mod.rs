//! Shared fixtures for node integration tests

#![allow(dead_code)]

use shardlease_core::{now_millis, AuditStream, ContentHash, Contract, Keypair, Role};
use shardlease_node::NodeContext;
use shardlease_storage::{ContractStore, ShardStorage};
use std::sync::Arc;

pub const SHARD: &[u8] = b"a shard worth leasing to somebody else";
pub const HOUR_MS: i64 = 60 * 60 * 1000;

/// Node on an in-memory shard store and a temporary contract store
pub fn node() -> Arc<NodeContext> {
    node_with_storage(ShardStorage::memory(0))
}

pub fn node_with_storage(storage: ShardStorage) -> Arc<NodeContext> {
    Arc::new(NodeContext::new(
        Keypair::generate(),
        "127.0.0.1",
        4000,
        storage,
        ContractStore::open_temporary().unwrap(),
    ))
}

/// Unsigned contract for `shard`, open for the next hour
pub fn contract_for(renter: &NodeContext, shard: &[u8], audit_count: u32) -> Contract {
    let now = now_millis();
    Contract::new(
        renter.identity(),
        ContentHash::compute(shard),
        shard.len() as u64,
        now - HOUR_MS,
        now + HOUR_MS,
        audit_count,
    )
}

/// Sign `contract` by both parties and have the farmer record it
pub async fn lease(renter: &NodeContext, farmer: &NodeContext, mut contract: Contract) -> Contract {
    contract.sign(Role::Farmer, farmer.keypair()).unwrap();
    contract.sign(Role::Renter, renter.keypair()).unwrap();
    farmer.accept_contract(contract.clone()).await.unwrap();
    contract
}

pub fn audit_of(shard: &[u8], audit_count: u32) -> AuditStream {
    let mut audit = AuditStream::new(audit_count).unwrap();
    audit.update(shard).unwrap();
    audit.finalize().unwrap();
    audit
}
