//! Stored unit of the shard store
//!
//! One `StorageItem` exists per shard hash. It keeps a single physical copy
//! of the shard, shared by every renter holding a contract for it.

use serde::{Deserialize, Serialize};
use shardlease_core::error::Result;
use shardlease_core::{ContentHash, Contract, PrivateRecord, PublicRecord};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageItem {
    pub hash: ContentHash,

    /// Shard bytes, once consigned
    pub shard: Option<Vec<u8>>,

    /// Contracts keyed by renter identity
    pub contracts: BTreeMap<String, Contract>,

    /// Public audit records keyed by renter identity
    pub trees: BTreeMap<String, PublicRecord>,

    /// Private audit records keyed by farmer identity (renter side)
    pub challenges: BTreeMap<String, PrivateRecord>,
}

impl StorageItem {
    pub fn new(hash: ContentHash) -> Self {
        Self {
            hash,
            shard: None,
            contracts: BTreeMap::new(),
            trees: BTreeMap::new(),
            challenges: BTreeMap::new(),
        }
    }

    pub fn shard(&self) -> Option<&[u8]> {
        self.shard.as_deref()
    }

    /// Attach a renter's contract and the audit leaves they supplied
    pub fn insert_contract(&mut self, renter_id: &str, contract: Contract, tree: PublicRecord) {
        self.contracts.insert(renter_id.to_string(), contract);
        self.trees.insert(renter_id.to_string(), tree);
    }

    /// Detach a renter. Returns whether they had a contract here.
    ///
    /// The shard bytes are dropped along with the last contract.
    pub fn remove_contract(&mut self, renter_id: &str) -> bool {
        self.trees.remove(renter_id);
        let removed = self.contracts.remove(renter_id).is_some();
        if self.contracts.is_empty() {
            self.shard = None;
        }
        removed
    }

    pub fn has_contracts(&self) -> bool {
        !self.contracts.is_empty()
    }

    /// Nothing left worth keeping: no contracts and no audit secrets
    pub fn is_orphaned(&self) -> bool {
        self.contracts.is_empty() && self.challenges.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
