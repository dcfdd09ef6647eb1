//! Sled-based contract records
//!
//! Every contract a node is party to is stored with its negotiation state
//! and the last time it was audited, accessed and funded. The reaper scans
//! these timestamps to find leases nobody cares about anymore.

use serde::{Deserialize, Serialize};
use shardlease_core::error::{Result, ShardLeaseError};
use shardlease_core::{ContentHash, Contract, NegotiationState};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

const CONTRACTS_TREE: &str = "contracts";

fn unavailable(err: sled::Error) -> ShardLeaseError {
    ShardLeaseError::StorageUnavailable(format!("contract store: {err}"))
}

/// Which activity clock to refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Audit,
    Access,
    Funding,
}

/// Identifies one contract record: shard, farmer, renter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContractKey {
    pub data_hash: ContentHash,
    pub farmer_id: String,
    pub renter_id: String,
}

impl ContractKey {
    pub fn new(data_hash: ContentHash, farmer_id: impl Into<String>, renter_id: impl Into<String>) -> Self {
        Self {
            data_hash,
            farmer_id: farmer_id.into(),
            renter_id: renter_id.into(),
        }
    }

    /// Key of a contract that names its farmer
    pub fn for_contract(contract: &Contract) -> Result<Self> {
        let farmer_id = contract
            .farmer_id
            .clone()
            .ok_or(ShardLeaseError::IncompleteContract)?;
        Ok(Self::new(contract.data_hash, farmer_id, contract.renter_id.clone()))
    }

    fn prefix(data_hash: &ContentHash, farmer_id: &str) -> String {
        format!("{data_hash}/{farmer_id}/")
    }
}

impl fmt::Display for ContractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.data_hash, self.farmer_id, self.renter_id)
    }
}

/// Stored contract with its activity clocks (ms since the epoch)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub contract: Contract,
    pub state: NegotiationState,
    pub last_audit: i64,
    pub last_access: i64,
    pub last_funding: i64,
}

impl ContractRecord {
    /// New record with every clock set to `at`
    pub fn new(contract: Contract, state: NegotiationState, at: i64) -> Self {
        Self {
            contract,
            state,
            last_audit: at,
            last_access: at,
            last_funding: at,
        }
    }

    pub fn key(&self) -> Result<ContractKey> {
        ContractKey::for_contract(&self.contract)
    }

    pub fn touch(&mut self, activity: Activity, at: i64) {
        let clock = match activity {
            Activity::Audit => &mut self.last_audit,
            Activity::Access => &mut self.last_access,
            Activity::Funding => &mut self.last_funding,
        };
        *clock = (*clock).max(at);
    }

    /// True only when all three clocks are older than `before`
    pub fn is_stale(&self, before: i64) -> bool {
        self.last_audit < before && self.last_access < before && self.last_funding < before
    }
}

/// Sled-based contract store
pub struct ContractStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl ContractStore {
    /// Open or create a contract store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!(path = ?path.as_ref(), "Opening Sled contract store");
        let db = sled::open(path.as_ref()).map_err(unavailable)?;
        Self::from_db(db)
    }

    /// Open an in-memory store (for testing)
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(unavailable)?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let tree = db.open_tree(CONTRACTS_TREE).map_err(unavailable)?;
        Ok(Self { db, tree })
    }

    fn decode(bytes: &[u8]) -> Result<ContractRecord> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Store a record, replacing any previous one under the same key
    pub fn put(&self, record: &ContractRecord) -> Result<()> {
        let key = record.key()?;
        let encoded = bincode::serialize(record)?;
        self.tree
            .insert(key.to_string().as_bytes(), encoded)
            .map_err(unavailable)?;
        debug!(key = %key, state = %record.state, "Stored contract record");
        Ok(())
    }

    pub fn get(&self, key: &ContractKey) -> Result<Option<ContractRecord>> {
        match self
            .tree
            .get(key.to_string().as_bytes())
            .map_err(unavailable)?
        {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All records for a shard held by `farmer_id`
    pub fn find(&self, data_hash: &ContentHash, farmer_id: &str) -> Result<Vec<ContractRecord>> {
        let prefix = ContractKey::prefix(data_hash, farmer_id);
        self.tree
            .scan_prefix(prefix.as_bytes())
            .map(|entry| {
                let (_, value) = entry.map_err(unavailable)?;
                Self::decode(&value)
            })
            .collect()
    }

    /// Remove a record. Returns whether it existed.
    pub fn delete(&self, key: &ContractKey) -> Result<bool> {
        let removed = self
            .tree
            .remove(key.to_string().as_bytes())
            .map_err(unavailable)?;
        Ok(removed.is_some())
    }

    /// Apply `f` to a stored record atomically.
    ///
    /// Returns the updated record, or `None` if there is no such record.
    /// An error from `f` leaves the record unchanged.
    pub fn update<F>(&self, key: &ContractKey, mut f: F) -> Result<Option<ContractRecord>>
    where
        F: FnMut(&mut ContractRecord) -> Result<()>,
    {
        let raw_key = key.to_string();
        loop {
            let Some(current) = self.tree.get(raw_key.as_bytes()).map_err(unavailable)? else {
                return Ok(None);
            };
            let mut record = Self::decode(&current)?;
            f(&mut record)?;
            let updated = bincode::serialize(&record)?;

            let swapped = self
                .tree
                .compare_and_swap(raw_key.as_bytes(), Some(&current), Some(updated))
                .map_err(unavailable)?;
            if swapped.is_ok() {
                return Ok(Some(record));
            }
        }
    }

    /// Refresh one activity clock. Returns whether the record exists.
    pub fn touch(&self, key: &ContractKey, activity: Activity, at: i64) -> Result<bool> {
        let updated = self.update(key, |record| {
            record.touch(activity, at);
            Ok(())
        })?;
        Ok(updated.is_some())
    }

    /// Records held by `provider` whose three clocks all predate `before`
    pub fn find_stale(&self, provider: &str, before: i64) -> Result<Vec<ContractRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|record| record.contract.farmer_id.as_deref() == Some(provider))
            .filter(|record| record.is_stale(before))
            .collect())
    }

    /// List all records
    pub fn list(&self) -> Result<Vec<ContractRecord>> {
        self.tree
            .iter()
            .map(|entry| {
                let (_, value) = entry.map_err(unavailable)?;
                Self::decode(&value)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(unavailable)?;
        Ok(())
    }
}
