//! Service context shared by every protocol handler
//!
//! `NodeContext` owns the node identity, both stores, the pending-offer table
//! and the per-hash locks. Handlers receive it by reference.

use crate::metrics::NodeMetrics;
use crate::pending::{OfferReceiver, PendingOffers};
use crate::protocol::Contact;
use parking_lot::Mutex;
use shardlease_core::error::{Result, ShardLeaseError};
use shardlease_core::{
    now_millis, ContentHash, Contract, Keypair, NegotiationState, PrivateRecord, ProofPath, Role,
};
use shardlease_storage::{
    Activity, ContractKey, ContractRecord, ContractStore, ShardStorage, StorageItem,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// Held while a handler reads or rewrites the item for one content hash
pub type KeyGuard = OwnedMutexGuard<()>;

/// One async mutex per content hash, created on demand
#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<ContentHash, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `hash`
    pub async fn lock(&self, hash: ContentHash) -> KeyGuard {
        let lock = {
            let mut locks = self.locks.lock();
            // Only the table holds a reference: nobody owns or awaits it
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(hash).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of hashes currently tracked
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

pub struct NodeContext {
    keypair: Keypair,
    contact: Contact,
    storage: ShardStorage,
    contracts: Arc<ContractStore>,
    pending: PendingOffers,
    locks: KeyLocks,
    metrics: NodeMetrics,
}

impl NodeContext {
    pub fn new(
        keypair: Keypair,
        hostname: impl Into<String>,
        port: u16,
        storage: ShardStorage,
        contracts: ContractStore,
    ) -> Self {
        let identity = keypair.identity();
        Self {
            contact: Contact::new(identity.clone(), hostname, port),
            metrics: NodeMetrics::new(identity),
            keypair,
            storage,
            contracts: Arc::new(contracts),
            pending: PendingOffers::new(),
            locks: KeyLocks::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.contact.identity
    }

    /// How peers reach this node
    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn storage(&self) -> &ShardStorage {
        &self.storage
    }

    pub fn pending(&self) -> &PendingOffers {
        &self.pending
    }

    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    /// Run a contract store operation on the blocking pool
    pub async fn contracts<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ContractStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.contracts);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| ShardLeaseError::Internal(format!("contract store task failed: {e}")))?
    }

    /// Refresh one activity clock. Failures are logged, never returned.
    pub async fn touch(&self, key: ContractKey, activity: Activity) {
        let at = now_millis();
        let label = key.to_string();
        match self.contracts(move |store| store.touch(&key, activity, at)).await {
            Ok(true) => {}
            Ok(false) => debug!(contract = %label, ?activity, "No contract record to touch"),
            Err(e) => warn!(contract = %label, ?activity, error = %e, "Failed to refresh activity"),
        }
    }

    // ---- renter side ----

    /// Sign `contract` as renter and open it to farmer OFFERs.
    ///
    /// Returns the signed contract to publish and the receiver that resolves
    /// on the first accepted OFFER. A later solicitation for the same hash
    /// replaces this one.
    pub fn solicit_offers(&self, mut contract: Contract) -> Result<(Contract, OfferReceiver)> {
        contract.validate()?;
        contract.sign(Role::Renter, &self.keypair)?;
        info!(data_hash = %contract.data_hash, "Soliciting offers");
        let receiver = self.pending.open(contract.clone());
        Ok((contract, receiver))
    }

    /// Check a farmer's answer to challenge `index`
    pub fn verify_audit(&self, record: &PrivateRecord, index: usize, proof: &ProofPath) -> bool {
        record.verify_proof(index, proof)
    }

    /// Keep the private audit record for a shard placed with `farmer_id`
    pub async fn remember_audit(
        &self,
        data_hash: ContentHash,
        farmer_id: &str,
        record: PrivateRecord,
    ) -> Result<()> {
        let _guard = self.locks.lock(data_hash).await;
        let mut item = self
            .storage
            .peek(data_hash)
            .await?
            .unwrap_or_else(|| StorageItem::new(data_hash));
        item.challenges.insert(farmer_id.to_string(), record);
        self.storage.put(data_hash, &item).await
    }

    pub async fn audit_record(
        &self,
        data_hash: ContentHash,
        farmer_id: &str,
    ) -> Result<Option<PrivateRecord>> {
        Ok(self
            .storage
            .peek(data_hash)
            .await?
            .and_then(|mut item| item.challenges.remove(farmer_id)))
    }

    // ---- farmer side ----

    /// Counter-sign a renter's solicitation before sending it back as an OFFER
    pub fn sign_offer(&self, contract: &mut Contract) -> Result<()> {
        contract.validate()?;
        contract.sign(Role::Farmer, &self.keypair)
    }

    /// Persist a contract completed by the renter's OFFER reply
    pub async fn accept_contract(&self, contract: Contract) -> Result<ContractRecord> {
        if !contract.is_complete() {
            return Err(ShardLeaseError::IncompleteContract);
        }
        if contract.farmer_id.as_deref() != Some(self.identity()) {
            return Err(ShardLeaseError::InvalidSignature(
                "contract names a different farmer".to_string(),
            ));
        }

        let record = ContractRecord::new(contract, NegotiationState::Fulfilling, now_millis());
        let stored = record.clone();
        self.contracts(move |store| store.put(&stored)).await?;

        info!(
            data_hash = %record.contract.data_hash,
            renter = %record.contract.renter_id,
            "Contract accepted"
        );
        Ok(record)
    }

    /// Note that the renter paid for `data_hash`
    pub async fn record_funding(&self, data_hash: ContentHash, renter_id: &str) -> Result<bool> {
        let key = ContractKey::new(data_hash, self.identity(), renter_id);
        let at = now_millis();
        self.contracts(move |store| store.touch(&key, Activity::Funding, at))
            .await
    }
}
