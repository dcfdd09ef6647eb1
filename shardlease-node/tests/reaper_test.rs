//! Capacity Reaper Integration Tests
//!
//! Tests stale contract selection, best-effort reaping and capacity
//! announcements.
//!
//! Run with: cargo test --test reaper_test

mod common;

use bytes::Bytes;
use common::*;
use parking_lot::Mutex;
use shardlease_core::{now_millis, ContentHash, NegotiationState, Result, ShardLeaseError};
use shardlease_node::{
    BroadcastAnnouncer, CapacityReaper, MaintenanceSettings, NodeContext, ReapSummary,
    REAPER_GRACE, SCORE_INTERVAL,
};
use shardlease_storage::{
    Activity, ContractKey, MemoryBackend, ShardBackend, ShardStorage, StorageItem,
};
use std::sync::Arc;
use std::time::Duration;

const IDLE_MS: i64 = (SCORE_INTERVAL.as_millis() + REAPER_GRACE.as_millis()) as i64;

/// Memory backend that can be told to refuse writes and deletes for one key,
/// or to stall every `peek`
#[derive(Default)]
struct FailingBackend {
    inner: MemoryBackend,
    poisoned: Mutex<Option<ContentHash>>,
    stall: Mutex<Option<Duration>>,
}

impl FailingBackend {
    fn check(&self, key: &ContentHash) -> Result<()> {
        if self.poisoned.lock().as_ref() == Some(key) {
            return Err(ShardLeaseError::StorageUnavailable("disk on fire".to_string()));
        }
        Ok(())
    }
}

impl ShardBackend for FailingBackend {
    fn open(&self) -> Result<()> {
        self.inner.open()
    }
    fn close(&self) -> Result<()> {
        self.inner.close()
    }
    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
    fn put(&self, key: &ContentHash, value: Bytes) -> Result<()> {
        self.check(key)?;
        self.inner.put(key, value)
    }
    fn get(&self, key: &ContentHash) -> Result<Option<Bytes>> {
        self.inner.get(key)
    }
    fn peek(&self, key: &ContentHash) -> Result<Option<Bytes>> {
        let stall = *self.stall.lock();
        if let Some(stall) = stall {
            std::thread::sleep(stall);
        }
        self.inner.peek(key)
    }
    fn last_access(&self, key: &ContentHash) -> Result<Option<i64>> {
        self.inner.last_access(key)
    }
    fn delete(&self, key: &ContentHash) -> Result<bool> {
        self.check(key)?;
        self.inner.delete(key)
    }
    fn keys_after(&self, cursor: Option<&ContentHash>, limit: usize) -> Result<Vec<ContentHash>> {
        self.inner.keys_after(cursor, limit)
    }
    fn used_bytes(&self) -> Result<u64> {
        self.inner.used_bytes()
    }
    fn max_allocation(&self) -> u64 {
        self.inner.max_allocation()
    }
    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }
}

fn reaper(ctx: &Arc<NodeContext>) -> (CapacityReaper, BroadcastAnnouncer) {
    let announcer = BroadcastAnnouncer::new(4);
    let reaper = CapacityReaper::new(
        Arc::clone(ctx),
        Arc::new(announcer.clone()),
        &MaintenanceSettings::default(),
    );
    (reaper, announcer)
}

/// Lease `shard` from a fresh renter and store it on `farmer`
async fn stored_lease(farmer: &NodeContext, shard: &[u8]) -> ContractKey {
    let renter = node();
    let contract = lease(&renter, farmer, contract_for(&renter, shard, 2)).await;
    let hash = contract.data_hash;

    let mut item = farmer
        .storage()
        .peek(hash)
        .await
        .unwrap()
        .unwrap_or_else(|| StorageItem::new(hash));
    item.shard = Some(shard.to_vec());
    item.insert_contract(
        renter.identity(),
        contract,
        audit_of(shard, 2).public_record().unwrap(),
    );
    farmer.storage().put(hash, &item).await.unwrap();

    ContractKey::new(hash, farmer.identity(), renter.identity())
}

async fn record_exists(ctx: &NodeContext, key: &ContractKey) -> bool {
    let key = key.clone();
    ctx.contracts(move |store| store.get(&key)).await.unwrap().is_some()
}

#[tokio::test]
async fn test_reap_requires_all_three_clocks_idle() {
    let farmer = node();
    let (reaper, _announcer) = reaper(&farmer);

    let idle = stored_lease(&farmer, b"idle shard").await;
    let audited = stored_lease(&farmer, b"audited shard").await;
    let accessed = stored_lease(&farmer, b"accessed shard").await;
    let funded = stored_lease(&farmer, b"funded shard").await;

    // Far enough in the future that every clock set at lease time is stale
    let now = now_millis() + IDLE_MS + 60_000;
    for (key, activity) in [
        (&audited, Activity::Audit),
        (&accessed, Activity::Access),
        (&funded, Activity::Funding),
    ] {
        let key = key.clone();
        farmer
            .contracts(move |store| store.touch(&key, activity, now - 1_000))
            .await
            .unwrap();
    }

    let summary = reaper.reap_at(now).await.unwrap();
    assert_eq!(
        summary,
        ReapSummary {
            scanned: 1,
            reaped: 1,
            revived: 0,
            failed: 0
        }
    );

    assert!(!record_exists(&farmer, &idle).await);
    assert_eq!(farmer.storage().peek(idle.data_hash).await.unwrap(), None);

    for key in [&audited, &accessed, &funded] {
        assert!(record_exists(&farmer, key).await);
        assert!(farmer.storage().peek(key.data_hash).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_nothing_stale_right_after_lease() {
    let farmer = node();
    let (reaper, _announcer) = reaper(&farmer);
    let key = stored_lease(&farmer, b"fresh").await;

    assert_eq!(reaper.reap().await.unwrap(), ReapSummary::default());
    assert!(record_exists(&farmer, &key).await);
}

#[tokio::test]
async fn test_reap_keeps_shard_for_other_renters() {
    let farmer = node();
    let (reaper, _announcer) = reaper(&farmer);

    let stale = stored_lease(&farmer, SHARD).await;
    let fresh = stored_lease(&farmer, SHARD).await;
    assert_eq!(stale.data_hash, fresh.data_hash);

    let now = now_millis() + IDLE_MS + 60_000;
    let touched = fresh.clone();
    farmer
        .contracts(move |store| store.touch(&touched, Activity::Funding, now))
        .await
        .unwrap();

    let summary = reaper.reap_at(now).await.unwrap();
    assert_eq!(summary.reaped, 1);

    let item = farmer.storage().peek(fresh.data_hash).await.unwrap().unwrap();
    assert_eq!(item.shard(), Some(SHARD));
    assert!(item.contracts.contains_key(&fresh.renter_id));
    assert!(!item.contracts.contains_key(&stale.renter_id));
    assert!(!record_exists(&farmer, &stale).await);
}

#[tokio::test]
async fn test_activity_after_selection_saves_contract() {
    let farmer = node();
    let (reaper, _announcer) = reaper(&farmer);
    let key = stored_lease(&farmer, SHARD).await;

    let now = now_millis() + IDLE_MS + 60_000;
    let provider = farmer.identity().to_string();
    let selected = farmer
        .contracts(move |store| store.find_stale(&provider, now - IDLE_MS))
        .await
        .unwrap();
    assert_eq!(selected.len(), 1);

    // An audit lands between selection and retirement
    let touched = key.clone();
    farmer
        .contracts(move |store| store.touch(&touched, Activity::Audit, now))
        .await
        .unwrap();

    let snapshot = selected.into_iter().next().unwrap();
    assert!(!reaper.reap_contract(snapshot, now).await.unwrap());

    let lookup = key.clone();
    let record = farmer
        .contracts(move |store| store.get(&lookup))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, NegotiationState::Fulfilling);
    let item = farmer.storage().peek(key.data_hash).await.unwrap().unwrap();
    assert!(item.contracts.contains_key(&key.renter_id));

    // A full pass agrees
    let summary = reaper.reap_at(now).await.unwrap();
    assert_eq!(summary, ReapSummary::default());
}

#[tokio::test]
async fn test_reap_contract_on_stale_snapshot() {
    let farmer = node();
    let (reaper, _announcer) = reaper(&farmer);
    let key = stored_lease(&farmer, SHARD).await;

    let lookup = key.clone();
    let snapshot = farmer
        .contracts(move |store| store.get(&lookup))
        .await
        .unwrap()
        .unwrap();
    let now = now_millis() + IDLE_MS + 60_000;
    assert!(reaper.reap_contract(snapshot.clone(), now).await.unwrap());
    assert!(!record_exists(&farmer, &key).await);

    // Already gone
    assert!(!reaper.reap_contract(snapshot, now).await.unwrap());
}

#[tokio::test]
async fn test_reap_failure_does_not_stop_scan() {
    let backend = Arc::new(FailingBackend::default());
    let farmer = node_with_storage(ShardStorage::new(backend.clone()));
    let (reaper, _announcer) = reaper(&farmer);

    let bad = stored_lease(&farmer, b"cursed shard").await;
    let good = stored_lease(&farmer, b"ordinary shard").await;
    *backend.poisoned.lock() = Some(bad.data_hash);

    let now = now_millis() + IDLE_MS + 60_000;
    let summary = reaper.reap_at(now).await.unwrap();
    assert_eq!(
        summary,
        ReapSummary {
            scanned: 2,
            reaped: 1,
            revived: 0,
            failed: 1
        }
    );
    assert!(!record_exists(&farmer, &good).await);
    assert_eq!(farmer.storage().peek(good.data_hash).await.unwrap(), None);

    // The failed contract is retired but kept for the next pass
    let lookup = bad.clone();
    let record = farmer
        .contracts(move |store| store.get(&lookup))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, NegotiationState::Retired);
    assert!(farmer.storage().peek(bad.data_hash).await.unwrap().is_some());

    *backend.poisoned.lock() = None;
    let summary = reaper.reap_at(now).await.unwrap();
    assert_eq!(summary.reaped, 1);
    assert!(!record_exists(&farmer, &bad).await);
    assert_eq!(farmer.storage().peek(bad.data_hash).await.unwrap(), None);
}

#[tokio::test]
async fn test_announce_publishes_capacity() {
    let farmer = node_with_storage(ShardStorage::memory(1 << 20));
    let (reaper, announcer) = reaper(&farmer);
    let mut announcements = announcer.subscribe();

    stored_lease(&farmer, SHARD).await;
    let sent = reaper.announce().await.unwrap();
    assert_eq!(sent.allocated, 1 << 20);
    assert!(sent.available < 1 << 20);
    assert_eq!(&sent.contact, farmer.contact());

    let received = announcements.recv().await.unwrap();
    assert_eq!(received, sent);
}

#[tokio::test]
async fn test_reap_pass_prunes_abandoned_solicitations() {
    let node = node();
    let (reaper, _announcer) = reaper(&node);
    let (_, matched) = node.solicit_offers(contract_for(&node, SHARD, 2)).unwrap();
    assert_eq!(node.pending().len(), 1);

    drop(matched);
    reaper.reap().await.unwrap();
    assert!(node.pending().is_empty());
}

#[tokio::test]
async fn test_slow_reap_does_not_hold_back_announcements() {
    let backend = Arc::new(FailingBackend::default());
    let farmer = node_with_storage(ShardStorage::new(backend.clone()));
    let key = stored_lease(&farmer, SHARD).await;

    // Backdate every clock so the first reaper pass picks it up
    let idle_since = now_millis() - IDLE_MS - 60_000;
    farmer
        .contracts(move |store| {
            store.update(&key, |record| {
                record.last_audit = idle_since;
                record.last_access = idle_since;
                record.last_funding = idle_since;
                Ok(())
            })
        })
        .await
        .unwrap();
    *backend.stall.lock() = Some(Duration::from_secs(3));

    let announcer = BroadcastAnnouncer::new(4);
    let mut announcements = announcer.subscribe();
    let settings = MaintenanceSettings {
        announce_interval_secs: 1,
        reaper_interval_secs: 3600,
    };
    let reaper = CapacityReaper::new(Arc::clone(&farmer), Arc::new(announcer), &settings);
    let task = tokio::spawn(reaper.run());

    // Two announcements arrive while the reaper pass is still stuck in peek
    let received = tokio::time::timeout(Duration::from_millis(2500), async {
        announcements.recv().await.unwrap();
        announcements.recv().await.unwrap();
    })
    .await;
    task.abort();
    assert!(received.is_ok(), "announcements waited for the reaper pass");
}

#[tokio::test]
async fn test_announce_fails_when_storage_closed() {
    let farmer = node();
    let (reaper, _announcer) = reaper(&farmer);
    farmer.storage().close().await.unwrap();

    let err = reaper.announce().await.unwrap_err();
    assert!(matches!(err, ShardLeaseError::StorageUnavailable(_)));
}
