//! Capacity announcements and stale contract reaping
//!
//! Both jobs run on their own timer. Neither ever takes the node down: a
//! failed announcement skips its cycle and a contract that cannot be reaped
//! is left for the next pass.

use crate::config::MaintenanceSettings;
use crate::context::NodeContext;
use crate::protocol::Contact;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shardlease_core::error::Result;
use shardlease_core::{now_millis, NegotiationState};
use shardlease_storage::ContractRecord;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How long a contract may go without any activity before it is scored down
pub const SCORE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Extra slack after `SCORE_INTERVAL` before a contract is reaped
pub const REAPER_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

/// Contracts idle on every clock since before this are reaped
fn stale_cutoff(now: i64) -> i64 {
    now - (SCORE_INTERVAL + REAPER_GRACE).as_millis() as i64
}

/// Free space published to the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityAnnouncement {
    pub contact: Contact,
    pub allocated: u64,
    pub available: u64,
    /// ms since the epoch
    pub timestamp: i64,
}

/// Publishes capacity announcements to peers
#[async_trait]
pub trait CapacityAnnouncer: Send + Sync {
    async fn publish(&self, announcement: CapacityAnnouncement) -> Result<()>;
}

/// In-process announcer backed by a broadcast channel
#[derive(Clone)]
pub struct BroadcastAnnouncer {
    tx: broadcast::Sender<CapacityAnnouncement>,
}

impl BroadcastAnnouncer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CapacityAnnouncement> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastAnnouncer {
    fn default() -> Self {
        Self::new(16)
    }
}

#[async_trait]
impl CapacityAnnouncer for BroadcastAnnouncer {
    async fn publish(&self, announcement: CapacityAnnouncement) -> Result<()> {
        // No subscribers is not a failure
        if self.tx.send(announcement).is_err() {
            debug!("No capacity subscribers");
        }
        Ok(())
    }
}

/// Outcome of one reaper pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapSummary {
    pub scanned: usize,
    pub reaped: usize,
    /// Selected as stale but active again by the time it was retired
    pub revived: usize,
    pub failed: usize,
}

pub struct CapacityReaper {
    ctx: Arc<NodeContext>,
    announcer: Arc<dyn CapacityAnnouncer>,
    announce_interval: Duration,
    reaper_interval: Duration,
}

impl CapacityReaper {
    pub fn new(
        ctx: Arc<NodeContext>,
        announcer: Arc<dyn CapacityAnnouncer>,
        settings: &MaintenanceSettings,
    ) -> Self {
        Self {
            ctx,
            announcer,
            announce_interval: settings.announce_interval(),
            reaper_interval: settings.reaper_interval(),
        }
    }

    /// Measure the shard store and publish its capacity
    pub async fn announce(&self) -> Result<CapacityAnnouncement> {
        let capacity = self.ctx.storage().size().await?;
        self.ctx.metrics().update_capacity(&capacity);
        if capacity.is_full() {
            warn!(
                allocated = capacity.allocated,
                used = capacity.used,
                "Shard allocation is used up"
            );
        }

        let announcement = CapacityAnnouncement {
            contact: self.ctx.contact().clone(),
            allocated: capacity.allocated,
            available: capacity.available,
            timestamp: now_millis(),
        };
        self.announcer.publish(announcement.clone()).await?;
        Ok(announcement)
    }

    async fn announce_cycle(&self) {
        match self.announce().await {
            Ok(announcement) => {
                self.ctx.metrics().record_announce(true);
                debug!(
                    allocated = announcement.allocated,
                    available = announcement.available,
                    "Capacity announced"
                );
            }
            Err(e) => {
                self.ctx.metrics().record_announce(false);
                warn!(error = %e, "Skipping capacity announcement");
            }
        }
    }

    pub async fn reap(&self) -> Result<ReapSummary> {
        self.reap_at(now_millis()).await
    }

    /// Reap every contract of ours idle on all three clocks as of `now`
    pub async fn reap_at(&self, now: i64) -> Result<ReapSummary> {
        let cutoff = stale_cutoff(now);
        let provider = self.ctx.identity().to_string();
        let stale = self
            .ctx
            .contracts(move |store| store.find_stale(&provider, cutoff))
            .await?;

        let mut summary = ReapSummary {
            scanned: stale.len(),
            ..Default::default()
        };
        for record in stale {
            match self.reap_contract(record, now).await {
                Ok(true) => summary.reaped += 1,
                Ok(false) => summary.revived += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(error = %e, "Failed to reap contract, will retry next pass");
                }
            }
        }

        let pruned = self.ctx.pending().prune();
        if pruned > 0 {
            debug!(pruned, "Dropped abandoned solicitations");
        }

        self.ctx.metrics().record_reap(summary.reaped, summary.failed);
        if summary.scanned > 0 {
            info!(
                scanned = summary.scanned,
                reaped = summary.reaped,
                revived = summary.revived,
                failed = summary.failed,
                "Reaper pass complete"
            );
        }
        Ok(summary)
    }

    /// Reap one contract that was selected as stale as of `now`.
    ///
    /// The record is retired only if it is still stale at that moment;
    /// returns `false` if it saw activity (or disappeared) since selection.
    pub async fn reap_contract(&self, record: ContractRecord, now: i64) -> Result<bool> {
        let cutoff = stale_cutoff(now);
        let key = record.key()?;
        let data_hash = key.data_hash;
        let renter = key.renter_id.clone();

        let retire = key.clone();
        let retired = self
            .ctx
            .contracts(move |store| {
                let mut revived = false;
                let updated = store.update(&retire, |current| {
                    revived = !current.is_stale(cutoff);
                    if revived {
                        return Ok(());
                    }
                    current.state.advance(NegotiationState::Retired)
                })?;
                Ok(updated.is_some() && !revived)
            })
            .await?;
        if !retired {
            debug!(contract = %key, "Contract active again, not reaping");
            return Ok(false);
        }

        {
            let _guard = self.ctx.locks().lock(data_hash).await;
            if let Some(mut item) = self.ctx.storage().peek(data_hash).await? {
                item.remove_contract(&renter);
                if item.is_orphaned() {
                    self.ctx.storage().delete(data_hash).await?;
                } else {
                    self.ctx.storage().put(data_hash, &item).await?;
                }
            }
        }

        let label = key.to_string();
        self.ctx.contracts(move |store| store.delete(&key)).await?;
        debug!(contract = %label, "Contract reaped");
        Ok(true)
    }

    /// Drive announcements and reaping until the task is dropped.
    ///
    /// The two timers are polled concurrently, so a long reaper pass does not
    /// hold back the next announcement.
    pub async fn run(self) {
        info!(
            announce_secs = self.announce_interval.as_secs(),
            reaper_secs = self.reaper_interval.as_secs(),
            "Starting capacity reaper"
        );

        tokio::join!(self.announce_loop(), self.reap_loop());
    }

    async fn announce_loop(&self) {
        let mut announce = tokio::time::interval(self.announce_interval);
        announce.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            announce.tick().await;
            self.announce_cycle().await;
        }
    }

    async fn reap_loop(&self) {
        let mut reap = tokio::time::interval(self.reaper_interval);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            reap.tick().await;
            if let Err(e) = self.reap().await {
                error!(error = %e, "Reaper pass could not start");
            }
        }
    }
}
