//! ShardLease Storage Node Library
//!
//! Provides components for running a storage lease node:
//! - Configuration management
//! - Service context, pending offers and per-shard locks
//! - OFFER / AUDIT / CONSIGN / RETRIEVE handlers and their dispatch table
//! - Capacity announcements and stale contract reaping
//! - JSON-lines RPC adapter
//! - Prometheus metrics and health endpoint

pub mod config;
pub mod context;
pub mod handlers;
pub mod metrics;
pub mod pending;
pub mod protocol;
pub mod reaper;
pub mod server;

pub use config::{
    ConfigError, MaintenanceSettings, MetricsSettings, NodeConfig, NodeSettings, RpcSettings,
    StorageSettings,
};
pub use context::{KeyGuard, KeyLocks, NodeContext};
pub use metrics::{init_metrics, MetricsServer, NodeMetrics};
pub use pending::{OfferMatch, OfferReceiver, PendingOffers};
pub use protocol::{dispatch, handle_rpc, Contact, Method, Request, Response};
pub use reaper::{
    BroadcastAnnouncer, CapacityAnnouncement, CapacityAnnouncer, CapacityReaper, ReapSummary,
    REAPER_GRACE, SCORE_INTERVAL,
};
pub use server::{RpcClient, RpcReply, RpcServer};
