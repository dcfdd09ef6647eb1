//! Prometheus metrics for the ShardLease node
//!
//! Exposes RPC, capacity and maintenance metrics.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shardlease_storage::{ShardCapacity, ShardStorage};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Metric names as constants
pub mod names {
    // RPC metrics
    pub const RPC_REQUESTS_TOTAL: &str = "shardlease_rpc_requests_total";
    pub const RPC_DURATION: &str = "shardlease_rpc_duration_seconds";
    pub const SHARD_BYTES_IN: &str = "shardlease_shard_bytes_in_total";
    pub const SHARD_BYTES_OUT: &str = "shardlease_shard_bytes_out_total";

    // Capacity metrics
    pub const STORAGE_BYTES_ALLOCATED: &str = "shardlease_storage_bytes_allocated";
    pub const STORAGE_BYTES_USED: &str = "shardlease_storage_bytes_used";
    pub const STORAGE_BYTES_AVAILABLE: &str = "shardlease_storage_bytes_available";
    pub const STORAGE_USAGE_PERCENT: &str = "shardlease_storage_usage_percent";

    // Maintenance metrics
    pub const ANNOUNCE_SUCCESS: &str = "shardlease_announce_success_total";
    pub const ANNOUNCE_FAILURE: &str = "shardlease_announce_failure_total";
    pub const CONTRACTS_REAPED: &str = "shardlease_contracts_reaped_total";
    pub const REAP_FAILURES: &str = "shardlease_reap_failures_total";

    // Health metrics
    pub const NODE_UP: &str = "shardlease_node_up";
    pub const NODE_START_TIME: &str = "shardlease_node_start_time_seconds";
}

/// Initialize metric descriptions
pub fn init_metrics() {
    describe_counter!(
        names::RPC_REQUESTS_TOTAL,
        "RPC requests handled, by method and outcome"
    );
    describe_histogram!(
        names::RPC_DURATION,
        "RPC handling duration in seconds"
    );
    describe_counter!(names::SHARD_BYTES_IN, "Shard bytes accepted by CONSIGN");
    describe_counter!(names::SHARD_BYTES_OUT, "Shard bytes served by RETRIEVE");

    describe_gauge!(
        names::STORAGE_BYTES_ALLOCATED,
        "Bytes leased to the network"
    );
    describe_gauge!(
        names::STORAGE_BYTES_USED,
        "Bytes used on the shard medium"
    );
    describe_gauge!(
        names::STORAGE_BYTES_AVAILABLE,
        "Bytes still available for new shards"
    );
    describe_gauge!(
        names::STORAGE_USAGE_PERCENT,
        "Share of the allocation in use (0 when unlimited)"
    );

    describe_counter!(
        names::ANNOUNCE_SUCCESS,
        "Capacity announcements published"
    );
    describe_counter!(
        names::ANNOUNCE_FAILURE,
        "Capacity announcements skipped after a failure"
    );
    describe_counter!(names::CONTRACTS_REAPED, "Stale contracts reaped");
    describe_counter!(
        names::REAP_FAILURES,
        "Stale contracts that could not be reaped"
    );

    describe_gauge!(names::NODE_UP, "Whether the node is up (1) or down (0)");
    describe_gauge!(
        names::NODE_START_TIME,
        "Unix timestamp when the node started"
    );
}

/// Metrics recorder labelled with the node identity
#[derive(Clone)]
pub struct NodeMetrics {
    identity: String,
    start_time: std::time::Instant,
}

impl NodeMetrics {
    /// Create a new metrics recorder
    pub fn new(identity: impl Into<String>) -> Self {
        let metrics = Self {
            identity: identity.into(),
            start_time: std::time::Instant::now(),
        };

        gauge!(names::NODE_UP, "node_id" => metrics.identity.clone()).set(1.0);
        gauge!(names::NODE_START_TIME, "node_id" => metrics.identity.clone())
            .set(chrono::Utc::now().timestamp() as f64);

        metrics
    }

    /// Record one handled RPC
    pub fn record_rpc(&self, method: &str, outcome: &str, duration: Duration) {
        let labels = [
            ("node_id", self.identity.clone()),
            ("method", method.to_string()),
            ("outcome", outcome.to_string()),
        ];
        counter!(names::RPC_REQUESTS_TOTAL, &labels).increment(1);
        histogram!(names::RPC_DURATION, "method" => method.to_string())
            .record(duration.as_secs_f64());
    }

    pub fn record_shard_in(&self, bytes: usize) {
        counter!(names::SHARD_BYTES_IN, "node_id" => self.identity.clone()).increment(bytes as u64);
    }

    pub fn record_shard_out(&self, bytes: usize) {
        counter!(names::SHARD_BYTES_OUT, "node_id" => self.identity.clone()).increment(bytes as u64);
    }

    /// Update capacity gauges
    pub fn update_capacity(&self, capacity: &ShardCapacity) {
        gauge!(names::STORAGE_BYTES_ALLOCATED, "node_id" => self.identity.clone())
            .set(capacity.allocated as f64);
        gauge!(names::STORAGE_BYTES_USED, "node_id" => self.identity.clone())
            .set(capacity.used as f64);
        gauge!(names::STORAGE_BYTES_AVAILABLE, "node_id" => self.identity.clone())
            .set(capacity.available as f64);
        gauge!(names::STORAGE_USAGE_PERCENT, "node_id" => self.identity.clone())
            .set(capacity.usage_percent());
    }

    /// Record announcement result
    pub fn record_announce(&self, success: bool) {
        if success {
            counter!(names::ANNOUNCE_SUCCESS, "node_id" => self.identity.clone()).increment(1);
        } else {
            counter!(names::ANNOUNCE_FAILURE, "node_id" => self.identity.clone()).increment(1);
        }
    }

    /// Record the outcome of one reaper pass
    pub fn record_reap(&self, reaped: usize, failed: usize) {
        counter!(names::CONTRACTS_REAPED, "node_id" => self.identity.clone()).increment(reaped as u64);
        counter!(names::REAP_FAILURES, "node_id" => self.identity.clone()).increment(failed as u64);
    }

    /// Mark node as down
    pub fn mark_down(&self) {
        gauge!(names::NODE_UP, "node_id" => self.identity.clone()).set(0.0);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// HTTP server for the metrics and health endpoints
pub struct MetricsServer {
    handle: PrometheusHandle,
    addr: SocketAddr,
}

impl MetricsServer {
    /// Install the Prometheus recorder and prepare the server
    pub fn new(port: u16) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        let handle = PrometheusBuilder::new().install_recorder()?;
        Ok(Self { handle, addr })
    }

    /// Serve `/metrics`, and `/health` which reports whether the shard store
    /// is open and how long the node has been up
    pub async fn start(
        self,
        storage: ShardStorage,
        metrics: NodeMetrics,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let app = router(self.handle, storage, metrics);

        info!(addr = %self.addr, "Starting metrics server");

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

fn router(handle: PrometheusHandle, storage: ShardStorage, metrics: NodeMetrics) -> axum::Router {
    use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};

    let health_handler = move || {
        let storage = storage.clone();
        let uptime_secs = metrics.uptime_secs();
        async move {
            let (status, label) = if storage.is_open() {
                (StatusCode::OK, "ok")
            } else {
                (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
            };
            let body = serde_json::json!({ "status": label, "uptime_secs": uptime_secs });
            (status, Json(body)).into_response()
        }
    };

    let metrics_handler = move || {
        let handle = handle.clone();
        async move { handle.render() }
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
}
