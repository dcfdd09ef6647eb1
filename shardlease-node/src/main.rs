//! ShardLease Storage Node Daemon
//!
//! Runs a storage node that:
//! - Stores leased shards locally using RocksDB
//! - Keeps contract records and their activity clocks in sled
//! - Answers OFFER, AUDIT, CONSIGN and RETRIEVE over JSON-lines RPC
//! - Announces free capacity and reaps abandoned contracts
//! - Reports metrics via a Prometheus endpoint

use anyhow::Context;
use clap::Parser;
use shardlease_core::Keypair;
use shardlease_node::{
    init_metrics, BroadcastAnnouncer, CapacityReaper, MetricsServer, NodeConfig, NodeContext,
    RpcServer,
};
use shardlease_storage::{ContractStore, ShardStorage};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shardlease-node")]
#[command(about = "ShardLease storage node daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Data directory (overrides config file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// RPC listen port (overrides config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Space leased to the network in MB (overrides config file)
    #[arg(long)]
    max_allocation_mb: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Print this node's identity and exit
    #[arg(long)]
    print_identity: bool,
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    // Priority: CLI args > environment > config.toml > defaults
    let config = NodeConfig::load_or_default(&cli.config)
        .with_env_overrides()
        .with_overrides(cli.data_dir, cli.port, cli.max_allocation_mb);
    config.validate().context("invalid configuration")?;

    let keypair = Keypair::load_or_generate(&config.key_path())
        .with_context(|| format!("failed to load node key from {:?}", config.key_path()))?;

    if cli.print_identity {
        println!("{}", keypair.identity());
        return Ok(());
    }

    info!(identity = %keypair.identity(), "ShardLease node starting...");

    let storage = ShardStorage::rocksdb(config.storage.to_storage_config());
    storage
        .open()
        .await
        .context("shard store is unavailable")?;
    let contracts = ContractStore::open(config.storage.contracts_dir())
        .context("contract store is unavailable")?;

    info!(
        data_dir = ?config.storage.data_dir,
        max_allocation_mb = config.storage.max_allocation_mb,
        "Storage opened"
    );

    // The recorder must be installed before NodeContext registers its gauges
    let metrics_server = if config.metrics.enabled {
        init_metrics();
        MetricsServer::new(config.metrics.port)
            .map_err(|e| warn!(error = %e, "Metrics disabled"))
            .ok()
    } else {
        None
    };

    let ctx = Arc::new(NodeContext::new(
        keypair,
        config.node.hostname.clone(),
        config.rpc.port,
        storage.clone(),
        contracts,
    ));

    if let Some(server) = metrics_server {
        let storage = storage.clone();
        let metrics = ctx.metrics().clone();
        tokio::spawn(async move {
            if let Err(e) = server.start(storage, metrics).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let announcer = Arc::new(BroadcastAnnouncer::default());
    let reaper = CapacityReaper::new(Arc::clone(&ctx), announcer, &config.maintenance);
    let reaper_task = tokio::spawn(reaper.run());

    let server = RpcServer::bind(config.rpc.listen_addr()?, Arc::clone(&ctx))
        .await
        .context("failed to bind RPC listener")?;
    let server_task = tokio::spawn(server.serve());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = server_task => {
            match result {
                Ok(Err(e)) => error!(error = %e, "RPC server stopped"),
                Err(e) => error!(error = %e, "RPC server task panicked"),
                Ok(Ok(())) => {}
            }
        }
    }

    reaper_task.abort();
    ctx.metrics().mark_down();
    ctx.contracts(|store| store.flush()).await?;
    storage.close().await?;

    info!("ShardLease node stopped");
    Ok(())
}
