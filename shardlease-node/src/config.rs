//! Configuration management for the ShardLease node
//!
//! Supports loading from TOML files and environment variables.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity configuration
    #[serde(default)]
    pub node: NodeSettings,

    /// RPC listener configuration
    #[serde(default)]
    pub rpc: RpcSettings,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageSettings,

    /// Announce and reaper timers
    #[serde(default)]
    pub maintenance: MaintenanceSettings,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl NodeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.storage.data_dir.exists() {
            std::fs::create_dir_all(&self.storage.data_dir).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "Cannot create data directory {:?}: {}",
                    self.storage.data_dir, e
                ))
            })?;
        }

        if self.rpc.port == 0 {
            return Err(ConfigError::ValidationError(
                "RPC port cannot be 0".to_string(),
            ));
        }

        if self.storage.max_allocation_mb == 0 {
            return Err(ConfigError::ValidationError(
                "storage.max_allocation_mb must be positive".to_string(),
            ));
        }

        if self.maintenance.announce_interval_secs == 0 || self.maintenance.reaper_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "maintenance intervals must be positive".to_string(),
            ));
        }

        if self.metrics.enabled && self.metrics.port == self.rpc.port {
            return Err(ConfigError::ValidationError(format!(
                "metrics and RPC cannot share port {}",
                self.rpc.port
            )));
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(
        mut self,
        data_dir: Option<PathBuf>,
        port: Option<u16>,
        max_allocation_mb: Option<u64>,
    ) -> Self {
        if let Some(dir) = data_dir {
            self.storage.data_dir = dir;
        }
        if let Some(p) = port {
            self.rpc.port = p;
        }
        if let Some(mb) = max_allocation_mb {
            self.storage.max_allocation_mb = mb;
        }
        self
    }

    /// Apply `SHARDLEASE_*` environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("SHARDLEASE_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }

        if let Ok(allocation) = std::env::var("SHARDLEASE_MAX_ALLOCATION_MB") {
            if let Ok(mb) = allocation.parse::<u64>() {
                self.storage.max_allocation_mb = mb;
            }
        }

        if let Ok(port) = std::env::var("SHARDLEASE_RPC_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.rpc.port = port;
            }
        }

        // Public hostname override (for Docker/cloud networking)
        if let Ok(hostname) = std::env::var("SHARDLEASE_HOSTNAME") {
            self.node.hostname = hostname;
        }

        if let Ok(path) = std::env::var("SHARDLEASE_KEY_PATH") {
            self.node.key_path = Some(PathBuf::from(path));
        }

        self
    }

    /// Where the node key lives
    pub fn key_path(&self) -> PathBuf {
        self.node
            .key_path
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("node.key"))
    }
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Secret key file (defaults to `<data_dir>/node.key`)
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Hostname advertised to peers
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            key_path: None,
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

/// RPC listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSettings {
    /// Address to bind the RPC listener
    #[serde(default = "default_bind_addr")]
    pub bind_address: String,

    /// RPC port, also advertised in our contact
    #[serde(default = "default_rpc_port")]
    pub port: u16,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_addr(),
            port: default_rpc_port(),
        }
    }
}

impl RpcSettings {
    /// Get the RPC listen address
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| {
                ConfigError::ValidationError(format!(
                    "Invalid RPC address {}:{}: {}",
                    self.bind_address, self.port, e
                ))
            })
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_rpc_port() -> u16 {
    4000
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory for shards, contract records and the node key
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Space leased to the network in MB
    #[serde(default = "default_max_allocation")]
    pub max_allocation_mb: u64,

    /// Enable LZ4 compression for stored shards
    #[serde(default = "default_true")]
    pub compression: bool,

    /// RocksDB block cache size in MB
    #[serde(default = "default_cache_size")]
    pub cache_size_mb: usize,

    /// Number of background compaction threads
    #[serde(default = "default_compaction_threads")]
    pub compaction_threads: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_allocation_mb: default_max_allocation(),
            compression: true,
            cache_size_mb: default_cache_size(),
            compaction_threads: default_compaction_threads(),
        }
    }
}

impl StorageSettings {
    /// Convert to shardlease_storage::StorageConfig
    pub fn to_storage_config(&self) -> shardlease_storage::StorageConfig {
        shardlease_storage::StorageConfig {
            path: self.shards_dir(),
            max_allocation: self.max_allocation_mb * 1024 * 1024,
            compression: self.compression,
            cache_size: self.cache_size_mb * 1024 * 1024,
            compaction_threads: self.compaction_threads,
        }
    }

    pub fn shards_dir(&self) -> PathBuf {
        self.data_dir.join("shards")
    }

    pub fn contracts_dir(&self) -> PathBuf {
        self.data_dir.join("contracts")
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_allocation() -> u64 {
    1024 // 1 GB
}

fn default_cache_size() -> usize {
    128
}

fn default_compaction_threads() -> usize {
    4
}

fn default_true() -> bool {
    true
}

/// Announce and reaper timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceSettings {
    /// Seconds between capacity announcements
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,

    /// Seconds between reaper passes
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            announce_interval_secs: default_announce_interval(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

impl MaintenanceSettings {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

fn default_announce_interval() -> u64 {
    15 * 60
}

fn default_reaper_interval() -> u64 {
    60 * 60
}

/// Metrics and monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Enable Prometheus metrics endpoint
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics HTTP server port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9090
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.rpc.port, 4000);
        assert_eq!(config.storage.max_allocation_mb, 1024);
        assert_eq!(config.maintenance.reaper_interval(), Duration::from_secs(3600));
        assert_eq!(config.key_path(), PathBuf::from("./data/node.key"));
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [node]
            hostname = "farmer.example.org"

            [rpc]
            port = 9000

            [storage]
            max_allocation_mb = 100
            compression = false

            [maintenance]
            announce_interval_secs = 30

            [metrics]
            enabled = true
            port = 9191
        "#;

        let config: NodeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.node.hostname, "farmer.example.org");
        assert_eq!(config.rpc.port, 9000);
        assert_eq!(config.storage.max_allocation_mb, 100);
        assert!(!config.storage.compression);
        assert_eq!(config.maintenance.announce_interval_secs, 30);
        assert_eq!(config.maintenance.reaper_interval_secs, 3600);
        assert_eq!(
            config.storage.to_storage_config().max_allocation,
            100 * 1024 * 1024
        );
    }

    #[test]
    fn test_config_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("data");
        let path = temp_dir.path().join("node.toml");
        std::fs::write(
            &path,
            format!("[storage]\ndata_dir = {:?}\n", data_dir.to_string_lossy()),
        )
        .unwrap();

        let config = NodeConfig::from_file(&path).unwrap();
        assert!(data_dir.exists());
        assert_eq!(config.storage.shards_dir(), data_dir.join("shards"));

        let fallback = NodeConfig::load_or_default(temp_dir.path().join("missing.toml"));
        assert_eq!(fallback.rpc.port, 4000);
    }

    #[test]
    fn test_config_validation() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = NodeConfig::default();
        config.storage.data_dir = temp_dir.path().to_path_buf();
        assert!(config.validate().is_ok());

        config.maintenance.reaper_interval_secs = 0;
        assert!(config.validate().is_err());
        config.maintenance.reaper_interval_secs = 1;

        config.metrics.port = config.rpc.port;
        assert!(config.validate().is_err());
        config.metrics.enabled = false;
        assert!(config.validate().is_ok());

        config.storage.max_allocation_mb = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_overrides() {
        let config = NodeConfig::default().with_overrides(
            Some(PathBuf::from("/custom/path")),
            Some(8000),
            Some(64),
        );

        assert_eq!(config.storage.data_dir, PathBuf::from("/custom/path"));
        assert_eq!(config.rpc.port, 8000);
        assert_eq!(config.storage.max_allocation_mb, 64);
        assert_eq!(config.key_path(), PathBuf::from("/custom/path/node.key"));
    }

    #[test]
    fn test_listen_addr() {
        let rpc = RpcSettings::default();
        assert_eq!(rpc.listen_addr().unwrap().port(), 4000);

        let bad = RpcSettings {
            bind_address: "not an address".to_string(),
            port: 1,
        };
        assert!(bad.listen_addr().is_err());
    }
}
