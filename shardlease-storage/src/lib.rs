//! ShardLease Storage
//!
//! Provides the shard store and contract persistence:
//! - `ShardBackend` trait for pluggable byte stores
//! - `RocksDbBackend` for production shard storage
//! - `MemoryBackend` for testing
//! - `ShardStorage`, the async store of `StorageItem`s used by the node
//! - `ContractStore` for contract records and their activity timestamps

pub mod backend;
pub mod contracts;
pub mod engine;
pub mod item;
pub mod memory;
pub mod rocks;

pub use backend::{ShardBackend, ShardCapacity};
pub use contracts::{Activity, ContractKey, ContractRecord, ContractStore};
pub use engine::ShardStorage;
pub use item::StorageItem;
pub use memory::MemoryBackend;
pub use rocks::RocksDbBackend;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to storage directory
    pub path: std::path::PathBuf,

    /// Maximum bytes leased to the network (0 = unlimited)
    pub max_allocation: u64,

    /// Enable compression for stored shards
    pub compression: bool,

    /// Cache size in bytes for RocksDB block cache
    pub cache_size: usize,

    /// Number of background compaction threads
    pub compaction_threads: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: std::path::PathBuf::from("./shardlease_data"),
            max_allocation: 0, // Unlimited
            compression: true,
            cache_size: 128 * 1024 * 1024, // 128 MB
            compaction_threads: 4,
        }
    }
}

impl StorageConfig {
    /// Create a new storage config with the given path
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set maximum allocation
    pub fn with_max_allocation(mut self, bytes: u64) -> Self {
        self.max_allocation = bytes;
        self
    }

    /// Set cache size
    pub fn with_cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = bytes;
        self
    }

    /// Enable/disable compression
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }
}
