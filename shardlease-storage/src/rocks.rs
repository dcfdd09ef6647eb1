//! RocksDB shard backend
//!
//! Production shard storage using the RocksDB LSM tree. Shard records live
//! in the `items` column family; access timestamps live in `access` so that
//! recording a read never rewrites the shard.

use crate::backend::ShardBackend;
use crate::StorageConfig;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rocksdb::{
    BlockBasedOptions, BoundColumnFamily, Cache, ColumnFamilyDescriptor, DBCompressionType,
    Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB,
};
use shardlease_core::error::{Result, ShardLeaseError};
use shardlease_core::{now_millis, ContentHash};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Column family names
const CF_ITEMS: &str = "items";
const CF_ACCESS: &str = "access";

fn unavailable(context: &str, err: impl std::fmt::Display) -> ShardLeaseError {
    ShardLeaseError::StorageUnavailable(format!("{context}: {err}"))
}

/// RocksDB-based shard backend
pub struct RocksDbBackend {
    /// Configuration
    config: StorageConfig,

    /// RocksDB instance, `None` while closed
    db: RwLock<Option<DB>>,

    /// Serializes capacity check and write
    write_lock: Mutex<()>,
}

impl RocksDbBackend {
    /// Create a closed backend for the given configuration
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            db: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    /// Create and open a backend at the given path with default settings
    pub fn open_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let backend = Self::new(StorageConfig::new(path.as_ref()));
        backend.open()?;
        Ok(backend)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn options(&self) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        opts.set_max_open_files(1000);
        opts.set_keep_log_file_num(10);
        opts.set_max_total_wal_size(256 * 1024 * 1024); // 256 MB WAL
        opts.increase_parallelism(self.config.compaction_threads as i32);
        opts.set_max_background_jobs(self.config.compaction_threads as i32);

        if self.config.compression {
            opts.set_compression_type(DBCompressionType::Lz4);
        }

        let cache = Cache::new_lru_cache(self.config.cache_size);
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(&cache);
        block_opts.set_block_size(64 * 1024); // shards are large values
        block_opts.set_cache_index_and_filter_blocks(true);
        block_opts.set_pin_l0_filter_and_index_blocks_in_cache(true);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_min_write_buffer_number(2);
        opts.set_max_write_buffer_number(4);
        opts.set_write_buffer_size(64 * 1024 * 1024); // 64 MB write buffer
        opts
    }

    /// Run `f` against the open database
    fn with_db<T>(&self, f: impl FnOnce(&DB) -> Result<T>) -> Result<T> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| {
            ShardLeaseError::StorageUnavailable("shard store is closed".to_string())
        })?;
        f(db)
    }

    fn cf<'a>(db: &'a DB, name: &str) -> Result<Arc<BoundColumnFamily<'a>>> {
        db.cf_handle(name).ok_or_else(|| {
            ShardLeaseError::StorageUnavailable(format!("missing column family {name}"))
        })
    }

    /// SST files plus memtables across both column families
    fn measure(db: &DB) -> Result<u64> {
        let mut total = 0u64;
        for name in [CF_ITEMS, CF_ACCESS] {
            let cf = Self::cf(db, name)?;
            for property in ["rocksdb.total-sst-files-size", "rocksdb.cur-size-all-mem-tables"] {
                total += db
                    .property_int_value_cf(&cf, property)
                    .map_err(|e| unavailable("Size query failed", e))?
                    .unwrap_or(0);
            }
        }
        Ok(total)
    }
}

impl ShardBackend for RocksDbBackend {
    fn open(&self) -> Result<()> {
        let mut guard = self.db.write();
        if guard.is_some() {
            return Ok(());
        }
        info!(path = ?self.config.path, "Opening RocksDB shard store");

        std::fs::create_dir_all(&self.config.path)
            .map_err(|e| unavailable("Failed to create storage directory", e))?;

        let opts = self.options();
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ITEMS, opts.clone()),
            ColumnFamilyDescriptor::new(CF_ACCESS, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, &self.config.path, cf_descriptors).map_err(|e| {
            error!(path = ?self.config.path, error = %e, "Failed to open RocksDB");
            unavailable("Failed to open RocksDB", e)
        })?;

        *guard = Some(db);
        info!("RocksDB shard store opened successfully");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(db) = self.db.write().take() {
            db.flush_cf(&Self::cf(&db, CF_ITEMS)?)
                .map_err(|e| unavailable("Flush on close failed", e))?;
            info!(path = ?self.config.path, "Closed RocksDB shard store");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.db.read().is_some()
    }

    fn put(&self, key: &ContentHash, value: Bytes) -> Result<()> {
        let _write = self.write_lock.lock();
        self.with_db(|db| {
            let items = Self::cf(db, CF_ITEMS)?;
            let requested = (value.len() + key.as_bytes().len()) as u64;
            if self.config.max_allocation > 0 {
                // Replacing a value frees the old one
                let freed = db
                    .get_pinned_cf(&items, key.as_bytes())
                    .map_err(|e| unavailable("Read failed", e))?
                    .map(|old| (old.len() + key.as_bytes().len()) as u64)
                    .unwrap_or(0);

                let mut used = Self::measure(db)?.saturating_sub(freed);
                if used + requested > self.config.max_allocation && freed > 0 {
                    // Overwritten versions stay in the memtables until flushed
                    db.flush_cf(&items)
                        .map_err(|e| unavailable("Flush failed", e))?;
                    used = Self::measure(db)?.saturating_sub(freed);
                }
                if used + requested > self.config.max_allocation {
                    return Err(ShardLeaseError::CapacityExceeded {
                        used,
                        requested,
                        allocated: self.config.max_allocation,
                    });
                }
            }

            let mut write_opts = WriteOptions::default();
            write_opts.set_sync(false);
            db.put_cf_opt(&items, key.as_bytes(), &value, &write_opts)
                .map_err(|e| unavailable("Write failed", e))?;

            debug!(key = %key, size = value.len(), "Stored shard record");
            Ok(())
        })
    }

    fn get(&self, key: &ContentHash) -> Result<Option<Bytes>> {
        self.with_db(|db| {
            let value = db
                .get_cf(&Self::cf(db, CF_ITEMS)?, key.as_bytes())
                .map_err(|e| unavailable("Read failed", e))?;
            if value.is_some() {
                db.put_cf(
                    &Self::cf(db, CF_ACCESS)?,
                    key.as_bytes(),
                    now_millis().to_be_bytes(),
                )
                .map_err(|e| unavailable("Access update failed", e))?;
            }
            Ok(value.map(Bytes::from))
        })
    }

    fn peek(&self, key: &ContentHash) -> Result<Option<Bytes>> {
        self.with_db(|db| {
            let value = db
                .get_cf(&Self::cf(db, CF_ITEMS)?, key.as_bytes())
                .map_err(|e| unavailable("Read failed", e))?;
            Ok(value.map(Bytes::from))
        })
    }

    fn last_access(&self, key: &ContentHash) -> Result<Option<i64>> {
        self.with_db(|db| {
            let value = db
                .get_cf(&Self::cf(db, CF_ACCESS)?, key.as_bytes())
                .map_err(|e| unavailable("Read failed", e))?;
            match value {
                Some(bytes) => {
                    let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                        ShardLeaseError::Serialization(format!("bad access time for {key}"))
                    })?;
                    Ok(Some(i64::from_be_bytes(bytes)))
                }
                None => Ok(None),
            }
        })
    }

    fn delete(&self, key: &ContentHash) -> Result<bool> {
        let _write = self.write_lock.lock();
        self.with_db(|db| {
            let items = Self::cf(db, CF_ITEMS)?;
            let exists = db
                .get_pinned_cf(&items, key.as_bytes())
                .map_err(|e| unavailable("Exists check failed", e))?
                .is_some();
            if !exists {
                return Ok(false);
            }

            let mut batch = WriteBatch::default();
            batch.delete_cf(&items, key.as_bytes());
            batch.delete_cf(&Self::cf(db, CF_ACCESS)?, key.as_bytes());
            db.write(batch).map_err(|e| unavailable("Delete failed", e))?;

            debug!(key = %key, "Deleted shard record");
            Ok(true)
        })
    }

    fn keys_after(&self, cursor: Option<&ContentHash>, limit: usize) -> Result<Vec<ContentHash>> {
        self.with_db(|db| {
            let items = Self::cf(db, CF_ITEMS)?;
            let mode = match cursor {
                Some(cursor) => IteratorMode::From(&cursor.as_bytes()[..], Direction::Forward),
                None => IteratorMode::Start,
            };

            let mut keys = Vec::with_capacity(limit);
            for entry in db.iterator_cf(&items, mode) {
                if keys.len() >= limit {
                    break;
                }
                let (key, _) = entry.map_err(|e| unavailable("Iteration failed", e))?;
                let Ok(bytes) = <[u8; 32]>::try_from(key.as_ref()) else {
                    continue;
                };
                if cursor.is_some_and(|cursor| cursor.as_bytes() == &bytes) {
                    continue;
                }
                keys.push(ContentHash::from_bytes(bytes));
            }
            Ok(keys)
        })
    }

    fn used_bytes(&self) -> Result<u64> {
        self.with_db(Self::measure)
    }

    fn max_allocation(&self) -> u64 {
        self.config.max_allocation
    }

    fn flush(&self) -> Result<()> {
        self.with_db(|db| {
            for name in [CF_ITEMS, CF_ACCESS] {
                db.flush_cf(&Self::cf(db, name)?)
                    .map_err(|e| unavailable("Flush failed", e))?;
            }
            debug!("Flushed shard store to disk");
            Ok(())
        })
    }
}
