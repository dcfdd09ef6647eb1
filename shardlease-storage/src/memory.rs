//! In-memory shard backend
//!
//! Used for testing and development. Not persistent.

use crate::backend::ShardBackend;
use bytes::Bytes;
use parking_lot::RwLock;
use shardlease_core::error::{Result, ShardLeaseError};
use shardlease_core::{now_millis, ContentHash};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

/// Bookkeeping charged per stored key
pub const KEY_OVERHEAD: u64 = 32;

#[derive(Default)]
struct MemoryState {
    items: BTreeMap<[u8; 32], Bytes>,
    access: HashMap<[u8; 32], i64>,
    used: u64,
}

/// In-memory shard backend
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
    open: AtomicBool,
    max_allocation: u64,
}

impl MemoryBackend {
    /// Create a new, open, unlimited backend
    pub fn new() -> Self {
        Self::with_allocation(0)
    }

    /// Create with a maximum allocation
    pub fn with_allocation(max_bytes: u64) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            open: AtomicBool::new(true),
            max_allocation: max_bytes,
        }
    }

    /// Clear all stored shards
    pub fn clear(&self) {
        *self.state.write() = MemoryState::default();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ShardLeaseError::StorageUnavailable(
                "memory store is closed".to_string(),
            ))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardBackend for MemoryBackend {
    fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn put(&self, key: &ContentHash, value: Bytes) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write();

        // If replacing, the old value's bytes are freed
        let freed = state
            .items
            .get(key.as_bytes())
            .map(|old| old.len() as u64 + KEY_OVERHEAD)
            .unwrap_or(0);
        let requested = value.len() as u64 + KEY_OVERHEAD;
        let used = state.used - freed;

        if self.max_allocation > 0 && used + requested > self.max_allocation {
            return Err(ShardLeaseError::CapacityExceeded {
                used: state.used,
                requested,
                allocated: self.max_allocation,
            });
        }

        state.items.insert(*key.as_bytes(), value);
        state.used = used + requested;
        Ok(())
    }

    fn get(&self, key: &ContentHash) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let value = state.items.get(key.as_bytes()).cloned();
        if value.is_some() {
            state.access.insert(*key.as_bytes(), now_millis());
        }
        Ok(value)
    }

    fn peek(&self, key: &ContentHash) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        Ok(self.state.read().items.get(key.as_bytes()).cloned())
    }

    fn last_access(&self, key: &ContentHash) -> Result<Option<i64>> {
        self.ensure_open()?;
        Ok(self.state.read().access.get(key.as_bytes()).copied())
    }

    fn delete(&self, key: &ContentHash) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.state.write();
        state.access.remove(key.as_bytes());
        match state.items.remove(key.as_bytes()) {
            Some(old) => {
                state.used -= old.len() as u64 + KEY_OVERHEAD;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn keys_after(&self, cursor: Option<&ContentHash>, limit: usize) -> Result<Vec<ContentHash>> {
        self.ensure_open()?;
        let state = self.state.read();
        let lower = match cursor {
            Some(cursor) => Bound::Excluded(*cursor.as_bytes()),
            None => Bound::Unbounded,
        };
        Ok(state
            .items
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(key, _)| ContentHash::from_bytes(*key))
            .collect())
    }

    fn used_bytes(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.state.read().used)
    }

    fn max_allocation(&self) -> u64 {
        self.max_allocation
    }

    fn flush(&self) -> Result<()> {
        // No-op for in-memory storage
        self.ensure_open()
    }
}
