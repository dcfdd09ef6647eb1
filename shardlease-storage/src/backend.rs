//! Shard backend trait
//!
//! Defines the byte store every shard medium must provide. Backends are
//! synchronous; [`crate::ShardStorage`] moves their calls onto the blocking
//! pool.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use shardlease_core::error::Result;
use shardlease_core::ContentHash;

/// Capacity report for the leased space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCapacity {
    /// Configured maximum (0 = unlimited)
    pub allocated: u64,

    /// Bytes measured on the medium
    pub used: u64,

    /// Bytes still free for new shards
    pub available: u64,
}

impl ShardCapacity {
    pub fn new(allocated: u64, used: u64) -> Self {
        let available = if allocated == 0 {
            u64::MAX
        } else {
            allocated.saturating_sub(used)
        };
        Self {
            allocated,
            used,
            available,
        }
    }

    /// Calculate usage percentage
    pub fn usage_percent(&self) -> f64 {
        if self.allocated == 0 {
            0.0
        } else {
            (self.used as f64 / self.allocated as f64) * 100.0
        }
    }

    /// Check if the allocation is used up
    pub fn is_full(&self) -> bool {
        self.allocated > 0 && self.used >= self.allocated
    }
}

/// Synchronous shard byte store.
///
/// Every operation except `open`, `close` and `is_open` fails with
/// `StorageUnavailable` while the backend is closed.
pub trait ShardBackend: Send + Sync {
    /// Open the medium. Opening an open backend is a no-op.
    fn open(&self) -> Result<()>;

    /// Close the medium. Closing a closed backend is a no-op.
    fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Store `value` under `key`, failing with `CapacityExceeded` if the
    /// write would go past the allocation. A failed put changes nothing.
    fn put(&self, key: &ContentHash, value: Bytes) -> Result<()>;

    /// Read a value and record the access time
    fn get(&self, key: &ContentHash) -> Result<Option<Bytes>>;

    /// Read a value without touching the access time
    fn peek(&self, key: &ContentHash) -> Result<Option<Bytes>>;

    /// Last time `get` returned this key, in ms since the epoch
    fn last_access(&self, key: &ContentHash) -> Result<Option<i64>>;

    /// Remove a key. Returns whether it existed.
    fn delete(&self, key: &ContentHash) -> Result<bool>;

    /// Up to `limit` keys strictly after `cursor`, in ascending byte order
    fn keys_after(&self, cursor: Option<&ContentHash>, limit: usize) -> Result<Vec<ContentHash>>;

    /// Bytes in use on the medium, including its own overhead
    fn used_bytes(&self) -> Result<u64>;

    /// Configured maximum allocation (0 = unlimited)
    fn max_allocation(&self) -> u64;

    /// Flush any pending writes
    fn flush(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_math() {
        let capacity = ShardCapacity::new(1000, 250);
        assert_eq!(capacity.available, 750);
        assert_eq!(capacity.usage_percent(), 25.0);
        assert!(!capacity.is_full());

        let over = ShardCapacity::new(100, 150);
        assert_eq!(over.available, 0);
        assert!(over.is_full());

        let unlimited = ShardCapacity::new(0, 150);
        assert_eq!(unlimited.available, u64::MAX);
        assert!(!unlimited.is_full());
    }
}
