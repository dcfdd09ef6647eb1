//! Async shard store
//!
//! `ShardStorage` stores [`StorageItem`]s on any [`ShardBackend`]. Backend
//! calls run on the blocking thread pool so callers only ever await.

use crate::backend::{ShardBackend, ShardCapacity};
use crate::item::StorageItem;
use crate::memory::MemoryBackend;
use crate::rocks::RocksDbBackend;
use crate::StorageConfig;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use shardlease_core::error::{Result, ShardLeaseError};
use shardlease_core::ContentHash;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::error;

/// Keys fetched per backend round trip by [`ShardStorage::keys`]
const KEY_PAGE_SIZE: usize = 256;

#[derive(Clone)]
pub struct ShardStorage {
    backend: Arc<dyn ShardBackend>,
}

impl ShardStorage {
    pub fn new(backend: Arc<dyn ShardBackend>) -> Self {
        Self { backend }
    }

    /// In-memory store limited to `max_allocation` bytes (0 = unlimited)
    pub fn memory(max_allocation: u64) -> Self {
        Self::new(Arc::new(MemoryBackend::with_allocation(max_allocation)))
    }

    /// RocksDB store for `config`; call [`ShardStorage::open`] before use
    pub fn rocksdb(config: StorageConfig) -> Self {
        Self::new(Arc::new(RocksDbBackend::new(config)))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ShardBackend) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let result = tokio::task::spawn_blocking(move || f(backend.as_ref()))
            .await
            .map_err(|e| ShardLeaseError::Internal(format!("storage task failed: {e}")))?;
        if let Err(e) = &result {
            if matches!(e, ShardLeaseError::StorageUnavailable(_)) {
                error!(error = %e, "Shard store failure");
            }
        }
        result
    }

    pub async fn open(&self) -> Result<()> {
        self.blocking(|backend| backend.open()).await
    }

    pub async fn close(&self) -> Result<()> {
        self.blocking(|backend| backend.close()).await
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_open()
    }

    /// Create or overwrite the item stored under `hash`
    pub async fn put(&self, hash: ContentHash, item: &StorageItem) -> Result<()> {
        let encoded = Bytes::from(item.encode()?);
        self.blocking(move |backend| backend.put(&hash, encoded)).await
    }

    /// Load an item, refreshing its access time
    pub async fn get(&self, hash: ContentHash) -> Result<Option<StorageItem>> {
        let bytes = self.blocking(move |backend| backend.get(&hash)).await?;
        bytes.map(|bytes| StorageItem::decode(&bytes)).transpose()
    }

    /// Load an item without refreshing its access time
    pub async fn peek(&self, hash: ContentHash) -> Result<Option<StorageItem>> {
        let bytes = self.blocking(move |backend| backend.peek(&hash)).await?;
        bytes.map(|bytes| StorageItem::decode(&bytes)).transpose()
    }

    pub async fn last_access(&self, hash: ContentHash) -> Result<Option<i64>> {
        self.blocking(move |backend| backend.last_access(&hash)).await
    }

    /// Remove an item. Deleting a missing item succeeds with `false`.
    pub async fn delete(&self, hash: ContentHash) -> Result<bool> {
        self.blocking(move |backend| backend.delete(&hash)).await
    }

    /// Lazily page through every stored hash in key order.
    ///
    /// Each call starts a fresh pass. An error ends the stream.
    pub fn keys(&self) -> BoxStream<'static, Result<ContentHash>> {
        struct Cursor {
            backend: Arc<dyn ShardBackend>,
            after: Option<ContentHash>,
            page: VecDeque<ContentHash>,
            done: bool,
        }

        let cursor = Cursor {
            backend: Arc::clone(&self.backend),
            after: None,
            page: VecDeque::new(),
            done: false,
        };

        stream::unfold(cursor, |mut cursor| async move {
            loop {
                if let Some(key) = cursor.page.pop_front() {
                    cursor.after = Some(key);
                    return Some((Ok(key), cursor));
                }
                if cursor.done {
                    return None;
                }

                let backend = Arc::clone(&cursor.backend);
                let after = cursor.after;
                let page = tokio::task::spawn_blocking(move || {
                    backend.keys_after(after.as_ref(), KEY_PAGE_SIZE)
                })
                .await
                .map_err(|e| ShardLeaseError::Internal(format!("storage task failed: {e}")))
                .and_then(|page| page);

                match page {
                    Ok(keys) => {
                        cursor.done = keys.len() < KEY_PAGE_SIZE;
                        cursor.page = keys.into();
                    }
                    Err(e) => {
                        cursor.done = true;
                        return Some((Err(e), cursor));
                    }
                }
            }
        })
        .boxed()
    }

    /// Allocated, used and available bytes as measured on the medium
    pub async fn size(&self) -> Result<ShardCapacity> {
        self.blocking(|backend| {
            Ok(ShardCapacity::new(
                backend.max_allocation(),
                backend.used_bytes()?,
            ))
        })
        .await
    }

    pub async fn flush(&self) -> Result<()> {
        self.blocking(|backend| backend.flush()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn item(data: &[u8]) -> StorageItem {
        let hash = ContentHash::compute(data);
        let mut item = StorageItem::new(hash);
        item.shard = Some(data.to_vec());
        item
    }

    #[tokio::test]
    async fn test_put_get_peek() {
        let storage = ShardStorage::memory(0);
        let stored = item(b"shard");
        storage.put(stored.hash, &stored).await.unwrap();

        assert_eq!(storage.peek(stored.hash).await.unwrap(), Some(stored.clone()));
        assert_eq!(storage.last_access(stored.hash).await.unwrap(), None);

        assert_eq!(storage.get(stored.hash).await.unwrap(), Some(stored.clone()));
        assert!(storage.last_access(stored.hash).await.unwrap().is_some());

        assert!(storage.delete(stored.hash).await.unwrap());
        assert!(!storage.delete(stored.hash).await.unwrap());
        assert_eq!(storage.get(stored.hash).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_stream_is_restartable() {
        let storage = ShardStorage::memory(0);
        let count = KEY_PAGE_SIZE + 10;
        for i in 0..count as u32 {
            let stored = item(&i.to_le_bytes());
            storage.put(stored.hash, &stored).await.unwrap();
        }

        let first: Vec<ContentHash> = storage.keys().try_collect().await.unwrap();
        assert_eq!(first.len(), count);
        let second: Vec<ContentHash> = storage.keys().try_collect().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_capacity_exceeded_leaves_prior_contents() {
        let storage = ShardStorage::memory(600);
        let first = item(&[1u8; 200]);
        storage.put(first.hash, &first).await.unwrap();

        let big = item(&[2u8; 500]);
        let err = storage.put(big.hash, &big).await.unwrap_err();
        assert!(matches!(err, ShardLeaseError::CapacityExceeded { .. }));

        assert_eq!(storage.peek(first.hash).await.unwrap(), Some(first));
        assert_eq!(storage.peek(big.hash).await.unwrap(), None);

        let size = storage.size().await.unwrap();
        assert_eq!(size.allocated, 600);
        assert_eq!(size.available, 600 - size.used);
    }

    #[tokio::test]
    async fn test_open_close_idempotent() {
        let storage = ShardStorage::memory(0);
        storage.open().await.unwrap();
        storage.open().await.unwrap();
        storage.close().await.unwrap();
        storage.close().await.unwrap();
        assert!(!storage.is_open());

        let err = storage.size().await.unwrap_err();
        assert!(matches!(err, ShardLeaseError::StorageUnavailable(_)));
        let keys: Vec<Result<ContentHash>> = storage.keys().collect().await;
        assert_eq!(keys.len(), 1);
        assert!(keys[0].is_err());
    }

    #[tokio::test]
    async fn test_rocksdb_store() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ShardStorage::rocksdb(StorageConfig::new(dir.path()).with_max_allocation(1 << 20));
        assert!(storage.put(ContentHash::compute(b"x"), &item(b"x")).await.is_err());

        storage.open().await.unwrap();
        let stored = item(b"rocks");
        storage.put(stored.hash, &stored).await.unwrap();
        assert_eq!(storage.get(stored.hash).await.unwrap(), Some(stored.clone()));

        let keys: Vec<ContentHash> = storage.keys().try_collect().await.unwrap();
        assert_eq!(keys, vec![stored.hash]);

        let size = storage.size().await.unwrap();
        assert_eq!(size.allocated, 1 << 20);
        assert!(size.used > 0);
        storage.flush().await.unwrap();
        storage.close().await.unwrap();
    }
}
