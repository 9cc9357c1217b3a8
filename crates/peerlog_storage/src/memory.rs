//! In-memory storage backend.

use crate::backend::{copy_from, IteratorOptions, Storage, StorageStream};
use crate::error::StorageResult;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory storage backend.
///
/// This backend keeps every pair in an ordered map and is suitable for:
/// - Unit tests
/// - Integration tests
/// - A shared "network" tier that several in-process peers read from
///
/// Iteration follows key order (`reverse` flips it).
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across tasks.
///
/// # Example
///
/// ```rust
/// use peerlog_storage::{MemoryStorage, Storage};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let storage = MemoryStorage::new();
/// storage.put("k", vec![1, 2, 3]).await.unwrap();
/// assert_eq!(storage.len(), 1);
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Creates a new empty in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a storage pre-populated with `pairs`.
    ///
    /// Useful for testing reconciliation scenarios.
    #[must_use]
    pub fn with_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Vec<u8>)>,
        K: Into<String>,
    {
        Self {
            data: RwLock::new(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }

    /// Returns the number of stored pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Returns the stored keys in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn del(&self, key: &str) -> StorageResult<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn iterator(&self, options: IteratorOptions) -> StorageStream<'_> {
        // Snapshot so no lock is held while the consumer awaits.
        let snapshot: Vec<_> = self
            .data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        stream::iter(options.apply(snapshot).into_iter().map(Ok)).boxed()
    }

    async fn merge(&self, other: &dyn Storage) -> StorageResult<()> {
        copy_from(self, other).await
    }

    async fn clear(&self) -> StorageResult<()> {
        self.data.write().clear();
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        // Nothing to release
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(storage: &dyn Storage, options: IteratorOptions) -> Vec<String> {
        storage
            .iterator(options)
            .map(|pair| pair.unwrap().0)
            .collect()
            .await
    }

    #[tokio::test]
    async fn memory_new_is_empty() {
        let storage = MemoryStorage::new();
        assert!(storage.is_empty());
        assert_eq!(storage.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_put_get_overwrite() {
        let storage = MemoryStorage::new();
        storage.put("a", b"one".to_vec()).await.unwrap();
        storage.put("a", b"two".to_vec()).await.unwrap();

        assert_eq!(storage.get("a").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn memory_empty_value_is_present() {
        let storage = MemoryStorage::new();
        storage.put("empty", Vec::new()).await.unwrap();
        assert_eq!(storage.get("empty").await.unwrap(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn memory_del_removes_key() {
        let storage = MemoryStorage::new();
        storage.put("a", vec![1]).await.unwrap();
        storage.del("a").await.unwrap();
        storage.del("never-written").await.unwrap();

        assert_eq!(storage.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_iterator_order_and_options() {
        let storage = MemoryStorage::with_pairs([("b", vec![2]), ("a", vec![1]), ("c", vec![3])]);

        assert_eq!(collect(&storage, IteratorOptions::new()).await, ["a", "b", "c"]);
        assert_eq!(
            collect(&storage, IteratorOptions::new().reverse(true).amount(2)).await,
            ["c", "b"]
        );
    }

    #[tokio::test]
    async fn memory_merge_copies_pairs() {
        let left = MemoryStorage::with_pairs([("a", vec![1])]);
        let right = MemoryStorage::with_pairs([("b", vec![2])]);

        left.merge(&right).await.unwrap();

        assert_eq!(left.keys(), ["a", "b"]);
        assert_eq!(right.keys(), ["b"]);
    }

    #[tokio::test]
    async fn memory_clear() {
        let storage = MemoryStorage::with_pairs([("a", vec![1]), ("b", vec![2])]);
        storage.clear().await.unwrap();
        assert!(storage.is_empty());
        assert!(storage.close().await.is_ok());
    }
}
