//! Bounded least-recently-used cache tier.

use crate::backend::{copy_from, IteratorOptions, Storage, StorageStream};
use crate::error::StorageResult;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Default number of pairs an [`LruStorage`] keeps before evicting.
pub const DEFAULT_LRU_CAPACITY: usize = 1_000_000;

/// A bounded in-memory storage that evicts the least recently used pair once
/// `capacity` is reached.
///
/// Intended as the fast `primary` tier of a
/// [`ComposedStorage`](crate::ComposedStorage): an evicted pair is simply
/// read again from the secondary tier and promoted back.
///
/// Iteration yields most recently used pairs first.
pub struct LruStorage {
    cache: Mutex<LruCache<String, Vec<u8>>>,
}

impl LruStorage {
    /// Creates an LRU storage with [`DEFAULT_LRU_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LRU_CAPACITY)
    }

    /// Creates an LRU storage holding at most `capacity` pairs.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the number of cached pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Returns the configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cache.lock().cap().get()
    }
}

impl Default for LruStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LruStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruStorage")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[async_trait]
impl Storage for LruStorage {
    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.cache.lock().put(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.cache.lock().get(key).cloned())
    }

    async fn del(&self, key: &str) -> StorageResult<()> {
        self.cache.lock().pop(key);
        Ok(())
    }

    fn iterator(&self, options: IteratorOptions) -> StorageStream<'_> {
        let snapshot: Vec<_> = self
            .cache
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        stream::iter(options.apply(snapshot).into_iter().map(Ok)).boxed()
    }

    async fn merge(&self, other: &dyn Storage) -> StorageResult<()> {
        copy_from(self, other).await
    }

    async fn clear(&self) -> StorageResult<()> {
        self.cache.lock().clear();
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
