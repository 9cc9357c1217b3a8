//! Storage capability trait definition.

use crate::error::StorageResult;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// A lazy, fallible stream of `(key, value)` pairs produced by
/// [`Storage::iterator`].
pub type StorageStream<'a> = BoxStream<'a, StorageResult<(String, Vec<u8>)>>;

/// Options for [`Storage::iterator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IteratorOptions {
    /// Maximum number of pairs to yield. `None` yields everything.
    pub amount: Option<usize>,
    /// Iterate in reverse of the store's natural order.
    pub reverse: bool,
}

impl IteratorOptions {
    /// Creates options that yield every pair in natural order.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the number of yielded pairs.
    #[must_use]
    pub const fn amount(mut self, amount: usize) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Sets reverse iteration.
    #[must_use]
    pub const fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    /// Applies `amount` and `reverse` to an already materialized snapshot.
    pub(crate) fn apply(&self, mut pairs: Vec<(String, Vec<u8>)>) -> Vec<(String, Vec<u8>)> {
        if self.reverse {
            pairs.reverse();
        }
        if let Some(amount) = self.amount {
            pairs.truncate(amount);
        }
        pairs
    }
}

/// The storage capability shared by every backend in peerlog.
///
/// Storages are **opaque key/value byte stores**. The log keeps entries,
/// heads and its membership index in separate storages, and the composed
/// storage layers two of them behind this same interface.
///
/// # Invariants
///
/// - `get` returns `Ok(None)` for a key that was never written or was deleted
/// - `iterator` starts from scratch on every call
/// - `merge(other)` copies every pair of `other` into `self`
/// - Implementations must be `Send + Sync`
///
/// # Implementors
///
/// - [`super::MemoryStorage`] - For testing
/// - [`super::LruStorage`] - Bounded cache tier
/// - [`super::FileStorage`] - For persistent storage
/// - [`super::ComposedStorage`] - Two tiers combined
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot record the value.
    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Deletes `key`. Deleting an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion cannot be recorded.
    async fn del(&self, key: &str) -> StorageResult<()>;

    /// Returns a lazy stream over the stored pairs.
    fn iterator(&self, options: IteratorOptions) -> StorageStream<'_>;

    /// Copies every pair of `other` into this storage.
    ///
    /// # Errors
    ///
    /// Returns an error if `other` cannot be iterated or a write fails.
    async fn merge(&self, other: &dyn Storage) -> StorageResult<()>;

    /// Removes every pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be cleared.
    async fn clear(&self) -> StorageResult<()>;

    /// Flushes and releases the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if pending writes cannot be made durable.
    async fn close(&self) -> StorageResult<()>;
}

/// Copies every pair yielded by `other` into `target`.
///
/// Shared implementation of [`Storage::merge`] for leaf backends.
pub(crate) async fn copy_from(target: &dyn Storage, other: &dyn Storage) -> StorageResult<()> {
    use futures_util::StreamExt;

    let mut pairs = other.iterator(IteratorOptions::default());
    while let Some(pair) = pairs.next().await {
        let (key, value) = pair?;
        target.put(&key, value).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(keys: &[&str]) -> Vec<(String, Vec<u8>)> {
        keys.iter().map(|k| (k.to_string(), k.as_bytes().to_vec())).collect()
    }

    #[test]
    fn options_default_yields_all() {
        let applied = IteratorOptions::new().apply(pairs(&["a", "b", "c"]));
        assert_eq!(applied, pairs(&["a", "b", "c"]));
    }

    #[test]
    fn options_reverse_then_amount() {
        let applied = IteratorOptions::new()
            .reverse(true)
            .amount(2)
            .apply(pairs(&["a", "b", "c"]));
        assert_eq!(applied, pairs(&["c", "b"]));
    }

    #[test]
    fn options_amount_larger_than_len() {
        let applied = IteratorOptions::new().amount(10).apply(pairs(&["a"]));
        assert_eq!(applied.len(), 1);
    }
}
