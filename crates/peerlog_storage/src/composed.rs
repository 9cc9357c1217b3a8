//! Two-tier storage combinator.

use crate::backend::{IteratorOptions, Storage, StorageStream};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Sending half of the channel on which suppressed tier failures are reported.
pub type StorageErrorSender = broadcast::Sender<Arc<StorageError>>;

/// Receiving half of the tier failure channel.
pub type StorageErrorReceiver = broadcast::Receiver<Arc<StorageError>>;

const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Which tier an operation touched, for log fields.
#[derive(Debug, Clone, Copy)]
enum Tier {
    Primary,
    Secondary,
}

impl Tier {
    fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

/// Combines a fast `primary` tier and an authoritative `secondary` tier
/// behind the [`Storage`] interface.
///
/// | Operation | Behavior | Errors |
/// |-----------|----------|--------|
/// | `put` | primary, then secondary | logged and broadcast, `Ok(())` |
/// | `get` | primary, then secondary; a secondary hit is copied into primary | logged and broadcast, `Ok(None)` |
/// | `del`, `clear`, `close` | both tiers | propagated |
/// | `iterator` | primary, then secondary, keys deduplicated | propagated in-stream |
/// | `merge` | both tiers absorb `other`, then `other` absorbs both tiers | propagated |
///
/// `amount` in [`IteratorOptions`] bounds each tier separately, so a composed
/// iterator may yield up to twice that many pairs.
///
/// Since both tiers are `Arc<dyn Storage>`, a `ComposedStorage` can itself be
/// a tier of another one.
///
/// # Example
///
/// ```rust
/// use peerlog_storage::{ComposedStorage, LruStorage, MemoryStorage, Storage};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let network = Arc::new(MemoryStorage::new());
/// let storage = ComposedStorage::new(Arc::new(LruStorage::with_capacity(16)), network.clone());
///
/// storage.put("hash", b"entry".to_vec()).await.unwrap();
/// assert_eq!(network.get("hash").await.unwrap(), Some(b"entry".to_vec()));
/// # }
/// ```
pub struct ComposedStorage {
    primary: Arc<dyn Storage>,
    secondary: Arc<dyn Storage>,
    errors: StorageErrorSender,
}

impl ComposedStorage {
    /// Creates a composed storage with its own error channel.
    #[must_use]
    pub fn new(primary: Arc<dyn Storage>, secondary: Arc<dyn Storage>) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            primary,
            secondary,
            errors,
        }
    }

    /// Reports suppressed failures on `sender` instead of a private channel.
    ///
    /// Lets several storages (or a database) share one error stream.
    #[must_use]
    pub fn with_error_channel(mut self, sender: StorageErrorSender) -> Self {
        self.errors = sender;
        self
    }

    /// Subscribes to suppressed `put`/`get` failures.
    #[must_use]
    pub fn subscribe_errors(&self) -> StorageErrorReceiver {
        self.errors.subscribe()
    }

    /// Returns the fast tier.
    #[must_use]
    pub fn primary(&self) -> &Arc<dyn Storage> {
        &self.primary
    }

    /// Returns the authoritative tier.
    #[must_use]
    pub fn secondary(&self) -> &Arc<dyn Storage> {
        &self.secondary
    }

    fn report(&self, tier: Tier, op: &'static str, key: &str, error: StorageError) {
        tracing::warn!(tier = tier.as_str(), op, key, error = %error, "storage tier failed");
        // No receivers is not a failure.
        let _ = self.errors.send(Arc::new(error));
    }
}

impl std::fmt::Debug for ComposedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComposedStorage")
            .field("error_receivers", &self.errors.receiver_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Storage for ComposedStorage {
    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        if let Err(e) = self.primary.put(key, value.clone()).await {
            self.report(Tier::Primary, "put", key, e);
        }
        if let Err(e) = self.secondary.put(key, value).await {
            self.report(Tier::Secondary, "put", key, e);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        match self.primary.get(key).await {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => {}
            Err(e) => self.report(Tier::Primary, "get", key, e),
        }

        let value = match self.secondary.get(key).await {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.report(Tier::Secondary, "get", key, e);
                return Ok(None);
            }
        };

        if let Err(e) = self.primary.put(key, value.clone()).await {
            self.report(Tier::Primary, "promote", key, e);
        }
        Ok(Some(value))
    }

    async fn del(&self, key: &str) -> StorageResult<()> {
        self.primary.del(key).await?;
        self.secondary.del(key).await
    }

    fn iterator(&self, options: IteratorOptions) -> StorageStream<'_> {
        let mut seen = HashSet::new();
        self.primary
            .iterator(options)
            .chain(self.secondary.iterator(options))
            .filter(move |pair| {
                let keep = match pair {
                    Ok((key, _)) => seen.insert(key.clone()),
                    Err(_) => true,
                };
                future::ready(keep)
            })
            .boxed()
    }

    async fn merge(&self, other: &dyn Storage) -> StorageResult<()> {
        self.primary.merge(other).await?;
        self.secondary.merge(other).await?;
        other.merge(self.primary.as_ref()).await?;
        other.merge(self.secondary.as_ref()).await
    }

    async fn clear(&self) -> StorageResult<()> {
        self.primary.clear().await?;
        self.secondary.clear().await
    }

    async fn close(&self) -> StorageResult<()> {
        self.primary.close().await?;
        self.secondary.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LruStorage, MemoryStorage};
    use proptest::prelude::*;

    /// A tier whose every operation fails.
    struct FailingStorage;

    #[async_trait]
    impl Storage for FailingStorage {
        async fn put(&self, _key: &str, _value: Vec<u8>) -> StorageResult<()> {
            Err(StorageError::backend("put refused"))
        }

        async fn get(&self, _key: &str) -> StorageResult<Option<Vec<u8>>> {
            Err(StorageError::backend("get refused"))
        }

        async fn del(&self, _key: &str) -> StorageResult<()> {
            Err(StorageError::backend("del refused"))
        }

        fn iterator(&self, _options: IteratorOptions) -> StorageStream<'_> {
            futures_util::stream::iter(vec![Err(StorageError::backend("iterator refused"))])
                .boxed()
        }

        async fn merge(&self, _other: &dyn Storage) -> StorageResult<()> {
            Err(StorageError::backend("merge refused"))
        }

        async fn clear(&self) -> StorageResult<()> {
            Err(StorageError::backend("clear refused"))
        }

        async fn close(&self) -> StorageResult<()> {
            Ok(())
        }
    }

    fn memory_pair() -> (Arc<MemoryStorage>, Arc<MemoryStorage>, ComposedStorage) {
        let primary = Arc::new(MemoryStorage::new());
        let secondary = Arc::new(MemoryStorage::new());
        let composed = ComposedStorage::new(primary.clone(), secondary.clone());
        (primary, secondary, composed)
    }

    async fn keys(storage: &dyn Storage) -> Vec<String> {
        storage
            .iterator(IteratorOptions::new())
            .map(|pair| pair.unwrap().0)
            .collect()
            .await
    }

    #[tokio::test]
    async fn put_writes_both_tiers() {
        let (primary, secondary, composed) = memory_pair();
        composed.put("a", vec![1]).await.unwrap();

        assert_eq!(primary.get("a").await.unwrap(), Some(vec![1]));
        assert_eq!(secondary.get("a").await.unwrap(), Some(vec![1]));
    }

    #[tokio::test]
    async fn get_promotes_secondary_hit() {
        let (primary, secondary, composed) = memory_pair();
        secondary.put("a", vec![7]).await.unwrap();

        assert_eq!(composed.get("a").await.unwrap(), Some(vec![7]));
        assert_eq!(primary.get("a").await.unwrap(), Some(vec![7]));
    }

    #[tokio::test]
    async fn get_absent_key_is_none() {
        let (_, _, composed) = memory_pair();
        assert_eq!(composed.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_survives_failing_tier() {
        let secondary = Arc::new(MemoryStorage::new());
        let composed = ComposedStorage::new(Arc::new(FailingStorage), secondary.clone());
        let mut errors = composed.subscribe_errors();

        composed.put("a", vec![1]).await.unwrap();

        assert_eq!(composed.get("a").await.unwrap(), Some(vec![1]));
        let error = errors.recv().await.unwrap();
        assert!(matches!(*error, StorageError::Backend(_)));
    }

    #[tokio::test]
    async fn get_failure_resolves_to_none() {
        let composed = ComposedStorage::new(Arc::new(FailingStorage), Arc::new(FailingStorage));
        let mut errors = composed.subscribe_errors();

        assert_eq!(composed.get("a").await.unwrap(), None);
        assert!(errors.recv().await.is_ok());
        assert!(errors.recv().await.is_ok());
    }

    #[tokio::test]
    async fn del_and_clear_propagate_failures() {
        let composed = ComposedStorage::new(Arc::new(MemoryStorage::new()), Arc::new(FailingStorage));

        assert!(matches!(composed.del("a").await, Err(StorageError::Backend(_))));
        assert!(matches!(composed.clear().await, Err(StorageError::Backend(_))));
    }

    #[tokio::test]
    async fn del_removes_from_both_tiers() {
        let (primary, secondary, composed) = memory_pair();
        composed.put("a", vec![1]).await.unwrap();
        composed.del("a").await.unwrap();

        assert!(primary.is_empty());
        assert!(secondary.is_empty());
    }

    #[tokio::test]
    async fn iterator_deduplicates_keys() {
        let (primary, secondary, composed) = memory_pair();
        primary.put("a", vec![1]).await.unwrap();
        primary.put("b", vec![2]).await.unwrap();
        secondary.put("b", vec![2]).await.unwrap();
        secondary.put("c", vec![3]).await.unwrap();

        assert_eq!(keys(&composed).await, ["a", "b", "c"]);
        // Restartable
        assert_eq!(keys(&composed).await, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn iterator_amount_bounds_each_tier() {
        let (primary, secondary, composed) = memory_pair();
        primary.put("a", vec![1]).await.unwrap();
        primary.put("b", vec![2]).await.unwrap();
        secondary.put("c", vec![3]).await.unwrap();
        secondary.put("d", vec![4]).await.unwrap();

        let yielded: Vec<String> = composed
            .iterator(IteratorOptions::new().amount(1))
            .map(|pair| pair.unwrap().0)
            .collect()
            .await;
        assert_eq!(yielded, ["a", "c"]);
    }

    #[tokio::test]
    async fn merge_is_bidirectional() {
        let (_, _, left) = memory_pair();
        let (_, _, right) = memory_pair();
        left.put("a", vec![1]).await.unwrap();
        right.put("b", vec![2]).await.unwrap();

        left.merge(&right).await.unwrap();
        right.merge(&left).await.unwrap();

        assert_eq!(keys(&left).await, ["a", "b"]);
        assert_eq!(keys(&right).await, ["a", "b"]);
    }

    #[tokio::test]
    async fn merge_with_leaf_storage_fills_both_sides() {
        let (primary, secondary, composed) = memory_pair();
        primary.put("p", vec![1]).await.unwrap();
        secondary.put("s", vec![2]).await.unwrap();
        let other = MemoryStorage::with_pairs([("o", vec![3])]);

        composed.merge(&other).await.unwrap();

        assert_eq!(other.keys(), ["o", "p", "s"]);
        assert_eq!(primary.keys(), ["o", "p"]);
        assert_eq!(secondary.keys(), ["o", "s"]);
    }

    #[tokio::test]
    async fn composed_storages_nest() {
        let network = Arc::new(MemoryStorage::new());
        let inner = Arc::new(ComposedStorage::new(
            Arc::new(LruStorage::with_capacity(4)),
            Arc::new(MemoryStorage::new()),
        ));
        let outer = ComposedStorage::new(inner.clone(), network.clone());

        outer.put("a", vec![1]).await.unwrap();

        assert_eq!(inner.get("a").await.unwrap(), Some(vec![1]));
        assert_eq!(network.get("a").await.unwrap(), Some(vec![1]));
        assert_eq!(keys(&outer).await, ["a"]);
    }

    #[tokio::test]
    async fn shared_error_channel() {
        let (sender, mut receiver) = broadcast::channel(8);
        let composed = ComposedStorage::new(Arc::new(FailingStorage), Arc::new(MemoryStorage::new()))
            .with_error_channel(sender);

        composed.put("a", vec![1]).await.unwrap();
        assert!(receiver.recv().await.is_ok());
    }

    proptest! {
        #[test]
        fn iteration_yields_each_key_once(
            left in proptest::collection::btree_set("[a-f]{1,3}", 0..20),
            right in proptest::collection::btree_set("[a-f]{1,3}", 0..20),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let yielded = runtime.block_on(async {
                let (primary, secondary, composed) = memory_pair();
                for key in &left {
                    primary.put(key, vec![0]).await.unwrap();
                }
                for key in &right {
                    secondary.put(key, vec![1]).await.unwrap();
                }
                keys(&composed).await
            });

            let unique: HashSet<&String> = yielded.iter().collect();
            prop_assert_eq!(unique.len(), yielded.len());
            prop_assert_eq!(yielded.len(), left.union(&right).count());
        }
    }
}
