//! Database: a replicated log bound to an address.
//!
//! # Example
//!
//! ```rust
//! use peerlog_core::{Database, DatabaseOptions, Identities, LoopbackNetwork, Operation, Value};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), peerlog_core::CoreError> {
//! let identities = Arc::new(Identities::new());
//! let identity = identities.create_identity("userA").await?;
//! let network = LoopbackNetwork::new();
//!
//! let db = Database::open(DatabaseOptions::new(
//!     "notes",
//!     identity,
//!     identities,
//!     Arc::new(network.peer()),
//! ))
//! .await?;
//!
//! let hash = db.add(Operation::add(Value::Text("hello".into()))).await?;
//! assert!(db.get(&hash).await?.is_some());
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::abortable::FetchOptions;
use crate::access::{AccessController, WriteAccess};
use crate::config::{DatabaseConfig, QueryOptions};
use crate::error::{CoreError, CoreResult};
use crate::feed::{DatabaseEvent, EventFeed, Subscription};
use crate::identity::{Identities, Identity};
use crate::log::{Entry, Log, LogStorage, MergeReport, Operation};
use crate::sync::{PubSub, SyncApplier, SyncEngine};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use peerlog_storage::Storage;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything needed to open a [`Database`].
pub struct DatabaseOptions {
    /// Address; also the log id and the pubsub topic.
    pub address: String,
    /// Identity that signs local appends.
    pub identity: Identity,
    /// Shared identity registry.
    pub identities: Arc<Identities>,
    /// Write policy. Defaults to the database's own identity only.
    pub access: Arc<dyn AccessController>,
    /// Log storages. Defaults to in-memory storages.
    pub storage: LogStorage,
    /// Pubsub transport.
    pub pubsub: Arc<dyn PubSub>,
    /// Tunables.
    pub config: DatabaseConfig,
}

impl DatabaseOptions {
    /// Creates options with default access, storage and configuration.
    pub fn new(
        address: impl Into<String>,
        identity: Identity,
        identities: Arc<Identities>,
        pubsub: Arc<dyn PubSub>,
    ) -> Self {
        let access = Arc::new(WriteAccess::new([identity.id.clone()]));
        Self {
            address: address.into(),
            identity,
            identities,
            access,
            storage: LogStorage::memory(),
            pubsub,
            config: DatabaseConfig::default(),
        }
    }

    /// Sets the write policy.
    #[must_use]
    pub fn with_access(mut self, access: Arc<dyn AccessController>) -> Self {
        self.access = access;
        self
    }

    /// Sets the log storages.
    #[must_use]
    pub fn with_storage(mut self, storage: LogStorage) -> Self {
        self.storage = storage;
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: DatabaseConfig) -> Self {
        self.config = config;
        self
    }
}

struct DatabaseInner {
    address: String,
    log: Log,
    feed: EventFeed,
    /// Where missing entries are fetched from.
    source: Arc<dyn Storage>,
    config: DatabaseConfig,
    cancel: CancellationToken,
    is_open: RwLock<bool>,
}

impl DatabaseInner {
    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }

    async fn merge_heads(&self, heads: &[String]) -> CoreResult<MergeReport> {
        self.ensure_open()?;

        let options = FetchOptions::new(self.cancel.clone(), self.config.fetch_timeout);
        let report = self.log.merge(heads, self.source.as_ref(), &options).await?;

        for entry in &report.absorbed {
            self.feed.emit(DatabaseEvent::Update(entry.clone()));
            self.feed.emit(DatabaseEvent::Sync(entry.clone()));
        }
        for (_, error) in &report.rejected {
            self.feed.emit(DatabaseEvent::Error(error.clone()));
        }
        Ok(report)
    }
}

#[async_trait]
impl SyncApplier for DatabaseInner {
    fn local_heads(&self) -> Vec<String> {
        self.log.head_hashes()
    }

    async fn apply_remote_heads(&self, heads: Vec<String>) -> CoreResult<MergeReport> {
        self.merge_heads(&heads).await
    }

    fn report_error(&self, error: CoreError) {
        self.feed.emit(DatabaseEvent::error(error));
    }
}

/// A replicated, access controlled log.
///
/// | Operation | Effect |
/// |-----------|--------|
/// | [`add`](Self::add) | append, emit `Update`, announce heads |
/// | remote heads | merge, emit `Update` then `Sync` per absorbed entry |
/// | failures without a caller | emitted as `Error` |
pub struct Database {
    inner: Arc<DatabaseInner>,
    sync: SyncEngine,
}

impl Database {
    /// Opens the database: loads persisted heads and joins the address topic.
    pub async fn open(options: DatabaseOptions) -> CoreResult<Self> {
        let DatabaseOptions {
            address,
            identity,
            identities,
            access,
            storage,
            pubsub,
            config,
        } = options;

        let source = storage.entries.clone();
        let log = Log::open(address.clone(), identity, identities, access, storage).await?;
        let cancel = CancellationToken::new();

        let inner = Arc::new(DatabaseInner {
            address: address.clone(),
            log,
            feed: EventFeed::new(),
            source,
            config,
            cancel: cancel.clone(),
            is_open: RwLock::new(true),
        });

        let sync = SyncEngine::new(
            address.clone(),
            pubsub,
            inner.clone(),
            cancel.child_token(),
            inner.config.announce_on_join,
        );
        sync.start().await?;

        tracing::info!(address = %address, identity = %inner.log.identity().id, "opened database");
        Ok(Self { inner, sync })
    }

    /// Address.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Identity that signs local appends.
    pub fn identity(&self) -> &Identity {
        self.inner.log.identity()
    }

    /// The underlying log.
    pub fn log(&self) -> &Log {
        &self.inner.log
    }

    /// The sync engine (state and statistics).
    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync
    }

    /// Configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Returns true until [`close`](Self::close) is called.
    pub fn is_open(&self) -> bool {
        *self.inner.is_open.read()
    }

    /// Subscribes to database events.
    pub fn events(&self) -> Subscription {
        self.inner.feed.subscribe()
    }

    /// Appends `payload` and returns the new entry's hash.
    ///
    /// Announcement failures are emitted as `Error` events, not returned.
    pub async fn add(&self, payload: Operation) -> CoreResult<String> {
        self.inner.ensure_open()?;

        let entry = self.inner.log.append(payload).await?;
        let hash = entry.hash().to_string();
        self.inner.feed.emit(DatabaseEvent::Update(entry));

        if self.inner.config.announce_on_append {
            if let Err(e) = self.sync.announce().await {
                tracing::warn!(address = %self.inner.address, error = %e, "heads announcement failed");
                self.inner.feed.emit(DatabaseEvent::error(e));
            }
        }
        Ok(hash)
    }

    /// Loads entry `hash`.
    pub async fn get(&self, hash: &str) -> CoreResult<Option<Entry>> {
        self.inner.ensure_open()?;
        self.inner.log.get(hash).await
    }

    /// Current heads, newest first.
    pub fn heads(&self) -> Vec<Entry> {
        self.inner.log.heads()
    }

    /// Streams entries newest first.
    pub fn iterator(&self, options: QueryOptions) -> BoxStream<'_, CoreResult<Entry>> {
        if let Err(e) = self.inner.ensure_open() {
            return stream::once(async move { Err(e) }).boxed();
        }

        let entries = self.inner.log.traverse();
        match options.amount {
            Some(amount) => entries.take(amount).boxed(),
            None => entries,
        }
    }

    /// Collects every entry, newest first.
    pub async fn all(&self) -> CoreResult<Vec<Entry>> {
        let mut entries = self.iterator(QueryOptions::new());
        let mut all = Vec::new();
        while let Some(entry) = entries.next().await {
            all.push(entry?);
        }
        Ok(all)
    }

    /// Merges the history behind `heads` right away, emitting the same
    /// events as a merge triggered by a peer.
    ///
    /// Errors are returned rather than emitted.
    pub async fn sync_heads(&self, heads: &[String]) -> CoreResult<MergeReport> {
        self.inner.merge_heads(heads).await
    }

    /// Stops sync (cancelling in-flight fetches), leaves the topic and
    /// closes the storages. Closing twice is a no-op.
    pub async fn close(&self) -> CoreResult<()> {
        {
            let mut is_open = self.inner.is_open.write();
            if !*is_open {
                return Ok(());
            }
            *is_open = false;
        }

        self.inner.cancel.cancel();
        self.sync.stop().await?;
        self.inner.log.close().await?;

        tracing::info!(address = %self.inner.address, "closed database");
        Ok(())
    }

    /// Deletes every persisted entry, head and index marker.
    pub async fn destroy(&self) -> CoreResult<()> {
        self.inner.ensure_open()?;
        self.inner.log.clear().await?;
        tracing::info!(address = %self.inner.address, "destroyed database");
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("address", &self.inner.address)
            .field("is_open", &self.is_open())
            .field("heads", &self.inner.log.head_hashes())
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Stops the sync task even when `close` was never awaited.
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::LoopbackNetwork;
    use ciborium::Value;
    use futures_util::TryStreamExt;

    async fn open_db(name: &str) -> Database {
        let identities = Arc::new(Identities::new());
        let identity = identities.create_identity(name).await.unwrap();
        Database::open(DatabaseOptions::new(
            "db-test",
            identity,
            identities,
            Arc::new(LoopbackNetwork::new().peer()),
        ))
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn add_emits_update() {
        let db = open_db("userA").await;
        let mut events = db.events();

        let hash = db.add(Operation::add(Value::Text("one".into()))).await.unwrap();

        match events.try_recv() {
            Some(DatabaseEvent::Update(entry)) => assert_eq!(entry.hash(), hash),
            other => panic!("expected update, got {other:?}"),
        }
        assert!(events.try_recv().is_none());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn iterator_is_newest_first_with_amount() {
        let db = open_db("userA").await;
        for i in 0..5 {
            db.add(Operation::add(Value::Integer(i.into()))).await.unwrap();
        }

        let newest: Vec<Entry> = db
            .iterator(QueryOptions::new().amount(2))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].payload().value, Value::Integer(4.into()));
        assert_eq!(newest[1].payload().value, Value::Integer(3.into()));

        let all = db.all().await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].hash(), newest[0].hash());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn closed_database_rejects_operations() {
        let db = open_db("userA").await;
        db.close().await.unwrap();
        assert!(!db.is_open());
        db.close().await.unwrap();

        assert!(matches!(
            db.add(Operation::add(Value::Null)).await,
            Err(CoreError::DatabaseClosed)
        ));
        assert!(matches!(db.get("x").await, Err(CoreError::DatabaseClosed)));
        assert!(matches!(db.all().await, Err(CoreError::DatabaseClosed)));
    }

    #[tokio::test]
    async fn destroy_clears_entries() {
        let db = open_db("userA").await;
        let hash = db.add(Operation::add(Value::Bool(true))).await.unwrap();

        db.destroy().await.unwrap();

        assert!(db.heads().is_empty());
        assert!(db.get(&hash).await.unwrap().is_none());
        assert!(db.all().await.unwrap().is_empty());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn default_access_is_own_identity() {
        let db = open_db("userA").await;
        let identities = Arc::new(Identities::new());
        let stranger = identities.create_identity("userB").await.unwrap();

        let entry = Entry::create(
            &identities,
            &stranger,
            "db-test",
            Operation::add(Value::Null),
            Vec::new(),
            crate::log::Clock::new(stranger.public_key.to_hex(), 1),
        )
        .await
        .unwrap();
        let source = peerlog_storage::MemoryStorage::with_pairs([(entry.hash().to_string(), entry.bytes().to_vec())]);
        db.inner.source.merge(&source).await.unwrap();

        let mut events = db.events();
        let report = db.sync_heads(&[entry.hash().to_string()]).await.unwrap();
        assert!(report.absorbed.is_empty());
        assert_eq!(report.rejected.len(), 1);
        assert!(matches!(events.try_recv(), Some(DatabaseEvent::Error(_))));
        db.close().await.unwrap();
    }
}
