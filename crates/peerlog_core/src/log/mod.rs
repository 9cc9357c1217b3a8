//! The append-only operation log.
//!
//! A [`Log`] is a DAG of signed [`Entry`] values. Each entry points at the
//! heads that existed when it was written, so the graph records causal
//! history. Logs on different peers converge by exchanging heads and
//! merging whatever entries they are missing.
//!
//! # Storage
//!
//! A log keeps three storages (see [`LogStorage`]):
//!
//! | Storage | Key | Value |
//! |---------|-----|-------|
//! | entries | entry hash | entry bytes |
//! | heads | head hash | entry bytes |
//! | index | entry hash | empty (membership marker) |
//!
//! The entries storage may be shared with other logs or with the network,
//! so membership is decided by the index, never by the presence of bytes.
//!
//! # Ordering
//!
//! [`Log::traverse`] yields every descendant before its ancestors. Among
//! unrelated entries the larger clock (time, then writer id) comes first,
//! then the larger hash.

mod clock;
mod entry;

pub use clock::Clock;
pub use entry::{Entry, OpKind, Operation, ENTRY_VERSION};

use crate::abortable::FetchOptions;
use crate::access::AccessController;
use crate::error::{CoreError, CoreResult};
use crate::identity::{Identities, Identity};
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use peerlog_storage::{IteratorOptions, MemoryStorage, Storage};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// The storages backing one log.
#[derive(Clone)]
pub struct LogStorage {
    /// Entry bytes by hash.
    pub entries: Arc<dyn Storage>,
    /// Current heads.
    pub heads: Arc<dyn Storage>,
    /// Hashes that belong to this log.
    pub index: Arc<dyn Storage>,
}

impl LogStorage {
    /// Creates a storage set from three storages.
    pub fn new(entries: Arc<dyn Storage>, heads: Arc<dyn Storage>, index: Arc<dyn Storage>) -> Self {
        Self {
            entries,
            heads,
            index,
        }
    }

    /// Three fresh in-memory storages.
    pub fn memory() -> Self {
        Self::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
        )
    }

    /// In-memory heads and index over the given entry storage.
    pub fn with_entries(entries: Arc<dyn Storage>) -> Self {
        Self::new(
            entries,
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
        )
    }
}

impl std::fmt::Debug for LogStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStorage").finish_non_exhaustive()
    }
}

/// Outcome of [`Log::merge`].
#[derive(Debug, Default)]
pub struct MergeReport {
    /// Entries added to the log, ancestors first.
    pub absorbed: Vec<Entry>,
    /// Entries dropped because a check failed.
    pub rejected: Vec<(String, Arc<CoreError>)>,
    /// Hashes left for a later round: not found, timed out, or waiting on
    /// an ancestor that could not be absorbed.
    pub abandoned: Vec<String>,
}

impl MergeReport {
    /// Returns true if the merge changed nothing.
    pub fn is_empty(&self) -> bool {
        self.absorbed.is_empty()
    }
}

struct LogState {
    /// Newest first.
    heads: Vec<Entry>,
    clock: Clock,
}

/// Heap item ordering entries for traversal.
struct Newest(Entry);

impl PartialEq for Newest {
    fn eq(&self, other: &Self) -> bool {
        self.0.hash() == other.0.hash()
    }
}

impl Eq for Newest {}

impl PartialOrd for Newest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Newest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp_order(&other.0)
    }
}

/// A signed, hash-linked append log.
pub struct Log {
    id: String,
    identity: Identity,
    identities: Arc<Identities>,
    access: Arc<dyn AccessController>,
    storage: LogStorage,
    state: RwLock<LogState>,
    /// Serializes appends and the absorb phase of merges.
    write_lock: tokio::sync::Mutex<()>,
}

impl Log {
    /// Opens log `id`, resuming from any heads persisted in `storage`.
    pub async fn open(
        id: impl Into<String>,
        identity: Identity,
        identities: Arc<Identities>,
        access: Arc<dyn AccessController>,
        storage: LogStorage,
    ) -> CoreResult<Self> {
        let id = id.into();
        let mut clock = Clock::new(identity.public_key.to_hex(), 0);

        let mut heads = Vec::new();
        let mut stored = storage.heads.iterator(IteratorOptions::new());
        while let Some(pair) = stored.next().await {
            let (hash, bytes) = pair?;
            let entry = Entry::from_bytes(&bytes)?;
            if entry.hash() != hash {
                return Err(CoreError::verification(hash, "stored head does not match its key"));
            }
            clock = clock.merge(entry.clock());
            heads.push(entry);
        }
        drop(stored);

        // A rewrite interrupted between storing new heads and removing the
        // old ones leaves ancestors behind; they are not heads.
        let referenced: HashSet<String> = heads.iter().flat_map(|e| e.next().iter().cloned()).collect();
        heads.retain(|e| !referenced.contains(e.hash()));
        heads.sort_by(|a, b| b.cmp_order(a));

        tracing::debug!(log = %id, heads = heads.len(), time = clock.time, "opened log");

        Ok(Self {
            id,
            identity,
            identities,
            access,
            storage,
            state: RwLock::new(LogState { heads, clock }),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Log id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identity that signs local appends.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Current clock.
    pub fn clock(&self) -> Clock {
        self.state.read().clock.clone()
    }

    /// Current heads, newest first.
    pub fn heads(&self) -> Vec<Entry> {
        self.state.read().heads.clone()
    }

    /// Hashes of the current heads, newest first.
    pub fn head_hashes(&self) -> Vec<String> {
        self.state
            .read()
            .heads
            .iter()
            .map(|e| e.hash().to_string())
            .collect()
    }

    /// Appends `payload` as a new entry on top of the current heads.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Authorization`] if the access controller refuses
    /// the entry; nothing is written in that case.
    pub async fn append(&self, payload: Operation) -> CoreResult<Entry> {
        let _guard = self.write_lock.lock().await;

        let (next, clock) = {
            let state = self.state.read();
            let clock = state
                .heads
                .iter()
                .fold(state.clock.clone(), |clock, head| clock.merge(head.clock()))
                .tick();
            let next = state.heads.iter().map(|e| e.hash().to_string()).collect();
            (next, clock)
        };

        let entry = Entry::create(
            &self.identities,
            &self.identity,
            &self.id,
            payload,
            next,
            clock.clone(),
        )
        .await?;

        if !self.access.can_append(&entry).await {
            tracing::debug!(log = %self.id, identity = %self.identity.id, "append denied");
            return Err(CoreError::Authorization {
                identity: self.identity.id.clone(),
            });
        }

        self.store_entry(&entry).await?;
        let previous = self.heads();
        self.commit(std::slice::from_ref(&entry), std::slice::from_ref(&entry), &previous)
            .await?;
        {
            let mut state = self.state.write();
            state.heads = vec![entry.clone()];
            state.clock = clock;
        }

        tracing::trace!(log = %self.id, hash = %entry.hash(), "appended entry");
        Ok(entry)
    }

    /// Returns true if `hash` belongs to this log.
    pub async fn has(&self, hash: &str) -> CoreResult<bool> {
        Ok(self.storage.index.get(hash).await?.is_some())
    }

    /// Loads entry `hash` if it belongs to this log.
    pub async fn get(&self, hash: &str) -> CoreResult<Option<Entry>> {
        if !self.has(hash).await? {
            return Ok(None);
        }
        self.load(hash).await.map(Some)
    }

    async fn load(&self, hash: &str) -> CoreResult<Entry> {
        let bytes = self
            .storage
            .entries
            .get(hash)
            .await?
            .ok_or_else(|| CoreError::EntryNotFound {
                hash: hash.to_string(),
            })?;
        Entry::from_bytes(&bytes)
    }

    /// Streams the log from its current heads, newest first.
    pub fn traverse(&self) -> BoxStream<'_, CoreResult<Entry>> {
        self.traverse_from(self.heads())
    }

    /// Streams `roots` and all their ancestors, every descendant before its
    /// ancestors.
    pub fn traverse_from(&self, roots: Vec<Entry>) -> BoxStream<'_, CoreResult<Entry>> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue = BinaryHeap::new();
        for root in roots {
            if seen.insert(root.hash().to_string()) {
                queue.push(Newest(root));
            }
        }

        stream::unfold((queue, seen), move |(mut queue, mut seen)| async move {
            let Newest(entry) = queue.pop()?;
            for hash in entry.next() {
                if !seen.insert(hash.clone()) {
                    continue;
                }
                match self.load(hash).await {
                    Ok(parent) => queue.push(Newest(parent)),
                    Err(e) => return Some((Err(e), (queue, seen))),
                }
            }
            Some((Ok(entry), (queue, seen)))
        })
        .boxed()
    }

    /// Merges the history behind `remote_heads`, fetching unknown entries
    /// from `source`.
    ///
    /// Every fetched entry must hash to the key it was requested by, belong
    /// to this log, carry a valid identity and signature, and pass the
    /// access controller. Entries failing a check are reported in
    /// [`MergeReport::rejected`]. Entries that cannot be connected to known
    /// history this round are reported in [`MergeReport::abandoned`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Cancelled`] if `options.cancel` fires, in which
    /// case nothing is absorbed.
    pub async fn merge(
        &self,
        remote_heads: &[String],
        source: &dyn Storage,
        options: &FetchOptions,
    ) -> CoreResult<MergeReport> {
        let mut report = MergeReport::default();
        let fetched = self.fetch_missing(remote_heads, source, options, &mut report).await?;
        if fetched.is_empty() {
            return Ok(report);
        }

        let complete = self.connected(fetched, &mut report).await?;

        let _guard = self.write_lock.lock().await;
        if options.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let mut absorbed = Vec::with_capacity(complete.len());
        for entry in complete {
            if self.has(entry.hash()).await? {
                continue;
            }
            self.store_entry(&entry).await?;
            absorbed.push(entry);
        }
        if absorbed.is_empty() {
            return Ok(report);
        }

        let previous = self.heads();
        let referenced: HashSet<&str> = absorbed
            .iter()
            .flat_map(|e| e.next().iter().map(String::as_str))
            .collect();
        let mut heads: Vec<Entry> = previous
            .iter()
            .chain(absorbed.iter())
            .filter(|e| !referenced.contains(e.hash()))
            .cloned()
            .collect();
        heads.sort_by(|a, b| b.cmp_order(a));
        heads.dedup_by(|a, b| a.hash() == b.hash());

        self.commit(&absorbed, &heads, &previous).await?;
        {
            let mut state = self.state.write();
            let clock = absorbed
                .iter()
                .fold(state.clock.clone(), |clock, e| clock.merge(e.clock()));
            state.clock = clock;
            state.heads = heads;
        }

        tracing::debug!(
            log = %self.id,
            absorbed = absorbed.len(),
            rejected = report.rejected.len(),
            abandoned = report.abandoned.len(),
            "merged remote heads"
        );
        report.absorbed = absorbed;
        Ok(report)
    }

    /// Fetch phase of a merge: walks back from `remote_heads` until it
    /// reaches known entries, verifying everything it fetches.
    async fn fetch_missing(
        &self,
        remote_heads: &[String],
        source: &dyn Storage,
        options: &FetchOptions,
        report: &mut MergeReport,
    ) -> CoreResult<HashMap<String, Entry>> {
        let mut fetched: HashMap<String, Entry> = HashMap::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = remote_heads.iter().cloned().collect();

        while let Some(hash) = queue.pop_front() {
            if options.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            if !visited.insert(hash.clone()) || self.has(&hash).await? {
                continue;
            }

            let fetch = options.run(source.get(&hash)).await.map_err(CoreError::from);
            let bytes = match fetch {
                Err(timeout @ CoreError::Timeout { .. }) => {
                    tracing::debug!(log = %self.id, hash = %hash, error = %timeout, "fetch abandoned");
                    report.abandoned.push(hash);
                    continue;
                }
                Err(cancelled) => return Err(cancelled),
                Ok(Err(e)) => {
                    tracing::warn!(log = %self.id, hash = %hash, error = %e, "fetch failed");
                    report.abandoned.push(hash);
                    continue;
                }
                Ok(Ok(None)) => {
                    tracing::debug!(log = %self.id, hash = %hash, "entry not found");
                    report.abandoned.push(hash);
                    continue;
                }
                Ok(Ok(Some(bytes))) => bytes,
            };

            match self.check(&hash, &bytes).await {
                Ok(entry) => {
                    queue.extend(entry.next().iter().cloned());
                    fetched.insert(hash, entry);
                }
                Err(e) => {
                    tracing::warn!(log = %self.id, hash = %hash, error = %e, "rejected remote entry");
                    report.rejected.push((hash, Arc::new(e)));
                }
            }
        }
        Ok(fetched)
    }

    /// Verifies one fetched entry.
    async fn check(&self, hash: &str, bytes: &[u8]) -> CoreResult<Entry> {
        let entry = Entry::from_bytes(bytes)?;
        if entry.hash() != hash {
            return Err(CoreError::verification(hash, "content hash mismatch"));
        }
        if entry.log_id() != self.id {
            return Err(CoreError::verification(
                hash,
                format!("entry belongs to log {}", entry.log_id()),
            ));
        }
        entry.verify(&self.identities).await?;
        if !self.access.can_append(&entry).await {
            return Err(CoreError::Authorization {
                identity: entry.identity().id.clone(),
            });
        }
        Ok(entry)
    }

    /// Keeps the fetched entries whose whole history is known, ancestors
    /// first. The rest are reported as abandoned, or rejected if a parent
    /// does not have an earlier clock.
    async fn connected(
        &self,
        fetched: HashMap<String, Entry>,
        report: &mut MergeReport,
    ) -> CoreResult<Vec<Entry>> {
        let mut pending: Vec<Entry> = fetched.into_values().collect();
        pending.sort_by(|a, b| a.cmp_order(b));

        let mut complete: Vec<Entry> = Vec::with_capacity(pending.len());
        let mut times: HashMap<String, u64> = HashMap::new();

        for entry in pending {
            let mut connected = true;
            let mut ordered = true;
            for parent in entry.next() {
                let time = match times.get(parent) {
                    Some(time) => Some(*time),
                    None => self.get(parent).await?.map(|p| p.clock().time),
                };
                match time {
                    Some(time) if time < entry.clock().time => {}
                    Some(_) => ordered = false,
                    None => connected = false,
                }
            }

            if !ordered {
                report.rejected.push((
                    entry.hash().to_string(),
                    Arc::new(CoreError::verification(
                        entry.hash(),
                        "clock is not after its parents",
                    )),
                ));
            } else if !connected {
                report.abandoned.push(entry.hash().to_string());
            } else {
                times.insert(entry.hash().to_string(), entry.clock().time);
                complete.push(entry);
            }
        }
        Ok(complete)
    }

    async fn store_entry(&self, entry: &Entry) -> CoreResult<()> {
        self.storage
            .entries
            .put(entry.hash(), entry.bytes().to_vec())
            .await?;
        Ok(())
    }

    /// Stores `heads` in place of `previous`, then indexes `entries`.
    ///
    /// A hash is indexed only once the stored heads reach it. On failure the
    /// markers written so far are removed and `previous` is restored, so a
    /// later round fetches and absorbs the same entries again.
    async fn commit(&self, entries: &[Entry], heads: &[Entry], previous: &[Entry]) -> CoreResult<()> {
        let mut indexed: Vec<&str> = Vec::with_capacity(entries.len());
        let result = async {
            self.replace_heads(heads, previous).await?;
            for entry in entries {
                self.storage.index.put(entry.hash(), Vec::new()).await?;
                indexed.push(entry.hash());
            }
            Ok::<(), CoreError>(())
        }
        .await;

        if let Err(e) = result {
            self.rollback(&indexed, heads, previous).await;
            return Err(e);
        }
        Ok(())
    }

    async fn rollback(&self, indexed: &[&str], heads: &[Entry], previous: &[Entry]) {
        for hash in indexed {
            if let Err(e) = self.storage.index.del(hash).await {
                tracing::warn!(log = %self.id, hash = %hash, error = %e, "could not remove index marker");
            }
        }
        if let Err(e) = self.replace_heads(previous, heads).await {
            tracing::warn!(log = %self.id, error = %e, "could not restore heads");
        }
    }

    /// Writes `heads`, then removes the entries of `stale` that are not
    /// among them. Stopping partway leaves a superset of heads in storage.
    async fn replace_heads(&self, heads: &[Entry], stale: &[Entry]) -> CoreResult<()> {
        for head in heads {
            self.storage
                .heads
                .put(head.hash(), head.bytes().to_vec())
                .await?;
        }
        for old in stale {
            if !heads.iter().any(|h| h.hash() == old.hash()) {
                self.storage.heads.del(old.hash()).await?;
            }
        }
        Ok(())
    }

    /// Removes every entry, head and index marker.
    pub async fn clear(&self) -> CoreResult<()> {
        let _guard = self.write_lock.lock().await;
        self.storage.index.clear().await?;
        self.storage.heads.clear().await?;
        self.storage.entries.clear().await?;

        let mut state = self.state.write();
        state.heads.clear();
        state.clock = Clock::new(self.identity.public_key.to_hex(), 0);
        Ok(())
    }

    /// Closes all three storages.
    pub async fn close(&self) -> CoreResult<()> {
        self.storage.index.close().await?;
        self.storage.heads.close().await?;
        self.storage.entries.close().await?;
        Ok(())
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("id", &self.id)
            .field("identity", &self.identity.id)
            .field("heads", &self.head_hashes())
            .finish_non_exhaustive()
    }
}
