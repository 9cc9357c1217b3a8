//! Per-database sync engine.

use super::protocol::HeadsMessage;
use super::pubsub::{PubSub, TopicEvent, TopicSubscription};
use crate::error::{CoreError, CoreResult};
use crate::log::MergeReport;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The current state of a sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Created, not yet subscribed.
    Idle,
    /// Listening on the database topic.
    Subscribed,
    /// Merging heads received from a peer.
    Merging,
    /// Stopped.
    Closed,
}

impl SyncState {
    /// Returns true while the engine listens for peers.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Subscribed | SyncState::Merging)
    }
}

/// Statistics about sync rounds.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Heads messages merged (successfully or not).
    pub rounds: u64,
    /// Entries absorbed from peers.
    pub entries_synced: u64,
    /// Entries rejected by verification or access control.
    pub entries_rejected: u64,
    /// Rounds that ended in an error.
    pub failures: u64,
    /// Heads announcements published.
    pub announcements: u64,
    /// Time of the last round that absorbed anything.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// The database side of synchronization.
#[async_trait]
pub trait SyncApplier: Send + Sync {
    /// Current local head hashes, newest first.
    fn local_heads(&self) -> Vec<String>;

    /// Merges the history behind `heads` and emits the resulting events.
    async fn apply_remote_heads(&self, heads: Vec<String>) -> CoreResult<MergeReport>;

    /// Reports a failure that has no caller to return to.
    fn report_error(&self, error: CoreError);
}

struct EngineShared {
    address: String,
    pubsub: Arc<dyn PubSub>,
    applier: Arc<dyn SyncApplier>,
    announce_on_join: bool,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
}

impl EngineShared {
    fn set_state(&self, state: SyncState) {
        let mut current = self.state.write();
        if *current != SyncState::Closed {
            *current = state;
        }
    }

    async fn announce(&self) -> CoreResult<()> {
        let heads = self.applier.local_heads();
        if heads.is_empty() {
            return Ok(());
        }

        let data = HeadsMessage::new(&self.address, heads).encode()?;
        self.pubsub.publish(&self.address, data).await?;
        self.stats.write().announcements += 1;
        Ok(())
    }

    async fn handle(&self, event: TopicEvent) {
        match event {
            TopicEvent::PeerJoined { peer } => {
                tracing::debug!(address = %self.address, peer = %peer, "peer joined");
                if self.announce_on_join {
                    if let Err(e) = self.announce().await {
                        self.applier.report_error(e);
                    }
                }
            }
            TopicEvent::PeerLeft { peer } => {
                tracing::debug!(address = %self.address, peer = %peer, "peer left");
            }
            TopicEvent::Message { from, data } => self.on_message(&from, &data).await,
        }
    }

    async fn on_message(&self, from: &str, data: &[u8]) {
        let message = match HeadsMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(address = %self.address, peer = %from, error = %e, "invalid heads message");
                self.record_failure(&e);
                self.applier.report_error(e);
                return;
            }
        };
        if message.address != self.address || message.heads.is_empty() {
            return;
        }

        self.set_state(SyncState::Merging);
        tracing::debug!(
            address = %self.address,
            peer = %from,
            heads = message.heads.len(),
            "merging remote heads"
        );

        let result = self.applier.apply_remote_heads(message.heads).await;
        {
            let mut stats = self.stats.write();
            stats.rounds += 1;
            match &result {
                Ok(report) => {
                    stats.entries_synced += report.absorbed.len() as u64;
                    stats.entries_rejected += report.rejected.len() as u64;
                    if !report.absorbed.is_empty() {
                        stats.last_sync_time = Some(Instant::now());
                    }
                }
                Err(e) => {
                    stats.failures += 1;
                    stats.last_error = Some(e.to_string());
                }
            }
        }
        match result {
            Err(e) if e.is_abort() => {
                tracing::debug!(address = %self.address, peer = %from, error = %e, "sync round abandoned");
            }
            Err(e) => {
                tracing::warn!(address = %self.address, peer = %from, error = %e, "sync round failed");
                self.applier.report_error(e);
            }
            Ok(_) => {}
        }
        self.set_state(SyncState::Subscribed);
    }

    fn record_failure(&self, error: &CoreError) {
        let mut stats = self.stats.write();
        stats.failures += 1;
        stats.last_error = Some(error.to_string());
    }
}

/// Keeps one database in sync with its peers.
///
/// The engine subscribes to the database address as a pubsub topic. When a
/// peer joins it publishes the local heads; when heads arrive it hands them
/// to the [`SyncApplier`] and returns to listening. Rounds are processed one
/// at a time, in arrival order.
pub struct SyncEngine {
    shared: Arc<EngineShared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Creates an idle engine.
    pub fn new(
        address: impl Into<String>,
        pubsub: Arc<dyn PubSub>,
        applier: Arc<dyn SyncApplier>,
        cancel: CancellationToken,
        announce_on_join: bool,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                address: address.into(),
                pubsub,
                applier,
                announce_on_join,
                state: RwLock::new(SyncState::Idle),
                stats: RwLock::new(SyncStats::default()),
            }),
            cancel,
            task: Mutex::new(None),
        }
    }

    /// Subscribes to the topic and starts processing events.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(&self) -> CoreResult<()> {
        if self.state() != SyncState::Idle {
            return Ok(());
        }

        let subscription = self.shared.pubsub.subscribe(&self.shared.address).await?;
        self.shared.set_state(SyncState::Subscribed);

        let handle = tokio::spawn(run(self.shared.clone(), subscription, self.cancel.clone()));
        *self.task.lock() = Some(handle);

        tracing::info!(
            address = %self.shared.address,
            peer = %self.shared.pubsub.peer_id(),
            "sync started"
        );
        Ok(())
    }

    /// Publishes the local heads on the topic.
    pub async fn announce(&self) -> CoreResult<()> {
        self.shared.announce().await
    }

    /// Cancels in-flight rounds, waits for the event loop and leaves the topic.
    pub async fn stop(&self) -> CoreResult<()> {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(address = %self.shared.address, error = %e, "sync task failed");
            }
        }

        let was_active = self.state().is_active();
        *self.shared.state.write() = SyncState::Closed;
        if was_active {
            self.shared.pubsub.unsubscribe(&self.shared.address).await?;
            tracing::info!(address = %self.shared.address, "sync stopped");
        }
        Ok(())
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        *self.shared.state.read()
    }

    /// Statistics so far.
    pub fn stats(&self) -> SyncStats {
        self.shared.stats.read().clone()
    }

    /// Topic (database address).
    pub fn address(&self) -> &str {
        &self.shared.address
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn run(shared: Arc<EngineShared>, mut subscription: TopicSubscription, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = subscription.next() => match event {
                Some(event) => shared.handle(event).await,
                None => break,
            },
        }
    }
}
