//! Event feed for observing database activity.
//!
//! Every subscriber gets its own unbounded queue. [`EventFeed::emit`]
//! pushes to all current subscribers before it returns, so an observer that
//! subscribed before an operation sees that operation's events in order.
//!
//! ```rust
//! use peerlog_core::{DatabaseEvent, EventFeed};
//!
//! let feed = EventFeed::new();
//! let mut subscription = feed.subscribe();
//!
//! feed.emit(DatabaseEvent::error(peerlog_core::CoreError::DatabaseClosed));
//! assert!(matches!(subscription.try_recv(), Some(DatabaseEvent::Error(_))));
//!
//! subscription.unsubscribe();
//! assert_eq!(feed.subscriber_count(), 0);
//! ```

use crate::error::CoreError;
use crate::log::Entry;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// An event emitted by a database.
#[derive(Debug, Clone)]
pub enum DatabaseEvent {
    /// An entry entered local state, by local append or remote merge.
    Update(Entry),
    /// An entry entered local state through a remote merge. Always follows
    /// the matching `Update`.
    Sync(Entry),
    /// A recoverable failure (merge, storage, announcement).
    Error(Arc<CoreError>),
}

impl DatabaseEvent {
    /// Wraps an error.
    pub fn error(error: CoreError) -> Self {
        Self::Error(Arc::new(error))
    }

    /// Returns the entry of an `Update` or `Sync` event.
    pub fn entry(&self) -> Option<&Entry> {
        match self {
            Self::Update(entry) | Self::Sync(entry) => Some(entry),
            Self::Error(_) => None,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: UnboundedSender<DatabaseEvent>,
}

#[derive(Default)]
struct FeedShared {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    emitted: AtomicU64,
}

/// Distributes database events to subscribers.
#[derive(Clone, Default)]
pub struct EventFeed {
    shared: Arc<FeedShared>,
}

impl EventFeed {
    /// Creates a feed with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.subscribers.write().push(Subscriber { id, tx });
        Subscription {
            id,
            rx,
            feed: Arc::downgrade(&self.shared),
        }
    }

    /// Delivers `event` to every current subscriber.
    pub fn emit(&self, event: DatabaseEvent) {
        self.shared.emitted.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.shared.subscribers.write();
        subscribers.retain(|s| s.tx.send(event.clone()).is_ok());
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.read().len()
    }

    /// Total number of events emitted.
    pub fn emitted(&self) -> u64 {
        self.shared.emitted.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EventFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFeed")
            .field("subscribers", &self.subscriber_count())
            .field("emitted", &self.emitted())
            .finish()
    }
}

/// A live subscription. Dropping it detaches from the feed.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: UnboundedReceiver<DatabaseEvent>,
    feed: Weak<FeedShared>,
}

impl Subscription {
    /// Waits for the next event. Returns `None` once the feed is gone and
    /// every queued event has been received.
    pub async fn recv(&mut self) -> Option<DatabaseEvent> {
        self.rx.recv().await
    }

    /// Returns the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<DatabaseEvent> {
        self.rx.try_recv().ok()
    }

    /// Detaches from the feed.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.subscribers.write().retain(|s| s.id != self.id);
        }
    }
}
