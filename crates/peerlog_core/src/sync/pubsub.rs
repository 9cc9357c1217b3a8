//! Topic based publish/subscribe transport.

use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Something that happened on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicEvent {
    /// A message published by another peer.
    Message {
        /// Publishing peer.
        from: String,
        /// Message bytes.
        data: Vec<u8>,
    },
    /// A peer subscribed to the topic.
    PeerJoined {
        /// The peer id.
        peer: String,
    },
    /// A peer unsubscribed from the topic.
    PeerLeft {
        /// The peer id.
        peer: String,
    },
}

/// Events for one subscribed topic.
#[derive(Debug)]
pub struct TopicSubscription {
    topic: String,
    rx: UnboundedReceiver<TopicEvent>,
}

impl TopicSubscription {
    /// Wraps a receiver fed by a transport.
    pub fn new(topic: impl Into<String>, rx: UnboundedReceiver<TopicEvent>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    /// Topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next event. `None` once the transport drops the topic.
    pub async fn next(&mut self) -> Option<TopicEvent> {
        self.rx.recv().await
    }
}

/// A pubsub transport.
///
/// Publishing never delivers a message back to the publishing peer.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// This peer's id.
    fn peer_id(&self) -> &str;

    /// Subscribes to `topic`.
    async fn subscribe(&self, topic: &str) -> CoreResult<TopicSubscription>;

    /// Publishes `data` to every other subscriber of `topic`.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> CoreResult<()>;

    /// Leaves `topic`. Leaving a topic that was never joined succeeds.
    async fn unsubscribe(&self, topic: &str) -> CoreResult<()>;
}

type Topics = HashMap<String, HashMap<String, UnboundedSender<TopicEvent>>>;

/// An in-process pubsub network.
///
/// Peers created with [`LoopbackNetwork::peer`] see each other's messages
/// and presence on shared topics, mirroring a real gossip transport without
/// sockets.
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    topics: RwLock<Topics>,
}

impl LoopbackNetwork {
    /// Creates an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches a new peer with a random id.
    pub fn peer(self: &Arc<Self>) -> LoopbackPubSub {
        self.peer_with_id(uuid::Uuid::new_v4().to_string())
    }

    /// Attaches a peer with a chosen id.
    pub fn peer_with_id(self: &Arc<Self>, id: impl Into<String>) -> LoopbackPubSub {
        LoopbackPubSub {
            id: id.into(),
            network: Arc::clone(self),
        }
    }

    /// Peers currently subscribed to `topic`, sorted.
    pub fn peers(&self, topic: &str) -> Vec<String> {
        let mut peers: Vec<String> = self
            .topics
            .read()
            .get(topic)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }
}

/// One peer's handle on a [`LoopbackNetwork`].
#[derive(Debug, Clone)]
pub struct LoopbackPubSub {
    id: String,
    network: Arc<LoopbackNetwork>,
}

#[async_trait]
impl PubSub for LoopbackPubSub {
    fn peer_id(&self) -> &str {
        &self.id
    }

    async fn subscribe(&self, topic: &str) -> CoreResult<TopicSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.network.topics.write();
        let members = topics.entry(topic.to_string()).or_default();
        if members.contains_key(&self.id) {
            return Err(CoreError::pubsub(format!(
                "peer {} is already subscribed to {topic}",
                self.id
            )));
        }

        for (peer, member) in members.iter() {
            let _ = member.send(TopicEvent::PeerJoined {
                peer: self.id.clone(),
            });
            let _ = tx.send(TopicEvent::PeerJoined { peer: peer.clone() });
        }
        members.insert(self.id.clone(), tx);

        tracing::debug!(peer = %self.id, topic, "subscribed");
        Ok(TopicSubscription::new(topic, rx))
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> CoreResult<()> {
        let mut topics = self.network.topics.write();
        let Some(members) = topics.get_mut(topic) else {
            return Ok(());
        };

        members.retain(|peer, member| {
            if *peer == self.id {
                return true;
            }
            member
                .send(TopicEvent::Message {
                    from: self.id.clone(),
                    data: data.clone(),
                })
                .is_ok()
        });
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> CoreResult<()> {
        let mut topics = self.network.topics.write();
        let Some(members) = topics.get_mut(topic) else {
            return Ok(());
        };
        if members.remove(&self.id).is_none() {
            return Ok(());
        }

        for member in members.values() {
            let _ = member.send(TopicEvent::PeerLeft {
                peer: self.id.clone(),
            });
        }
        if members.is_empty() {
            topics.remove(topic);
        }

        tracing::debug!(peer = %self.id, topic, "unsubscribed");
        Ok(())
    }
}
