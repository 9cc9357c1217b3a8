//! Peer-to-peer replication.
//!
//! Peers of one database meet on a pubsub topic named after the database
//! address and exchange their heads ([`HeadsMessage`]). A peer receiving
//! heads it does not know fetches the missing entries from content
//! addressed storage and merges them into its log.
//!
//! ```text
//! peer A                      topic                      peer B
//!   |  append, announce heads   |                          |
//!   |-------------------------->|------------------------->|
//!   |                           |          fetch entries by hash,
//!   |                           |          verify, merge, emit events
//! ```

mod engine;
mod protocol;
mod pubsub;

pub use engine::{SyncApplier, SyncEngine, SyncState, SyncStats};
pub use protocol::{HeadsMessage, PROTOCOL_VERSION};
pub use pubsub::{LoopbackNetwork, LoopbackPubSub, PubSub, TopicEvent, TopicSubscription};
