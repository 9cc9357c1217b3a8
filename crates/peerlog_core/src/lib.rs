//! # peerlog Core
//!
//! A peer-to-peer, content-addressed append log.
//!
//! Peers append signed entries to a shared log identified by an address,
//! exchange only the entries each one is missing, and converge on the same
//! causal history without a coordinator.
//!
//! ## Layers
//!
//! - [`Log`] - hash-linked, identity-signed entries forming a DAG
//! - [`Database`] - a log bound to an address, identity, access policy and
//!   storage, kept in sync with peers by a [`SyncEngine`]
//! - [`EventStore`] - append-only values on top of a database
//!
//! ## Collaborators
//!
//! - Storage: any [`peerlog_storage::Storage`], usually a
//!   [`peerlog_storage::ComposedStorage`] of a local cache and a shared tier
//! - Identity: [`Identities`] with pluggable [`IdentityProvider`]s
//! - Transport: any [`PubSub`]; [`LoopbackNetwork`] connects in-process peers
//!
//! ## Events
//!
//! [`Database::events`] yields [`DatabaseEvent::Update`] for every entry that
//! enters local state, [`DatabaseEvent::Sync`] (after the `Update`) for every
//! entry that arrived through a merge, and [`DatabaseEvent::Error`] for
//! failures that have no caller to return to.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod abortable;
mod access;
mod codec;
mod config;
mod database;
mod error;
mod feed;
mod identity;
mod log;
mod stores;
mod sync;

pub use abortable::{AbortError, Abortable, FetchOptions};
pub use access::{AccessController, WriteAccess, ANY_WRITER};
pub use ciborium::Value;
pub use config::{DatabaseConfig, QueryOptions, DEFAULT_FETCH_TIMEOUT};
pub use database::{Database, DatabaseOptions};
pub use error::{CoreError, CoreResult};
pub use feed::{DatabaseEvent, EventFeed, Subscription};
pub use identity::{
    Identities, Identity, IdentityProvider, Keystore, PublicKey, PublicKeyProvider, Signature,
    PUBLIC_KEY_PROVIDER,
};
pub use log::{Clock, Entry, Log, LogStorage, MergeReport, OpKind, Operation, ENTRY_VERSION};
pub use stores::EventStore;
pub use sync::{
    HeadsMessage, LoopbackNetwork, LoopbackPubSub, PubSub, SyncApplier, SyncEngine, SyncState,
    SyncStats, TopicEvent, TopicSubscription, PROTOCOL_VERSION,
};

// Re-export storage types for convenience
pub use peerlog_storage::{
    ComposedStorage, FileStorage, IteratorOptions, LruStorage, MemoryStorage, Storage,
    StorageError, StorageResult, StorageStream,
};
