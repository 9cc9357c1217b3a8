//! # peerlog Storage
//!
//! Storage capability trait and implementations for peerlog.
//!
//! Every store in this crate is a **key/value byte store** addressed by string
//! keys (entry hashes, head markers, index markers). Stores do not interpret
//! the values they hold.
//!
//! ## Design Principles
//!
//! - One async [`Storage`] trait for leaf backends and wrappers alike
//! - Wrappers are generic over `Arc<dyn Storage>` so they nest to any depth
//! - Must be `Send + Sync`; one storage instance belongs to one log
//!
//! ## Available Backends
//!
//! - [`MemoryStorage`] - Ordered in-memory map, for tests and ephemeral logs
//! - [`LruStorage`] - Bounded cache tier that evicts least-recently-used keys
//! - [`FileStorage`] - Append-only record file with an in-memory index
//! - [`ComposedStorage`] - Two tiers behind one façade (write-through, read
//!   promotion, deduplicated iteration)
//!
//! ## Example
//!
//! ```rust
//! use peerlog_storage::{MemoryStorage, Storage};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let storage = MemoryStorage::new();
//! storage.put("hash-1", b"hello".to_vec()).await.unwrap();
//! assert_eq!(storage.get("hash-1").await.unwrap(), Some(b"hello".to_vec()));
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod cache;
mod composed;
mod error;
mod file;
mod memory;

pub use backend::{IteratorOptions, Storage, StorageStream};
pub use cache::{LruStorage, DEFAULT_LRU_CAPACITY};
pub use composed::{ComposedStorage, StorageErrorReceiver, StorageErrorSender};
pub use error::{StorageError, StorageResult};
pub use file::FileStorage;
pub use memory::MemoryStorage;
