//! Typed stores built on [`crate::Database`].

mod events;

pub use events::EventStore;
