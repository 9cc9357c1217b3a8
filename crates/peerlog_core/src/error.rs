//! Error types for peerlog core.

use crate::abortable::AbortError;
use peerlog_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in peerlog core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The access controller refused an append.
    #[error("could not append entry: identity {identity} has no write access")]
    Authorization {
        /// Id of the identity that tried to write.
        identity: String,
    },

    /// A received entry failed hash, identity or signature checks.
    #[error("entry {hash} failed verification: {reason}")]
    Verification {
        /// Hash of the rejected entry.
        hash: String,
        /// What check failed.
        reason: String,
    },

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// An abortable operation was cancelled.
    #[error("operation aborted")]
    Cancelled,

    /// An abortable operation exceeded its deadline.
    #[error("operation exceeded timeout of {timeout:?}")]
    Timeout {
        /// The configured timeout.
        timeout: Duration,
    },

    /// CBOR encoding or decoding failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// A referenced entry is not present in any reachable storage.
    #[error("entry not found: {hash}")]
    EntryNotFound {
        /// The missing hash.
        hash: String,
    },

    /// Identity creation or lookup failed.
    #[error("identity error: {message}")]
    Identity {
        /// Description of the failure.
        message: String,
    },

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Pubsub transport failure.
    #[error("pubsub error: {message}")]
    PubSub {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates a verification error.
    pub fn verification(hash: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Verification {
            hash: hash.into(),
            reason: reason.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl ToString) -> Self {
        Self::Codec {
            message: message.to_string(),
        }
    }

    /// Creates an identity error.
    pub fn identity(message: impl Into<String>) -> Self {
        Self::Identity {
            message: message.into(),
        }
    }

    /// Creates a pubsub error.
    pub fn pubsub(message: impl Into<String>) -> Self {
        Self::PubSub {
            message: message.into(),
        }
    }

    /// Returns true for cancellation and timeout, which abandon a round
    /// without anything being wrong with the data.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout { .. })
    }
}

impl From<AbortError> for CoreError {
    fn from(error: AbortError) -> Self {
        match error {
            AbortError::Cancelled => Self::Cancelled,
            AbortError::Timeout(timeout) => Self::Timeout { timeout },
        }
    }
}
