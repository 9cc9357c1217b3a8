//! Wire messages exchanged on a database topic.

use crate::codec;
use crate::error::CoreResult;
use serde::{Deserialize, Serialize};

/// Protocol version carried in every message.
pub const PROTOCOL_VERSION: u16 = 1;

/// A peer's current heads for one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadsMessage {
    /// Protocol version.
    pub version: u16,
    /// Database address the heads belong to.
    pub address: String,
    /// Head hashes, newest first.
    pub heads: Vec<String>,
}

impl HeadsMessage {
    /// Creates a message for `address`.
    pub fn new(address: impl Into<String>, heads: Vec<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            address: address.into(),
            heads,
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        codec::encode(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        codec::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    #[test]
    fn heads_message_roundtrip() {
        let message = HeadsMessage::new("events-AAA", vec!["h1".into(), "h2".into()]);
        let decoded = HeadsMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.version, PROTOCOL_VERSION);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            HeadsMessage::decode(&[1, 2, 3, 4, 5]),
            Err(CoreError::Codec { .. })
        ));
    }
}
