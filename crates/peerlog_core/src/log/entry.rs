//! Signed, content-addressed log entries.

use super::clock::Clock;
use crate::codec;
use crate::error::{CoreError, CoreResult};
use crate::identity::{Identities, Identity, Signature};
use ciborium::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Entry format version.
pub const ENTRY_VERSION: u8 = 2;

/// Kind of a database operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpKind {
    /// Append a value (event logs, feeds).
    Add,
    /// Set a key (key/value stores).
    Put,
    /// Delete a key.
    Del,
}

/// The payload of an entry. Opaque to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation kind.
    pub op: OpKind,
    /// Key for keyed operations.
    pub key: Option<String>,
    /// Operation value.
    pub value: Value,
}

impl Operation {
    /// An `ADD` operation.
    pub fn add(value: impl Into<Value>) -> Self {
        Self {
            op: OpKind::Add,
            key: None,
            value: value.into(),
        }
    }

    /// A `PUT` operation.
    pub fn put(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            op: OpKind::Put,
            key: Some(key.into()),
            value: value.into(),
        }
    }

    /// A `DEL` operation.
    pub fn del(key: impl Into<String>) -> Self {
        Self {
            op: OpKind::Del,
            key: Some(key.into()),
            value: Value::Null,
        }
    }
}

/// The signed part of an entry.
#[derive(Serialize)]
struct SignedFields<'a> {
    v: u8,
    id: &'a str,
    payload: &'a Operation,
    next: &'a [String],
    clock: &'a Clock,
}

/// An immutable log entry.
///
/// `hash` is the hex SHA-256 of the entry's CBOR encoding and is the key the
/// entry is stored under. It is computed once, when the entry is created or
/// decoded, and never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    #[serde(skip)]
    hash: String,
    #[serde(skip)]
    bytes: Vec<u8>,
    v: u8,
    id: String,
    payload: Operation,
    next: Vec<String>,
    clock: Clock,
    identity: Identity,
    sig: Signature,
}

impl Entry {
    /// Creates and signs an entry for log `log_id`.
    pub async fn create(
        identities: &Identities,
        identity: &Identity,
        log_id: &str,
        payload: Operation,
        next: Vec<String>,
        clock: Clock,
    ) -> CoreResult<Self> {
        let signed = codec::encode(&SignedFields {
            v: ENTRY_VERSION,
            id: log_id,
            payload: &payload,
            next: &next,
            clock: &clock,
        })?;
        let sig = identities.sign(identity, &signed).await?;

        let mut entry = Self {
            hash: String::new(),
            bytes: Vec::new(),
            v: ENTRY_VERSION,
            id: log_id.to_string(),
            payload,
            next,
            clock,
            identity: identity.clone(),
            sig,
        };
        entry.bytes = codec::encode(&entry)?;
        entry.hash = codec::content_hash(&entry.bytes);
        Ok(entry)
    }

    /// Decodes an entry and computes its hash from `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        let mut entry: Self = codec::decode(bytes)?;
        entry.hash = codec::content_hash(bytes);
        entry.bytes = bytes.to_vec();
        Ok(entry)
    }

    /// Checks the author's identity proof, that the author's key signed the
    /// entry, and that the clock was written by that key.
    pub async fn verify(&self, identities: &Identities) -> CoreResult<()> {
        if self.v != ENTRY_VERSION {
            return Err(CoreError::verification(
                &self.hash,
                format!("unsupported entry version {}", self.v),
            ));
        }
        if self.clock.id != self.identity.public_key.to_hex() {
            return Err(CoreError::verification(
                &self.hash,
                "clock id does not match the signing key",
            ));
        }
        if !identities.verify_identity(&self.identity).await? {
            return Err(CoreError::verification(&self.hash, "invalid identity"));
        }

        let signed = self.signed_bytes()?;
        if !identities.verify(&self.identity, &signed, &self.sig) {
            return Err(CoreError::verification(&self.hash, "invalid signature"));
        }
        Ok(())
    }

    fn signed_bytes(&self) -> CoreResult<Vec<u8>> {
        codec::encode(&SignedFields {
            v: self.v,
            id: &self.id,
            payload: &self.payload,
            next: &self.next,
            clock: &self.clock,
        })
    }

    /// Content hash.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Encoded bytes, exactly as hashed.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Id of the log this entry belongs to.
    pub fn log_id(&self) -> &str {
        &self.id
    }

    /// The operation.
    pub fn payload(&self) -> &Operation {
        &self.payload
    }

    /// Hashes of the immediate predecessors.
    pub fn next(&self) -> &[String] {
        &self.next
    }

    /// Lamport clock.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Author.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Author's signature over the entry fields.
    pub fn signature(&self) -> &Signature {
        &self.sig
    }

    /// Traversal order: clock, then hash. Larger sorts newer.
    pub fn cmp_order(&self, other: &Entry) -> Ordering {
        self.clock
            .cmp(&other.clock)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Entry {}

#[cfg(test)]
mod tests {
    use super::*;

    async fn signed_entry(identities: &Identities, identity: &Identity) -> Entry {
        Entry::create(
            identities,
            identity,
            "log-A",
            Operation::add(Value::Text("hello".into())),
            Vec::new(),
            Clock::new(identity.public_key.to_hex(), 1),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_and_decode() {
        let identities = Identities::new();
        let identity = identities.create_identity("userA").await.unwrap();
        let entry = signed_entry(&identities, &identity).await;

        assert_eq!(entry.hash().len(), 64);
        assert_eq!(entry.log_id(), "log-A");
        assert_eq!(entry.payload().op, OpKind::Add);

        let decoded = Entry::from_bytes(entry.bytes()).unwrap();
        assert_eq!(decoded.hash(), entry.hash());
        assert_eq!(decoded.payload(), entry.payload());
        assert_eq!(decoded.identity(), entry.identity());
        decoded.verify(&Identities::new()).await.unwrap();
    }

    #[tokio::test]
    async fn tampered_payload_fails_signature() {
        let identities = Identities::new();
        let identity = identities.create_identity("userA").await.unwrap();
        let mut entry = signed_entry(&identities, &identity).await;

        entry.payload = Operation::add(Value::Text("forged".into()));
        let bytes = codec::encode(&entry).unwrap();
        let forged = Entry::from_bytes(&bytes).unwrap();

        assert_ne!(forged.hash(), entry.hash());
        let err = forged.verify(&Identities::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::Verification { ref reason, .. } if reason == "invalid signature"));
    }

    #[tokio::test]
    async fn foreign_clock_id_is_rejected() {
        let identities = Identities::new();
        let identity = identities.create_identity("userA").await.unwrap();
        let entry = Entry::create(
            &identities,
            &identity,
            "log-A",
            Operation::del("k"),
            Vec::new(),
            Clock::new("someone-else", 1),
        )
        .await
        .unwrap();

        assert!(matches!(
            entry.verify(&identities).await,
            Err(CoreError::Verification { .. })
        ));
    }

    #[tokio::test]
    async fn garbage_bytes_are_codec_error() {
        assert!(matches!(
            Entry::from_bytes(&[1, 2, 3, 4, 5]),
            Err(CoreError::Codec { .. })
        ));
    }

    #[test]
    fn operation_constructors() {
        let put = Operation::put("k", Value::Bool(true));
        assert_eq!(put.op, OpKind::Put);
        assert_eq!(put.key.as_deref(), Some("k"));
        assert_eq!(Operation::del("k").value, Value::Null);
    }
}
