//! Ed25519 key storage.

use crate::error::{CoreError, CoreResult};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use peerlog_storage::{ComposedStorage, LruStorage, MemoryStorage, Storage};
use rand::rngs::OsRng;
use std::sync::Arc;

use super::{PublicKey, Signature};

/// Number of keys the default keystore keeps in its cache tier.
const KEY_CACHE_CAPACITY: usize = 100;

/// Named Ed25519 signing keys.
///
/// Secret keys are stored as their 32 raw bytes under the key id in a
/// [`Storage`]. By default that is an LRU tier in front of an in-memory
/// store; pass a [`peerlog_storage::FileStorage`] (or a composed storage
/// containing one) to keep keys across restarts.
pub struct Keystore {
    storage: Arc<dyn Storage>,
}

impl Keystore {
    /// Creates an in-memory keystore.
    #[must_use]
    pub fn new() -> Self {
        Self::with_storage(Arc::new(ComposedStorage::new(
            Arc::new(LruStorage::with_capacity(KEY_CACHE_CAPACITY)),
            Arc::new(MemoryStorage::new()),
        )))
    }

    /// Creates a keystore on top of `storage`.
    #[must_use]
    pub fn with_storage(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Returns true if a key named `id` exists.
    pub async fn has_key(&self, id: &str) -> CoreResult<bool> {
        Ok(self.storage.get(id).await?.is_some())
    }

    /// Creates a key named `id`, or returns the public half of the existing one.
    pub async fn create_key(&self, id: &str) -> CoreResult<PublicKey> {
        if let Some(existing) = self.get_key(id).await? {
            return Ok(PublicKey::from(existing.verifying_key()));
        }

        let key = SigningKey::generate(&mut OsRng);
        self.storage.put(id, key.to_bytes().to_vec()).await?;
        tracing::debug!(key = id, "created signing key");
        Ok(PublicKey::from(key.verifying_key()))
    }

    /// Imports a secret key under `id`, replacing any existing one.
    pub async fn add_key(&self, id: &str, secret: [u8; SECRET_KEY_LENGTH]) -> CoreResult<PublicKey> {
        let key = SigningKey::from_bytes(&secret);
        self.storage.put(id, secret.to_vec()).await?;
        Ok(PublicKey::from(key.verifying_key()))
    }

    /// Loads the signing key named `id`.
    pub async fn get_key(&self, id: &str) -> CoreResult<Option<SigningKey>> {
        let Some(bytes) = self.storage.get(id).await? else {
            return Ok(None);
        };
        let secret: [u8; SECRET_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::identity(format!("key {id} has invalid length {}", bytes.len())))?;
        Ok(Some(SigningKey::from_bytes(&secret)))
    }

    /// Signs `data` with the key named `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Identity`] if no such key exists.
    pub async fn sign(&self, id: &str, data: &[u8]) -> CoreResult<Signature> {
        let key = self
            .get_key(id)
            .await?
            .ok_or_else(|| CoreError::identity(format!("no signing key for {id}")))?;
        Ok(Signature::from(key.sign(data)))
    }

    /// Closes the underlying storage.
    pub async fn close(&self) -> CoreResult<()> {
        self.storage.close().await?;
        Ok(())
    }
}

impl Default for Keystore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Keystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystore").finish_non_exhaustive()
    }
}

/// Verifies an Ed25519 signature made by `key` over `data`.
pub(crate) fn verify_signature(key: &PublicKey, data: &[u8], signature: &Signature) -> bool {
    use ed25519_dalek::Verifier;

    let Ok(verifying) = VerifyingKey::from_bytes(key.as_bytes()) else {
        return false;
    };
    let Ok(signature) = ed25519_dalek::Signature::from_slice(signature.as_bytes()) else {
        return false;
    };
    verifying.verify(data, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_key_is_idempotent() {
        let keystore = Keystore::new();
        assert!(!keystore.has_key("userA").await.unwrap());

        let first = keystore.create_key("userA").await.unwrap();
        let second = keystore.create_key("userA").await.unwrap();

        assert_eq!(first, second);
        assert!(keystore.has_key("userA").await.unwrap());
    }

    #[tokio::test]
    async fn sign_and_verify() {
        let keystore = Keystore::new();
        let public = keystore.create_key("userA").await.unwrap();

        let signature = keystore.sign("userA", b"payload").await.unwrap();
        assert!(verify_signature(&public, b"payload", &signature));
        assert!(!verify_signature(&public, b"tampered", &signature));
    }

    #[tokio::test]
    async fn sign_with_missing_key_fails() {
        let keystore = Keystore::new();
        let result = keystore.sign("nobody", b"payload").await;
        assert!(matches!(result, Err(CoreError::Identity { .. })));
    }

    #[tokio::test]
    async fn imported_key_signs_deterministically() {
        let keystore = Keystore::new();
        let public = keystore.add_key("fixed", [7u8; 32]).await.unwrap();

        let a = keystore.sign("fixed", b"x").await.unwrap();
        let b = keystore.sign("fixed", b"x").await.unwrap();
        assert_eq!(a, b);
        assert!(verify_signature(&public, b"x", &a));
    }

    #[tokio::test]
    async fn keys_survive_reopen_with_file_storage() {
        use peerlog_storage::FileStorage;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.log");

        let public = {
            let keystore = Keystore::with_storage(Arc::new(FileStorage::open(&path).unwrap()));
            let public = keystore.create_key("userA").await.unwrap();
            keystore.close().await.unwrap();
            public
        };

        let keystore = Keystore::with_storage(Arc::new(FileStorage::open(&path).unwrap()));
        assert_eq!(keystore.create_key("userA").await.unwrap(), public);
    }
}
