//! Identities, signing keys and identity providers.
//!
//! An [`Identity`] names the author of log entries. It carries:
//!
//! - `id`: provider specific identifier (for the default provider, the hex
//!   public key of the caller's root key)
//! - `kind`: the provider type that created it (`"publickey"` by default)
//! - `public_key`: the key that signs entries
//! - `signature`: the provider's proof binding `id` to `public_key`
//!
//! [`Identities`] is the registry that creates identities, signs on their
//! behalf and verifies identities and signatures received from peers. It is
//! shared between databases behind an `Arc`.

mod keystore;
mod provider;

pub use keystore::Keystore;
pub use provider::{IdentityProvider, PublicKeyProvider, PUBLIC_KEY_PROVIDER};

use crate::codec;
use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// An Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parses a hex encoded key.
    pub fn from_hex(hex_str: &str) -> CoreResult<Self> {
        let bytes = hex::decode(hex_str).map_err(|e| CoreError::identity(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::identity(format!("public key {hex_str} is not 32 bytes")))?;
        Ok(Self(bytes))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<ed25519_dalek::VerifyingKey> for PublicKey {
    fn from(key: ed25519_dalek::VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Signature bytes. Ed25519 for the built in provider; custom providers may
/// use any scheme they can verify.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Signature {
    /// Wraps raw signature bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<ed25519_dalek::Signature> for Signature {
    fn from(signature: ed25519_dalek::Signature) -> Self {
        Self(signature.to_bytes().to_vec())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0))
    }
}

/// The author of log entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Provider specific identifier.
    pub id: String,
    /// Type of the provider that created this identity.
    #[serde(rename = "type")]
    pub kind: String,
    /// Key that signs entries written by this identity.
    pub public_key: PublicKey,
    /// Provider proof over `(id, kind, public_key)`.
    pub signature: Signature,
}

impl Identity {
    /// Bytes the provider signs to bind `id` to `public_key`.
    pub fn proof_bytes(&self) -> CoreResult<Vec<u8>> {
        codec::encode(&(&self.id, &self.kind, &self.public_key))
    }
}

/// Registry of identity providers over one [`Keystore`].
pub struct Identities {
    keystore: Arc<Keystore>,
    providers: RwLock<HashMap<String, Arc<dyn IdentityProvider>>>,
    verified: RwLock<HashSet<Identity>>,
}

impl Identities {
    /// Creates a registry with an in-memory keystore and the public key provider.
    #[must_use]
    pub fn new() -> Self {
        Self::with_keystore(Arc::new(Keystore::new()))
    }

    /// Creates a registry over an existing keystore.
    #[must_use]
    pub fn with_keystore(keystore: Arc<Keystore>) -> Self {
        let mut providers: HashMap<String, Arc<dyn IdentityProvider>> = HashMap::new();
        providers.insert(PUBLIC_KEY_PROVIDER.to_string(), PublicKeyProvider::shared());
        Self {
            keystore,
            providers: RwLock::new(providers),
            verified: RwLock::new(HashSet::new()),
        }
    }

    /// Returns the keystore.
    pub fn keystore(&self) -> &Arc<Keystore> {
        &self.keystore
    }

    /// Registers `provider` under its [`IdentityProvider::kind`], replacing
    /// any provider of the same type.
    pub fn use_provider(&self, provider: Arc<dyn IdentityProvider>) {
        let kind = provider.kind().to_string();
        tracing::debug!(kind = %kind, "registered identity provider");
        self.providers.write().insert(kind, provider);
    }

    /// Returns true if a provider is registered for `kind`.
    pub fn has_provider(&self, kind: &str) -> bool {
        self.providers.read().contains_key(kind)
    }

    /// Creates an identity for `id` with the public key provider.
    pub async fn create_identity(&self, id: &str) -> CoreResult<Identity> {
        self.create_identity_with(id, PUBLIC_KEY_PROVIDER).await
    }

    /// Creates an identity for `id` with the provider registered for `kind`.
    ///
    /// Creating the same id twice with the same keystore yields equal
    /// identities.
    pub async fn create_identity_with(&self, id: &str, kind: &str) -> CoreResult<Identity> {
        let provider = self.provider(kind)?;

        let identity_id = provider.get_id(id, &self.keystore).await?;
        let public_key = self.keystore.create_key(&identity_id).await?;

        let mut identity = Identity {
            id: identity_id,
            kind: kind.to_string(),
            public_key,
            signature: Signature::default(),
        };
        let proof = identity.proof_bytes()?;
        identity.signature = provider.sign_identity(&proof, id, &self.keystore).await?;

        self.verified.write().insert(identity.clone());
        Ok(identity)
    }

    /// Checks the provider proof of `identity`.
    ///
    /// Identities of an unregistered type never verify.
    pub async fn verify_identity(&self, identity: &Identity) -> CoreResult<bool> {
        if self.verified.read().contains(identity) {
            return Ok(true);
        }

        let provider = match self.provider(&identity.kind) {
            Ok(provider) => provider,
            Err(_) => {
                tracing::warn!(kind = %identity.kind, id = %identity.id, "no provider for identity type");
                return Ok(false);
            }
        };

        let valid = provider.verify_identity(identity).await?;
        if valid {
            self.verified.write().insert(identity.clone());
        }
        Ok(valid)
    }

    /// Signs `data` with the entry key of `identity`.
    ///
    /// # Errors
    ///
    /// Fails if the keystore does not hold that identity's key.
    pub async fn sign(&self, identity: &Identity, data: &[u8]) -> CoreResult<Signature> {
        self.keystore.sign(&identity.id, data).await
    }

    /// Verifies `signature` over `data` against the entry key of `identity`.
    pub fn verify(&self, identity: &Identity, data: &[u8], signature: &Signature) -> bool {
        keystore::verify_signature(&identity.public_key, data, signature)
    }

    fn provider(&self, kind: &str) -> CoreResult<Arc<dyn IdentityProvider>> {
        self.providers
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| provider::unknown_provider(kind))
    }
}

impl Default for Identities {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Identities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.providers.read().keys().cloned().collect();
        kinds.sort();
        f.debug_struct("Identities")
            .field("providers", &kinds)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ed25519_dalek::{Signer, SigningKey};

    /// Provider that proves identities with one fixed authority key.
    struct AuthorityProvider {
        authority: SigningKey,
    }

    impl AuthorityProvider {
        fn new() -> Self {
            Self {
                authority: SigningKey::from_bytes(&[9u8; 32]),
            }
        }
    }

    #[async_trait]
    impl IdentityProvider for AuthorityProvider {
        fn kind(&self) -> &str {
            "authority"
        }

        async fn get_id(&self, id: &str, _keystore: &Keystore) -> CoreResult<String> {
            Ok(format!("authority:{id}"))
        }

        async fn sign_identity(
            &self,
            data: &[u8],
            _id: &str,
            _keystore: &Keystore,
        ) -> CoreResult<Signature> {
            Ok(Signature::from(self.authority.sign(data)))
        }

        async fn verify_identity(&self, identity: &Identity) -> CoreResult<bool> {
            let authority = PublicKey::from(self.authority.verifying_key());
            Ok(keystore::verify_signature(
                &authority,
                &identity.proof_bytes()?,
                &identity.signature,
            ))
        }
    }

    #[tokio::test]
    async fn create_identity_with_default_provider() {
        let identities = Identities::new();
        let identity = identities.create_identity("userA").await.unwrap();

        assert_eq!(identity.kind, "publickey");
        assert_eq!(identity.id.len(), 64);
        assert!(identities.verify_identity(&identity).await.unwrap());
    }

    #[tokio::test]
    async fn same_id_yields_equal_identity() {
        let identities = Identities::new();
        let first = identities.create_identity("abc").await.unwrap();
        let second = identities.create_identity("abc").await.unwrap();
        let other = identities.create_identity("xyz").await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn identity_verifies_on_another_registry() {
        let alice = Identities::new();
        let bob = Identities::new();
        let identity = alice.create_identity("userA").await.unwrap();

        assert!(bob.verify_identity(&identity).await.unwrap());
    }

    #[tokio::test]
    async fn tampered_identity_fails_verification() {
        let alice = Identities::new();
        let bob = Identities::new();
        let mut identity = alice.create_identity("userA").await.unwrap();
        identity.public_key = alice.create_identity("userB").await.unwrap().public_key;

        assert!(!bob.verify_identity(&identity).await.unwrap());
    }

    #[tokio::test]
    async fn custom_provider() {
        let identities = Identities::new();
        assert!(matches!(
            identities.create_identity_with("abc", "authority").await,
            Err(CoreError::Identity { .. })
        ));

        identities.use_provider(Arc::new(AuthorityProvider::new()));
        let identity = identities.create_identity_with("abc", "authority").await.unwrap();
        let again = identities.create_identity_with("abc", "authority").await.unwrap();

        assert_eq!(identity.id, "authority:abc");
        assert_eq!(identity.kind, "authority");
        assert_eq!(identity, again);

        let verifier = Identities::new();
        assert!(!verifier.verify_identity(&identity).await.unwrap());
        verifier.use_provider(Arc::new(AuthorityProvider::new()));
        assert!(verifier.verify_identity(&identity).await.unwrap());
    }

    #[tokio::test]
    async fn sign_and_verify_data() {
        let identities = Identities::new();
        let identity = identities.create_identity("userA").await.unwrap();

        let signature = identities.sign(&identity, b"entry").await.unwrap();
        assert!(identities.verify(&identity, b"entry", &signature));
        assert!(!identities.verify(&identity, b"other", &signature));

        let stranger = Identities::new();
        assert!(stranger.sign(&identity, b"entry").await.is_err());
    }
}
