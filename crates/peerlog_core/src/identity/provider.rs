//! Identity providers.

use super::keystore::{verify_signature, Keystore};
use super::{Identity, PublicKey, Signature};
use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;

/// Type name of [`PublicKeyProvider`].
pub const PUBLIC_KEY_PROVIDER: &str = "publickey";

/// A source of identity ids and identity proofs.
///
/// The provider decides what an identity id *is* (a public key, an account
/// name, an external credential) and how the binding between that id and the
/// entry signing key is proven. [`super::Identities`] picks a provider by
/// [`IdentityProvider::kind`].
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Type name stored in every identity this provider creates.
    fn kind(&self) -> &str;

    /// Resolves the identity id for the caller supplied `id`.
    async fn get_id(&self, id: &str, keystore: &Keystore) -> CoreResult<String>;

    /// Signs the identity proof `data` on behalf of `id`.
    async fn sign_identity(&self, data: &[u8], id: &str, keystore: &Keystore)
        -> CoreResult<Signature>;

    /// Checks the proof carried by `identity`.
    async fn verify_identity(&self, identity: &Identity) -> CoreResult<bool>;
}

/// The default provider: the identity id is the hex public key of a keystore
/// key named after the caller's id, and that key signs the proof.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublicKeyProvider;

#[async_trait]
impl IdentityProvider for PublicKeyProvider {
    fn kind(&self) -> &str {
        PUBLIC_KEY_PROVIDER
    }

    async fn get_id(&self, id: &str, keystore: &Keystore) -> CoreResult<String> {
        Ok(keystore.create_key(id).await?.to_hex())
    }

    async fn sign_identity(
        &self,
        data: &[u8],
        id: &str,
        keystore: &Keystore,
    ) -> CoreResult<Signature> {
        keystore.sign(id, data).await
    }

    async fn verify_identity(&self, identity: &Identity) -> CoreResult<bool> {
        let Ok(id_key) = PublicKey::from_hex(&identity.id) else {
            return Ok(false);
        };
        let proof = identity.proof_bytes()?;
        Ok(verify_signature(&id_key, &proof, &identity.signature))
    }
}

impl PublicKeyProvider {
    /// Returns the provider as a trait object.
    pub fn shared() -> std::sync::Arc<dyn IdentityProvider> {
        std::sync::Arc::new(Self)
    }
}

/// Error for an identity type with no registered provider.
pub(crate) fn unknown_provider(kind: &str) -> CoreError {
    CoreError::identity(format!("identity provider '{kind}' is not registered"))
}
