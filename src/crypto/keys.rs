//! Key management
//!
//! - [`IdentityKeypair`]: long-term Ed25519 signing identity of a router.
//! - [`EphemeralKeypair`]: single-use X25519 key agreement value.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::core::{CryptoError, RouterId, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};

/// Ed25519 identity keypair.
///
/// The signing key is zeroized on drop by `ed25519-dalek`.
pub struct IdentityKeypair {
    signing_key: SigningKey,
}

impl IdentityKeypair {
    /// Generate a new random keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from raw secret key bytes.
    pub fn from_bytes(bytes: &[u8; PRIVATE_KEY_SIZE]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// The router identity (public key) of this keypair.
    pub fn router_id(&self) -> RouterId {
        RouterId::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message with this identity.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("router_id", &self.router_id())
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature made by `signer` over `message`.
///
/// Uses strict verification: small-order keys and malleable signatures are
/// rejected.
pub fn verify_signature(
    signer: &RouterId,
    message: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(signer.as_bytes()).map_err(|_| CryptoError::InvalidPublicKey)?;
    let signature = Signature::from_bytes(signature);
    key.verify_strict(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// A single-use X25519 keypair.
///
/// Consumed by [`EphemeralKeypair::agree`]; the secret is zeroized on drop by
/// `x25519-dalek`, so it never outlives the key agreement it was made for.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: [u8; PUBLIC_KEY_SIZE],
}

impl EphemeralKeypair {
    /// Generate a fresh ephemeral keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Get the public value sent to the peer.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// Compute the shared secret with the peer's public value.
    ///
    /// # Errors
    /// Returns `NonContributory` if the peer sent a low-order point.
    pub fn agree(
        self,
        remote_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let remote = PublicKey::from(*remote_public);
        let shared = self.secret.diffie_hellman(&remote);
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

impl std::fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeypair").finish_non_exhaustive()
    }
}

/// Generate a fresh X25519 transport secret for the router's key file.
pub fn generate_transport_secret() -> Zeroizing<[u8; PRIVATE_KEY_SIZE]> {
    Zeroizing::new(StaticSecret::random_from_rng(OsRng).to_bytes())
}
