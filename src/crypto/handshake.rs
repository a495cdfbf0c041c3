//! Handshake key schedule
//!
//! The handshake is a signed ephemeral exchange:
//! 1. Initiator → Responder: `Handshake` (ephemeral + signed identity document)
//! 2. Responder → Initiator: `HandshakeAck` (ephemeral + signature over the
//!    handshake hash)
//!
//! Both sides then hash the transcript and derive the session keys:
//! ```text
//! transcript = BLAKE2s(handshake || responder_ephemeral)
//! (initiator_key, responder_key, rekey_auth_key) = HKDF-SHA256(
//!     salt = transcript,
//!     ikm  = DH(e_initiator, e_responder),
//!     info = "iwp v1 session keys",
//!     96
//! )
//! ```

use blake2::{Blake2s256, Digest};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::core::{CryptoError, HASH_SIZE, PUBLIC_KEY_SIZE};

use super::aead::{SessionKey, SESSION_KEY_SIZE};

const SESSION_KEYS_LABEL: &[u8] = b"iwp v1 session keys";
const ACK_CONTEXT: &[u8] = b"iwp-ack";

/// Role in the handshake (affects which key is used for send/receive)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sent the `Handshake`.
    Initiator,
    /// Answered with a `HandshakeAck`.
    Responder,
}

/// BLAKE2s-256 of `data`.
pub fn hash(data: &[u8]) -> [u8; HASH_SIZE] {
    Blake2s256::digest(data).into()
}

/// Transcript hash both peers bind their session keys to.
pub fn transcript_hash(
    handshake: &[u8],
    responder_ephemeral: &[u8; PUBLIC_KEY_SIZE],
) -> [u8; HASH_SIZE] {
    let mut hasher = Blake2s256::new();
    hasher.update(handshake);
    hasher.update(responder_ephemeral);
    hasher.finalize().into()
}

/// Bytes the responder signs in its `HandshakeAck`.
///
/// ```text
/// "iwp-ack" || BLAKE2s(handshake) || responder_ephemeral
/// ```
pub fn ack_signing_payload(handshake: &[u8], responder_ephemeral: &[u8; PUBLIC_KEY_SIZE]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ACK_CONTEXT.len() + HASH_SIZE + PUBLIC_KEY_SIZE);
    payload.extend_from_slice(ACK_CONTEXT);
    payload.extend_from_slice(&hash(handshake));
    payload.extend_from_slice(responder_ephemeral);
    payload
}

/// Session keys derived once the handshake completes.
pub struct SessionKeys {
    /// Key for initiator → responder frames
    pub initiator_key: SessionKey,
    /// Key for responder → initiator frames
    pub responder_key: SessionKey,
    /// Mixed into every renegotiation so a leaked session key alone cannot
    /// follow the session across epochs.
    pub rekey_auth_key: Zeroizing<[u8; HASH_SIZE]>,
}

impl SessionKeys {
    /// Derive session keys from the ephemeral DH output and transcript hash.
    pub fn derive(dh: &[u8; 32], transcript: &[u8; HASH_SIZE]) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(&transcript[..]), dh);
        let mut key_material = [0u8; 3 * SESSION_KEY_SIZE];
        hk.expand(SESSION_KEYS_LABEL, &mut key_material)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let mut initiator_key = [0u8; SESSION_KEY_SIZE];
        let mut responder_key = [0u8; SESSION_KEY_SIZE];
        let mut rekey_auth_key = Zeroizing::new([0u8; HASH_SIZE]);
        initiator_key.copy_from_slice(&key_material[..32]);
        responder_key.copy_from_slice(&key_material[32..64]);
        rekey_auth_key.copy_from_slice(&key_material[64..]);

        key_material.zeroize();

        Ok(Self {
            initiator_key: SessionKey::from_bytes(initiator_key),
            responder_key: SessionKey::from_bytes(responder_key),
            rekey_auth_key,
        })
    }

    /// Get the send key for the given role.
    pub fn send_key(&self, role: Role) -> &SessionKey {
        match role {
            Role::Initiator => &self.initiator_key,
            Role::Responder => &self.responder_key,
        }
    }

    /// Get the receive key for the given role.
    pub fn recv_key(&self, role: Role) -> &SessionKey {
        match role {
            Role::Initiator => &self.responder_key,
            Role::Responder => &self.initiator_key,
        }
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}
