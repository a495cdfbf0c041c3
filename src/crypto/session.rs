//! Crypto session management with anti-replay protection
//!
//! This module combines all cryptographic primitives into a high-level
//! CryptoSession that handles:
//! - Sealing and opening frames
//! - Nonce management
//! - Strictly monotonic sequence numbers (no reordering tolerance)
//! - Epoch tracking and old-key retention across renegotiation

use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use crate::core::{CryptoError, HASH_SIZE};
use crate::transport::{FrameKind, SealedFrame, SealedHeader};

use super::{
    aead::{decrypt, encrypt, SessionKey},
    handshake::{Role, SessionKeys},
    nonce::{construct_nonce, Direction},
    rekey::{OldKeyRetention, RekeyState},
};

/// The symmetric half of an established session.
pub struct CryptoSession {
    /// Our role (initiator or responder)
    role: Role,
    /// Current send key
    send_key: SessionKey,
    /// Current receive key
    recv_key: SessionKey,
    /// Epoch and sequence counters
    rekey_state: RekeyState,
    /// Previous epoch's receive key for late frames
    old_keys: OldKeyRetention,
    /// Mixed into every renegotiation KDF.
    rekey_auth_key: Zeroizing<[u8; HASH_SIZE]>,
}

impl CryptoSession {
    /// Create a new crypto session after handshake completion.
    pub fn new(role: Role, keys: SessionKeys) -> Self {
        let SessionKeys {
            initiator_key,
            responder_key,
            rekey_auth_key,
        } = keys;
        let (send_key, recv_key) = match role {
            Role::Initiator => (initiator_key, responder_key),
            Role::Responder => (responder_key, initiator_key),
        };

        Self {
            role,
            send_key,
            recv_key,
            rekey_state: RekeyState::new(),
            old_keys: OldKeyRetention::new(),
            rekey_auth_key,
        }
    }

    /// Get the current role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Get the current epoch.
    pub fn epoch(&self) -> u32 {
        self.rekey_state.epoch()
    }

    /// Time since the current epoch's keys were installed.
    pub fn epoch_age(&self, now: Instant) -> Duration {
        self.rekey_state.epoch_age(now)
    }

    /// Last sequence number accepted from the peer.
    pub fn last_accepted(&self) -> u64 {
        self.rekey_state.last_accepted()
    }

    /// Last sequence number sent.
    pub fn last_sent(&self) -> u64 {
        self.rekey_state.last_sent()
    }

    /// Whether another renegotiation is possible.
    pub fn can_rekey(&self) -> bool {
        self.rekey_state.can_rekey()
    }

    /// Copy of the renegotiation authentication key, for off-thread
    /// derivation of the next epoch's keys.
    pub fn rekey_auth_key(&self) -> Zeroizing<[u8; HASH_SIZE]> {
        self.rekey_auth_key.clone()
    }

    fn send_direction(&self) -> Direction {
        Direction::sent_by(self.role)
    }

    fn recv_direction(&self) -> Direction {
        self.send_direction().opposite()
    }

    /// Seal a frame for sending under the current epoch.
    pub fn seal(&mut self, kind: FrameKind, plaintext: &[u8]) -> Result<SealedFrame, CryptoError> {
        let sequence = self.rekey_state.next_send()?;
        let header = SealedHeader {
            kind,
            epoch: self.rekey_state.epoch(),
            sequence,
        };
        let nonce = construct_nonce(header.epoch, self.send_direction(), sequence);
        let ciphertext = encrypt(&self.send_key, &nonce, &header.to_bytes(), plaintext)?;

        Ok(SealedFrame { header, ciphertext })
    }

    /// Open a received frame.
    ///
    /// The sequence check runs BEFORE decryption and the accepted sequence
    /// only advances after the tag verifies, so a replayed or forged frame
    /// never changes session state. A previous-epoch frame only opens while
    /// `now` is inside the old key's retention window.
    pub fn open(&mut self, frame: &SealedFrame, now: Instant) -> Result<Vec<u8>, CryptoError> {
        let header = &frame.header;
        self.rekey_state.check_recv(header.sequence)?;

        self.old_keys.clear_if_expired(now);
        let key = if header.epoch == self.rekey_state.epoch() {
            &self.recv_key
        } else {
            self.old_keys
                .key_for(header.epoch, now)
                .ok_or(CryptoError::UnknownEpoch(header.epoch))?
        };

        let nonce = construct_nonce(header.epoch, self.recv_direction(), header.sequence);
        let plaintext = decrypt(key, &nonce, &header.to_bytes(), &frame.ciphertext)?;

        self.rekey_state.record_recv(header.sequence);
        Ok(plaintext)
    }

    /// Install keys derived for `epoch`, which must be the next epoch.
    ///
    /// The current receive key is retained for `OLD_KEY_RETENTION` from `now`
    /// so frames the peer sealed before switching still open.
    pub fn install_epoch(
        &mut self,
        epoch: u32,
        initiator_key: SessionKey,
        responder_key: SessionKey,
        now: Instant,
    ) -> Result<(), CryptoError> {
        if Some(epoch) != self.rekey_state.epoch().checked_add(1) {
            return Err(CryptoError::UnknownEpoch(epoch));
        }
        let old_epoch = self.rekey_state.epoch();
        self.rekey_state.advance_epoch(now)?;

        let (send_key, recv_key) = match self.role {
            Role::Initiator => (initiator_key, responder_key),
            Role::Responder => (responder_key, initiator_key),
        };
        self.send_key = send_key;
        let old_recv = std::mem::replace(&mut self.recv_key, recv_key);
        self.old_keys.retain(old_epoch, old_recv, now);

        Ok(())
    }
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("role", &self.role)
            .field("epoch", &self.rekey_state.epoch())
            .field("last_sent", &self.rekey_state.last_sent())
            .field("last_accepted", &self.rekey_state.last_accepted())
            .finish_non_exhaustive()
    }
}
