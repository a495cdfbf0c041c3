//! Session renegotiation
//!
//! Sessions renegotiate after `rekey_interval`:
//! - Only the handshake initiator starts a renegotiation.
//! - Each side contributes a fresh X25519 value inside a sealed frame.
//! - The epoch advances by one. Sequence numbers keep counting.
//! - Old receive keys are kept for `OLD_KEY_RETENTION` so late frames from
//!   the previous epoch still decrypt.

use std::time::{Duration, Instant};

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::core::{CryptoError, MAX_EPOCH, OLD_KEY_RETENTION, REJECT_AFTER_MESSAGES};

use super::{SessionKey, SESSION_KEY_SIZE};

/// Tracks the current key epoch and the per-direction sequence counters.
#[derive(Debug)]
pub struct RekeyState {
    /// Current epoch number (increments on each renegotiation)
    epoch: u32,
    /// Time when current epoch started
    epoch_start: Instant,
    /// Last sequence number sent (0 = nothing sent yet)
    last_sent: u64,
    /// Last sequence number accepted from the peer
    last_accepted: u64,
}

impl RekeyState {
    /// Create a new rekey state starting at epoch 0.
    pub fn new() -> Self {
        Self {
            epoch: 0,
            epoch_start: Instant::now(),
            last_sent: 0,
            last_accepted: 0,
        }
    }

    /// Get the current epoch.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Time since the current epoch started.
    pub fn epoch_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.epoch_start)
    }

    /// Last sequence number sent.
    pub fn last_sent(&self) -> u64 {
        self.last_sent
    }

    /// Last sequence number accepted from the peer.
    pub fn last_accepted(&self) -> u64 {
        self.last_accepted
    }

    /// Allocate the next outbound sequence number. The first frame carries 1.
    ///
    /// # Errors
    /// Returns `CounterExhaustion` if the counter has reached the hard limit.
    pub fn next_send(&mut self) -> Result<u64, CryptoError> {
        if self.last_sent == REJECT_AFTER_MESSAGES {
            return Err(CryptoError::CounterExhaustion);
        }
        self.last_sent += 1;
        Ok(self.last_sent)
    }

    /// Reject sequence numbers that are not strictly above the last accepted.
    pub fn check_recv(&self, sequence: u64) -> Result<(), CryptoError> {
        if sequence <= self.last_accepted {
            return Err(CryptoError::ReplayDetected);
        }
        Ok(())
    }

    /// Record an authenticated inbound sequence number.
    pub fn record_recv(&mut self, sequence: u64) {
        if sequence > self.last_accepted {
            self.last_accepted = sequence;
        }
    }

    /// Check if we can perform another renegotiation (epoch limit).
    pub fn can_rekey(&self) -> bool {
        self.epoch < MAX_EPOCH
    }

    /// Advance to the next epoch starting at `now`. Sequence counters carry over.
    ///
    /// # Errors
    /// Returns `EpochExhaustion` if the epoch counter has reached the limit.
    pub fn advance_epoch(&mut self, now: Instant) -> Result<(), CryptoError> {
        if self.epoch == MAX_EPOCH {
            return Err(CryptoError::EpochExhaustion);
        }
        self.epoch += 1;
        self.epoch_start = now;
        Ok(())
    }
}

impl Default for RekeyState {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive key of the previous epoch, kept briefly after a renegotiation.
#[derive(Default)]
pub struct OldKeyRetention {
    key: Option<(u32, SessionKey)>,
    retained_at: Option<Instant>,
}

impl OldKeyRetention {
    /// Create a new retention manager with no old key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain the receive key of `epoch`, starting the window at `now`.
    pub fn retain(&mut self, epoch: u32, recv_key: SessionKey, now: Instant) {
        self.key = Some((epoch, recv_key));
        self.retained_at = Some(now);
    }

    /// Get the old receive key for `epoch` if still within the retention window.
    pub fn key_for(&self, epoch: u32, now: Instant) -> Option<&SessionKey> {
        if !self.within_retention_window(now) {
            return None;
        }
        match &self.key {
            Some((retained, key)) if *retained == epoch => Some(key),
            _ => None,
        }
    }

    /// Check if `now` is within the retention window.
    pub fn within_retention_window(&self, now: Instant) -> bool {
        self.retained_at
            .is_some_and(|t| now.saturating_duration_since(t) < OLD_KEY_RETENTION)
    }

    /// Clear the old key if retention has expired.
    pub fn clear_if_expired(&mut self, now: Instant) {
        if self.retained_at.is_some() && !self.within_retention_window(now) {
            self.key = None;
            self.retained_at = None;
        }
    }
}

/// Derive new session keys for `epoch`.
///
/// ```text
/// ikm = ephemeral_dh || rekey_auth_key
/// (new_initiator_key, new_responder_key) = HKDF-Expand(
///     ikm,
///     "iwp v1 rekey" || LE32(epoch),
///     64
/// )
/// ```
///
/// The `rekey_auth_key` comes from the initial handshake, so an attacker
/// holding only a leaked session key cannot compute the next epoch's keys.
pub fn derive_rekey_keys(
    ephemeral_dh: &[u8; 32],
    rekey_auth_key: &[u8; 32],
    epoch: u32,
) -> Result<(SessionKey, SessionKey), CryptoError> {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(ephemeral_dh);
    ikm[32..].copy_from_slice(rekey_auth_key);

    let label = b"iwp v1 rekey";
    let mut info = Vec::with_capacity(label.len() + 4);
    info.extend_from_slice(label);
    info.extend_from_slice(&epoch.to_le_bytes());

    let hk = Hkdf::<Sha256>::from_prk(&ikm).map_err(|_| CryptoError::KeyDerivationFailed)?;
    let mut key_material = [0u8; 64];
    hk.expand(&info, &mut key_material)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;

    let mut initiator_key = [0u8; SESSION_KEY_SIZE];
    let mut responder_key = [0u8; SESSION_KEY_SIZE];
    initiator_key.copy_from_slice(&key_material[..32]);
    responder_key.copy_from_slice(&key_material[32..]);

    ikm.zeroize();
    key_material.zeroize();

    Ok((
        SessionKey::from_bytes(initiator_key),
        SessionKey::from_bytes(responder_key),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rekey_state_new() {
        let state = RekeyState::new();
        assert_eq!(state.epoch(), 0);
        assert_eq!(state.last_sent(), 0);
        assert_eq!(state.last_accepted(), 0);
        assert!(state.can_rekey());
    }

    #[test]
    fn test_sequence_starts_at_one() {
        let mut state = RekeyState::new();
        for i in 1..=10 {
            assert_eq!(state.next_send().unwrap(), i);
        }
        assert_eq!(state.last_sent(), 10);
    }

    #[test]
    fn test_recv_strictly_monotonic() {
        let mut state = RekeyState::new();

        assert!(state.check_recv(0).is_err());
        assert!(state.check_recv(1).is_ok());
        state.record_recv(5);
        assert_eq!(state.last_accepted(), 5);

        assert_eq!(state.check_recv(5), Err(CryptoError::ReplayDetected));
        assert_eq!(state.check_recv(3), Err(CryptoError::ReplayDetected));
        assert!(state.check_recv(6).is_ok());
    }

    #[test]
    fn test_advance_epoch_keeps_sequences() {
        let mut state = RekeyState::new();
        state.next_send().unwrap();
        state.record_recv(4);

        state.advance_epoch(Instant::now()).unwrap();

        assert_eq!(state.epoch(), 1);
        assert_eq!(state.next_send().unwrap(), 2);
        assert!(state.check_recv(4).is_err());
    }

    #[test]
    fn test_counter_exhaustion() {
        let mut state = RekeyState::new();
        state.last_sent = REJECT_AFTER_MESSAGES;
        assert_eq!(state.next_send(), Err(CryptoError::CounterExhaustion));
    }

    #[test]
    fn test_epoch_exhaustion() {
        let mut state = RekeyState::new();
        state.epoch = MAX_EPOCH;
        assert!(!state.can_rekey());
        assert_eq!(state.advance_epoch(Instant::now()), Err(CryptoError::EpochExhaustion));
    }

    #[test]
    fn test_old_key_retention() {
        let now = Instant::now();
        let mut retention = OldKeyRetention::new();
        assert!(retention.key_for(0, now).is_none());
        assert!(!retention.within_retention_window(now));

        retention.retain(3, SessionKey::from_bytes([0x01; SESSION_KEY_SIZE]), now);

        assert!(retention.within_retention_window(now));
        assert!(retention.key_for(3, now).is_some());
        assert!(retention.key_for(2, now).is_none());
    }

    #[test]
    fn test_old_key_expires_at_caller_time() {
        let now = Instant::now();
        let mut retention = OldKeyRetention::new();
        retention.retain(0, SessionKey::from_bytes([0x01; SESSION_KEY_SIZE]), now);

        let almost = now + OLD_KEY_RETENTION - Duration::from_millis(1);
        assert!(retention.key_for(0, almost).is_some());

        let expired = now + OLD_KEY_RETENTION;
        assert!(retention.key_for(0, expired).is_none());
        retention.clear_if_expired(almost);
        assert!(retention.key_for(0, almost).is_some());
        retention.clear_if_expired(expired);
        assert!(!retention.within_retention_window(almost));
    }

    #[test]
    fn test_derive_rekey_keys() {
        let ephemeral_dh = [0x42u8; 32];
        let rekey_auth_key = [0x33u8; 32];

        let (i0, r0) = derive_rekey_keys(&ephemeral_dh, &rekey_auth_key, 0).unwrap();
        let (i1, r1) = derive_rekey_keys(&ephemeral_dh, &rekey_auth_key, 1).unwrap();

        assert_ne!(i0.as_bytes(), i1.as_bytes());
        assert_ne!(r0.as_bytes(), r1.as_bytes());
        assert_ne!(i1.as_bytes(), r1.as_bytes());

        let (i0_again, _) = derive_rekey_keys(&ephemeral_dh, &rekey_auth_key, 0).unwrap();
        assert_eq!(i0.as_bytes(), i0_again.as_bytes());
    }

    #[test]
    fn test_rekey_requires_auth_key() {
        let ephemeral_dh = [0x42u8; 32];

        let (real, _) = derive_rekey_keys(&ephemeral_dh, &[0x01; 32], 1).unwrap();
        let (guess, _) = derive_rekey_keys(&ephemeral_dh, &[0x02; 32], 1).unwrap();

        assert_ne!(real.as_bytes(), guess.as_bytes());
    }
}
