//! Nonce construction for XChaCha20-Poly1305
//!
//! Nonces are 24 bytes and never repeat under one key: the epoch changes on
//! every renegotiation, the direction separates the two key users, and the
//! sequence number is strictly increasing per direction.
//!
//! ```text
//! [ epoch (4) | direction (1) | zeros (11) | sequence (8) ]
//! ```

use crate::core::{AEAD_NONCE_SIZE, NONCE_DIR_INITIATOR, NONCE_DIR_RESPONDER};

use super::Role;

/// Direction of communication for nonce construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Initiator → Responder (0x00)
    InitiatorToResponder,
    /// Responder → Initiator (0x01)
    ResponderToInitiator,
}

impl Direction {
    /// Direction of frames sent by `role`.
    pub fn sent_by(role: Role) -> Self {
        match role {
            Role::Initiator => Direction::InitiatorToResponder,
            Role::Responder => Direction::ResponderToInitiator,
        }
    }

    /// Get the byte representation.
    pub fn as_byte(self) -> u8 {
        match self {
            Direction::InitiatorToResponder => NONCE_DIR_INITIATOR,
            Direction::ResponderToInitiator => NONCE_DIR_RESPONDER,
        }
    }

    /// Get the opposite direction.
    pub fn opposite(self) -> Self {
        match self {
            Direction::InitiatorToResponder => Direction::ResponderToInitiator,
            Direction::ResponderToInitiator => Direction::InitiatorToResponder,
        }
    }
}

/// Construct a 24-byte XChaCha20-Poly1305 nonce.
pub fn construct_nonce(epoch: u32, direction: Direction, sequence: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[0..4].copy_from_slice(&epoch.to_le_bytes());
    nonce[4] = direction.as_byte();
    nonce[16..24].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_layout() {
        let nonce = construct_nonce(1, Direction::ResponderToInitiator, 42);

        assert_eq!(&nonce[0..4], &1u32.to_le_bytes());
        assert_eq!(nonce[4], 0x01);
        assert_eq!(&nonce[5..16], &[0u8; 11]);
        assert_eq!(&nonce[16..24], &42u64.to_le_bytes());
    }

    #[test]
    fn test_directions_never_share_nonces() {
        let a = construct_nonce(3, Direction::sent_by(Role::Initiator), 9);
        let b = construct_nonce(3, Direction::sent_by(Role::Responder), 9);
        assert_ne!(a, b);
        assert_eq!(
            Direction::sent_by(Role::Initiator).opposite(),
            Direction::sent_by(Role::Responder)
        );
    }
}
