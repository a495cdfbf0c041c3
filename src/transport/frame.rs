//! Frame encoding and decoding for the IWP wire protocol.
//!
//! Every datagram starts with a one-byte kind:
//! - Handshake (0x01) and HandshakeAck (0x02) travel in the clear and are
//!   authenticated by Ed25519 signatures.
//! - Data (0x03), Rekey (0x04), Close (0x05) and RekeyAck (0x06) are sealed
//!   with XChaCha20-Poly1305 under the session keys.

use thiserror::Error;

use crate::core::{
    RouterId, AEAD_TAG_SIZE, HANDSHAKE_ACK_SIZE, HANDSHAKE_HEADER_SIZE, MAX_CONTACT_SIZE,
    MAX_DATAGRAM_SIZE, MIN_SEALED_FRAME_SIZE, PROTOCOL_VERSION, PUBLIC_KEY_SIZE,
    SEALED_HEADER_SIZE, SIGNATURE_SIZE,
};

/// Frame kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Initiator ephemeral + signed identity document.
    Handshake = 0x01,
    /// Responder ephemeral + signature over the handshake.
    HandshakeAck = 0x02,
    /// Encrypted application data (empty = keepalive).
    Data = 0x03,
    /// Encrypted renegotiation request.
    Rekey = 0x04,
    /// Encrypted close notification.
    Close = 0x05,
    /// Encrypted renegotiation response.
    RekeyAck = 0x06,
}

impl FrameKind {
    /// Parse frame kind from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Handshake),
            0x02 => Some(Self::HandshakeAck),
            0x03 => Some(Self::Data),
            0x04 => Some(Self::Rekey),
            0x05 => Some(Self::Close),
            0x06 => Some(Self::RekeyAck),
            _ => None,
        }
    }

    /// Convert frame kind to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether frames of this kind are AEAD-sealed.
    pub fn is_sealed(self) -> bool {
        !matches!(self, Self::Handshake | Self::HandshakeAck)
    }
}

/// Frame parsing errors.
///
/// Every parse error ends in a silent drop: nothing is ever sent back to an
/// address whose datagram failed to parse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Empty datagram.
    #[error("empty datagram")]
    Empty,

    /// Frame is too short.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Datagram exceeds the largest frame the link layer parses.
    #[error("datagram of {0} bytes is oversized")]
    Oversized(usize),

    /// Invalid frame kind.
    #[error("invalid frame kind: 0x{0:02x}")]
    InvalidKind(u8),

    /// Handshake speaks another protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// Embedded identity document exceeds `MAX_CONTACT_SIZE`.
    #[error("identity document of {0} bytes is too large")]
    ContactTooLarge(usize),

    /// Declared length disagrees with the datagram.
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Length implied by the header.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },
}

impl FrameError {
    /// Check if this error should result in a silent drop.
    ///
    /// `ContactTooLarge` is also raised while composing a local handshake,
    /// where it is a local configuration problem rather than hostile input.
    pub fn is_silent_drop(&self) -> bool {
        !matches!(self, FrameError::ContactTooLarge(_))
    }
}

/// Handshake message.
///
/// Wire format:
/// ```text
/// +------+---------+-----------+--------------+-----------+-------------+---------+-----------+
/// | Kind | Version | Timestamp | Responder ID | Ephemeral | Contact Len | Contact | Signature |
/// | 1    | 2 (LE)  | 8 (LE)    | 32           | 32        | 2 (LE)      | var     | 64        |
/// +------+---------+-----------+--------------+-----------+-------------+---------+-----------+
/// ```
///
/// The timestamp is the initiator's wall clock in Unix milliseconds. The
/// signature is made with the initiator's long-term key over every
/// preceding byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMsg {
    /// When the initiator composed the handshake, Unix milliseconds.
    pub timestamp: u64,
    /// Identity the initiator expects to reach.
    pub responder: RouterId,
    /// Initiator ephemeral X25519 value.
    pub ephemeral: [u8; PUBLIC_KEY_SIZE],
    /// Encoded identity document of the initiator.
    pub contact: Vec<u8>,
    /// Signature over [`HandshakeMsg::signed_bytes`].
    pub signature: [u8; SIGNATURE_SIZE],
    raw: Vec<u8>,
}

impl HandshakeMsg {
    /// Encode everything the initiator signs.
    pub fn encode_body(
        timestamp: u64,
        responder: &RouterId,
        ephemeral: &[u8; PUBLIC_KEY_SIZE],
        contact: &[u8],
    ) -> Result<Vec<u8>, FrameError> {
        if contact.len() > MAX_CONTACT_SIZE {
            return Err(FrameError::ContactTooLarge(contact.len()));
        }

        let mut buf = Vec::with_capacity(HANDSHAKE_HEADER_SIZE + contact.len() + SIGNATURE_SIZE);
        buf.push(FrameKind::Handshake.as_byte());
        buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        buf.extend_from_slice(&timestamp.to_le_bytes());
        buf.extend_from_slice(responder.as_bytes());
        buf.extend_from_slice(ephemeral);
        buf.extend_from_slice(&(contact.len() as u16).to_le_bytes());
        buf.extend_from_slice(contact);
        Ok(buf)
    }

    /// Parse a handshake from a complete datagram.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let min = HANDSHAKE_HEADER_SIZE + SIGNATURE_SIZE;
        if bytes.len() < min {
            return Err(FrameError::TooShort {
                expected: min,
                actual: bytes.len(),
            });
        }
        if bytes[0] != FrameKind::Handshake.as_byte() {
            return Err(FrameError::InvalidKind(bytes[0]));
        }

        let version = u16::from_le_bytes([bytes[1], bytes[2]]);
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }

        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&bytes[3..11]);
        let mut responder = [0u8; PUBLIC_KEY_SIZE];
        responder.copy_from_slice(&bytes[11..43]);
        let mut ephemeral = [0u8; PUBLIC_KEY_SIZE];
        ephemeral.copy_from_slice(&bytes[43..75]);

        let contact_len = u16::from_le_bytes([bytes[75], bytes[76]]) as usize;
        if contact_len > MAX_CONTACT_SIZE {
            return Err(FrameError::ContactTooLarge(contact_len));
        }
        let expected = HANDSHAKE_HEADER_SIZE + contact_len + SIGNATURE_SIZE;
        if bytes.len() != expected {
            return Err(FrameError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        let contact_end = HANDSHAKE_HEADER_SIZE + contact_len;
        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&bytes[contact_end..]);

        Ok(Self {
            timestamp: u64::from_le_bytes(timestamp),
            responder: RouterId::from_bytes(responder),
            ephemeral,
            contact: bytes[HANDSHAKE_HEADER_SIZE..contact_end].to_vec(),
            signature,
            raw: bytes.to_vec(),
        })
    }

    /// The bytes covered by the initiator's signature.
    pub fn signed_bytes(&self) -> &[u8] {
        &self.raw[..self.raw.len() - SIGNATURE_SIZE]
    }

    /// The complete datagram, as hashed into the transcript.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

/// Handshake acknowledgment.
///
/// Wire format (97 bytes):
/// ```text
/// +------+-----------+-----------+
/// | Kind | Ephemeral | Signature |
/// | 1    | 32        | 64        |
/// +------+-----------+-----------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeAck {
    /// Responder ephemeral X25519 value.
    pub ephemeral: [u8; PUBLIC_KEY_SIZE],
    /// Responder signature over `"iwp-ack" || H(handshake) || ephemeral`.
    pub signature: [u8; SIGNATURE_SIZE],
}

impl HandshakeAck {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_ACK_SIZE] {
        let mut buf = [0u8; HANDSHAKE_ACK_SIZE];
        buf[0] = FrameKind::HandshakeAck.as_byte();
        buf[1..33].copy_from_slice(&self.ephemeral);
        buf[33..].copy_from_slice(&self.signature);
        buf
    }

    /// Parse from a complete datagram.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != HANDSHAKE_ACK_SIZE {
            return Err(FrameError::LengthMismatch {
                expected: HANDSHAKE_ACK_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0] != FrameKind::HandshakeAck.as_byte() {
            return Err(FrameError::InvalidKind(bytes[0]));
        }

        let mut ephemeral = [0u8; PUBLIC_KEY_SIZE];
        ephemeral.copy_from_slice(&bytes[1..33]);
        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&bytes[33..]);

        Ok(Self {
            ephemeral,
            signature,
        })
    }
}

/// Sealed frame header (unencrypted portion, used as AAD).
///
/// Wire format (13 bytes):
/// ```text
/// +--------+----------------+--------------------+
/// | Kind   | Epoch          | Sequence           |
/// | 1 byte | 4 bytes (LE32) | 8 bytes (LE64)     |
/// +--------+----------------+--------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealedHeader {
    /// Frame kind (Data, Rekey, Close or RekeyAck).
    pub kind: FrameKind,
    /// Key epoch the frame was sealed under.
    pub epoch: u32,
    /// Per-direction sequence number, strictly increasing.
    pub sequence: u64,
}

impl SealedHeader {
    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; SEALED_HEADER_SIZE] {
        let mut buf = [0u8; SEALED_HEADER_SIZE];
        buf[0] = self.kind.as_byte();
        buf[1..5].copy_from_slice(&self.epoch.to_le_bytes());
        buf[5..13].copy_from_slice(&self.sequence.to_le_bytes());
        buf
    }

    /// Parse header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < SEALED_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: SEALED_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let kind = FrameKind::from_byte(bytes[0])
            .filter(|kind| kind.is_sealed())
            .ok_or(FrameError::InvalidKind(bytes[0]))?;
        let epoch = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&bytes[5..13]);

        Ok(Self {
            kind,
            epoch,
            sequence: u64::from_le_bytes(sequence),
        })
    }
}

/// A sealed frame: cleartext header plus AEAD ciphertext and tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedFrame {
    /// The unencrypted header (used as AAD).
    pub header: SealedHeader,
    /// Ciphertext with appended 16-byte tag.
    pub ciphertext: Vec<u8>,
}

impl SealedFrame {
    /// Serialize to a datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SEALED_HEADER_SIZE + self.ciphertext.len());
        buf.extend_from_slice(&self.header.to_bytes());
        buf.extend_from_slice(&self.ciphertext);
        buf
    }

    /// Parse from a complete datagram.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < MIN_SEALED_FRAME_SIZE {
            return Err(FrameError::TooShort {
                expected: MIN_SEALED_FRAME_SIZE,
                actual: bytes.len(),
            });
        }
        let header = SealedHeader::from_bytes(bytes)?;
        Ok(Self {
            header,
            ciphertext: bytes[SEALED_HEADER_SIZE..].to_vec(),
        })
    }

    /// Length of the plaintext this frame carries.
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(AEAD_TAG_SIZE)
    }
}

/// Any parsed datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Handshake message.
    Handshake(HandshakeMsg),
    /// Handshake acknowledgment.
    HandshakeAck(HandshakeAck),
    /// Sealed post-handshake frame.
    Sealed(SealedFrame),
}

impl Frame {
    /// Parse a received datagram.
    ///
    /// Only framing is checked here: signatures and AEAD tags are verified
    /// by the session that owns the source address.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(FrameError::Oversized(bytes.len()));
        }
        let first = *bytes.first().ok_or(FrameError::Empty)?;
        match FrameKind::from_byte(first) {
            Some(FrameKind::Handshake) => HandshakeMsg::parse(bytes).map(Frame::Handshake),
            Some(FrameKind::HandshakeAck) => HandshakeAck::parse(bytes).map(Frame::HandshakeAck),
            Some(_) => SealedFrame::parse(bytes).map(Frame::Sealed),
            None => Err(FrameError::InvalidKind(first)),
        }
    }

    /// Kind of this frame.
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Handshake(_) => FrameKind::Handshake,
            Frame::HandshakeAck(_) => FrameKind::HandshakeAck,
            Frame::Sealed(frame) => frame.header.kind,
        }
    }
}
