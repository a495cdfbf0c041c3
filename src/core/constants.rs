//! Protocol constants for the IWP link layer.
//!
//! Wire sizes are fixed by the protocol and MUST NOT be changed. Timing values
//! are defaults; most of them can be overridden through `LinkConfig`.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// XChaCha20 nonce size.
pub const AEAD_NONCE_SIZE: usize = 24;

/// Ed25519 / X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Ed25519 signature size.
pub const SIGNATURE_SIZE: usize = 64;

/// BLAKE2s hash output size.
pub const HASH_SIZE: usize = 32;

/// Protocol version carried in every handshake.
pub const PROTOCOL_VERSION: u16 = 0x0001;

/// Identity document format version.
pub const CONTACT_VERSION: u8 = 1;

// =============================================================================
// FRAME KINDS
// =============================================================================

/// Handshake (initiator ephemeral + identity document).
pub const FRAME_KIND_HANDSHAKE: u8 = 0x01;

/// Handshake acknowledgment (responder ephemeral + signature).
pub const FRAME_KIND_HANDSHAKE_ACK: u8 = 0x02;

/// Encrypted application data.
pub const FRAME_KIND_DATA: u8 = 0x03;

/// Encrypted renegotiation request.
pub const FRAME_KIND_REKEY: u8 = 0x04;

/// Encrypted close notification.
pub const FRAME_KIND_CLOSE: u8 = 0x05;

/// Encrypted renegotiation response.
pub const FRAME_KIND_REKEY_ACK: u8 = 0x06;

// =============================================================================
// FRAME SIZES
// =============================================================================

/// Encrypted frame header size (kind + epoch + sequence).
pub const SEALED_HEADER_SIZE: usize = 1 + 4 + 8;

/// Minimum encrypted frame size (header + empty payload + tag).
pub const MIN_SEALED_FRAME_SIZE: usize = SEALED_HEADER_SIZE + AEAD_TAG_SIZE;

/// Handshake header size before the identity document
/// (kind + version + timestamp + responder id + ephemeral + contact length).
pub const HANDSHAKE_HEADER_SIZE: usize = 1 + 2 + 8 + PUBLIC_KEY_SIZE + PUBLIC_KEY_SIZE + 2;

/// Handshake acknowledgment size (kind + ephemeral + signature).
pub const HANDSHAKE_ACK_SIZE: usize = 1 + PUBLIC_KEY_SIZE + SIGNATURE_SIZE;

/// Largest identity document accepted inside a handshake.
pub const MAX_CONTACT_SIZE: usize = 1024;

/// Maximum addresses carried by one identity document.
pub const MAX_CONTACT_ADDRS: usize = 16;

/// Maximum length of a transport dialect tag.
pub const MAX_DIALECT_LEN: usize = 32;

/// Largest application payload a single data frame may carry.
pub const MAX_PAYLOAD_SIZE: usize = 1200;

/// Largest datagram the link layer will parse.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

// =============================================================================
// TIMING CONSTANTS - SESSIONS
// =============================================================================

/// Send a keepalive if no frame was sent for this long.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Consider a session dead after this long without a valid inbound frame.
pub const DEAD_INTERVAL: Duration = Duration::from_secs(60);

/// Handshake retransmission timeout (initial).
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Maximum handshake retransmissions.
pub const HANDSHAKE_MAX_RETRIES: u32 = 5;

/// Maintenance tick cadence used by `LinkService`.
pub const PUMP_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// TIMING CONSTANTS - SECURITY
// =============================================================================

/// Initiate renegotiation after this time.
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

/// Hard limit on messages - MUST terminate session.
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX;

/// Maximum epoch value.
pub const MAX_EPOCH: u32 = u32::MAX;

/// Keep old receive keys for late frames after renegotiation.
pub const OLD_KEY_RETENTION: Duration = Duration::from_secs(5);

/// Identity documents older than this are expired.
pub const CONTACT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Identity documents may be stamped this far in the future.
pub const CONTACT_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

// =============================================================================
// RESOURCE LIMITS
// =============================================================================

/// Default crypto worker count.
pub const DEFAULT_CRYPTO_WORKERS: usize = 2;

/// Default depth of the crypto work queue.
pub const DEFAULT_WORK_QUEUE_DEPTH: usize = 1024;

/// Default bound on sessions that have not authenticated yet.
pub const DEFAULT_MAX_PENDING_HANDSHAKES: usize = 256;

/// Verified handshakes remembered for replay rejection.
pub const HANDSHAKE_REPLAY_CACHE: usize = 4096;

/// Default bound on queued outbound frames per session.
pub const DEFAULT_MAX_QUEUED_FRAMES: usize = 256;

/// Default replay/out-of-order frames tolerated before a session is closed.
pub const DEFAULT_MAX_ANOMALIES: u32 = 8;

/// Default link rank exposed to link selection.
pub const DEFAULT_LINK_RANK: u16 = 2;

// =============================================================================
// NONCE DIRECTION
// =============================================================================

/// Nonce direction: Initiator -> Responder.
pub const NONCE_DIR_INITIATOR: u8 = 0x00;

/// Nonce direction: Responder -> Initiator.
pub const NONCE_DIR_RESPONDER: u8 = 0x01;
