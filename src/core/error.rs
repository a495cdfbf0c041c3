//! Error types for the IWP link layer.

use thiserror::Error;

/// Errors that can occur when decoding an identity document or wire field.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Invalid encoding.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Unexpected end of data.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Bytes left over after a complete value.
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),

    /// Unsupported version.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),
}

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Signature did not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// Public key bytes are not a valid curve point.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Key agreement produced an all-zero (non-contributory) secret.
    #[error("non-contributory key agreement")]
    NonContributory,

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Sequence counter exhausted - session must terminate.
    #[error("sequence counter exhausted - session must terminate")]
    CounterExhaustion,

    /// Epoch exhausted - session must terminate.
    #[error("epoch exhausted - session must terminate")]
    EpochExhaustion,

    /// Sequence number not above the last accepted one.
    #[error("replay detected")]
    ReplayDetected,

    /// Frame sealed under an epoch this session does not hold keys for.
    #[error("unknown epoch {0}")]
    UnknownEpoch(u32),

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,
}

/// Errors validating an identity document.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContactError {
    /// Document could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Signature does not verify against the embedded key.
    #[error("bad signature")]
    BadSignature,

    /// Document is older than the accepted policy window.
    #[error("expired (age {age_ms} ms)")]
    Expired {
        /// Age of the document in milliseconds.
        age_ms: u64,
    },

    /// Document is stamped too far in the future.
    #[error("timestamp {last_updated} is in the future")]
    FromFuture {
        /// Offending timestamp.
        last_updated: u64,
    },

    /// Document does not belong to the expected identity.
    #[error("identity mismatch")]
    IdentityMismatch,

    /// Document has too many addresses or an oversized field.
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

/// Top-level link layer errors returned to the embedding router.
///
/// Errors caused by remote input never show up here: those end in a silent
/// drop or a closed session.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Local identity material is missing or invalid.
    #[error("local identity unusable: {0}")]
    Identity(#[from] ContactError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Link layer is not started.
    #[error("link layer not running")]
    NotRunning,

    /// No live session for the address.
    #[error("no session for {0}")]
    UnknownSession(std::net::SocketAddr),

    /// Payload exceeds the maximum frame payload.
    #[error("payload of {size} bytes exceeds {max}")]
    PayloadTooLarge {
        /// Offered payload size.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Per-session outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,

    /// Crypto worker pool could not be started.
    #[error("crypto workers failed to start: {0}")]
    WorkerSpawn(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
