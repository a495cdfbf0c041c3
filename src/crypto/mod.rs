//! IWP cryptographic primitives
//!
//! - Ed25519 router identities and signatures
//! - X25519 single-use ephemerals
//! - BLAKE2s transcript hashing and HKDF-SHA256 key schedule
//! - XChaCha20-Poly1305 frame sealing with strictly monotonic sequences
//! - Epoch-based renegotiation

mod aead;
mod handshake;
mod keys;
mod nonce;
mod rekey;
mod session;

pub use aead::*;
pub use handshake::*;
pub use keys::*;
pub use nonce::*;
pub use rekey::*;
pub use session::*;
