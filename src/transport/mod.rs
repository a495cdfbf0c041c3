//! IWP wire codec
//!
//! Framing only: this module parses and encodes datagrams but never touches
//! key material. Signature and AEAD checks belong to the session that owns
//! the source address.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Router (onion relaying)         │
//! ├─────────────────────────────────────────┤
//! │         Link layer (sessions)           │
//! ├─────────────────────────────────────────┤
//! │         Wire codec                      │  ← This module
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```

mod frame;

pub use frame::*;
