//! # IWP link layer
//!
//! Authenticated, encrypted datagram sessions between onion routers.
//!
//! The link layer establishes a session per remote address, authenticates the
//! peer's long-term identity during a signed ephemeral handshake, binds the
//! address to that identity, and then carries sealed application payloads
//! with strictly monotonic sequence numbers and periodic key rotation.
//!
//! - **Spoofing resistance**: every inbound frame is attributed through the
//!   address authentication table; an address is bound to at most one live
//!   identity
//! - **No oracles**: nothing is sent back to a peer that has not
//!   authenticated
//! - **DoS containment**: signature checks and key agreement run on a bounded
//!   crypto worker pool, never on the network path
//! - **Single network context**: all session state lives on one task; crypto
//!   results are posted back to it
//!
//! ## Feature Flags
//!
//! - `crypto` (default): Ed25519 identities, X25519, XChaCha20-Poly1305, HKDF
//! - `link` (default): session state machine, worker pool and tokio service
//!
//! ## Modules
//!
//! - [`core`]: constants, errors and collaborator traits (always included)
//! - [`transport`]: wire codec (always included)
//! - [`crypto`]: primitives and the per-session frame cipher
//! - [`contact`]: signed identity documents
//! - [`link`]: link layer, sessions, address table, work queue, service
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use iwp_link::prelude::*;
//!
//! struct Router;
//!
//! impl LinkHandler for Router {
//!     fn on_message(&mut self, from: &RouterId, payload: &[u8]) {
//!         println!("{} bytes from {}", payload.len(), from.short());
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = Arc::new(LocalIdentity::generate(vec![])?);
//! let (service, handle) = LinkService::bind(
//!     "0.0.0.0:1090".parse()?,
//!     LinkConfig::default(),
//!     identity.clone(),
//!     identity,
//!     Router,
//! )
//! .await?;
//! let task = service.spawn();
//!
//! handle.shutdown().await;
//! task.await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Wire codec (always included)
pub mod transport;

// Crypto layer (feature-gated)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod crypto;

// Identity documents (need the crypto layer)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod contact;

// Link layer (feature-gated)
#[cfg(feature = "link")]
#[cfg_attr(docsrs, doc(cfg(feature = "link")))]
pub mod link;

/// Prelude module for convenient imports.
pub mod prelude {
    // Core traits and types
    pub use crate::core::*;

    pub use crate::transport::{Frame, FrameKind};

    #[cfg(feature = "crypto")]
    pub use crate::contact::{AddressInfo, BufferSigner, ContactProvider, LocalIdentity, RouterContact};

    #[cfg(feature = "crypto")]
    pub use crate::crypto::IdentityKeypair;

    #[cfg(feature = "link")]
    pub use crate::link::{
        LinkConfig, LinkConfigBuilder, LinkHandle, LinkLayer, LinkService, SessionHandle,
        SessionState,
    };
}

// Re-export commonly used items at crate root
pub use crate::core::{CloseReason, LinkError, LinkHandler, RouterId};

#[cfg(feature = "link")]
pub use crate::link::{LinkConfig, LinkLayer, LinkService};
