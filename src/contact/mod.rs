//! Router contact (identity document)
//!
//! A router contact binds a long-term Ed25519 key to the addresses the router
//! is reachable at. Initiators embed theirs in every handshake; responders
//! verify it on a crypto worker before any key agreement happens.

mod document;
mod identity;

pub use document::*;
pub use identity::*;

/// Identity document provider supplied by the owning router.
///
/// Called whenever a handshake is composed, so a re-announced contact is
/// picked up by the next session without restarting the link.
pub trait ContactProvider: Send + Sync {
    /// The current signed contact of the local router.
    fn local_contact(&self) -> RouterContact;
}
