//! Collaborator traits.
//!
//! The link layer never owns a socket or the router's long-term secret key.
//! Everything it needs from the surrounding router comes in through these
//! traits, and every callback runs on the network context.

use std::net::SocketAddr;

use super::types::{CloseReason, RouterId};

/// Outbound datagram primitive (`SendTo`). Fire-and-forget.
pub trait DatagramSink: Send {
    /// Hand one datagram to the network. Delivery is not confirmed.
    fn send_to(&self, addr: SocketAddr, datagram: &[u8]);
}

impl<F> DatagramSink for F
where
    F: Fn(SocketAddr, &[u8]) + Send,
{
    fn send_to(&self, addr: SocketAddr, datagram: &[u8]) {
        self(addr, datagram)
    }
}

/// Session lifecycle callbacks registered at construction.
///
/// All methods have empty defaults so a router only implements what it
/// cares about.
///
/// # Example
///
/// ```ignore
/// struct Relay;
///
/// impl LinkHandler for Relay {
///     fn on_message(&mut self, from: &RouterId, payload: &[u8]) {
///         route_onward(from, payload);
///     }
/// }
/// ```
pub trait LinkHandler: Send {
    /// Decrypted application payload from an authenticated peer.
    fn on_message(&mut self, from: &RouterId, payload: &[u8]) {
        let _ = (from, payload);
    }

    /// Session authenticated and keys established.
    fn on_established(&mut self, peer: &RouterId, addr: SocketAddr) {
        let _ = (peer, addr);
    }

    /// Key rotation finished.
    fn on_renegotiated(&mut self, peer: &RouterId, addr: SocketAddr) {
        let _ = (peer, addr);
    }

    /// Session hit its inactivity deadline. Always followed by `on_closed`.
    fn on_timeout(&mut self, addr: SocketAddr, peer: Option<&RouterId>) {
        let _ = (addr, peer);
    }

    /// Session reached `Closed`. Fires exactly once per session.
    fn on_closed(&mut self, addr: SocketAddr, peer: Option<&RouterId>, reason: CloseReason) {
        let _ = (addr, peer, reason);
    }
}

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl LinkHandler for NoopHandler {}
