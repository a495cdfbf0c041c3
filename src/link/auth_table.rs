//! Address authentication table.
//!
//! Maps a network address to the identity authenticated on it. A binding is
//! written only when a session reaches `Established` and removed when that
//! session closes; in between, a different identity cannot take the address.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::core::RouterId;

/// Address → verified identity bindings.
#[derive(Debug, Default)]
pub struct AuthTable {
    bindings: HashMap<SocketAddr, RouterId>,
}

impl AuthTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `addr` to `id`.
    ///
    /// Succeeds if the address is free or already bound to the same
    /// identity; fails if a different identity holds it.
    pub fn bind(&mut self, addr: SocketAddr, id: RouterId) -> bool {
        match self.bindings.get(&addr) {
            Some(existing) if *existing != id => false,
            Some(_) => true,
            None => {
                self.bindings.insert(addr, id);
                true
            }
        }
    }

    /// Remove the binding for `addr`, whoever holds it.
    pub fn unbind(&mut self, addr: &SocketAddr) -> Option<RouterId> {
        self.bindings.remove(addr)
    }

    /// Identity bound to `addr`.
    pub fn lookup(&self, addr: &SocketAddr) -> Option<&RouterId> {
        self.bindings.get(addr)
    }

    /// Whether `addr` is bound to exactly `id`.
    pub fn is_bound_to(&self, addr: &SocketAddr, id: &RouterId) -> bool {
        self.bindings.get(addr) == Some(id)
    }

    /// Address `id` is bound on, if any.
    pub fn addr_of(&self, id: &RouterId) -> Option<SocketAddr> {
        self.bindings
            .iter()
            .find_map(|(addr, bound)| (bound == id).then_some(*addr))
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
