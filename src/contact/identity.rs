//! The local router's identity as seen by the link layer.

use crate::core::{ContactError, RouterId, SIGNATURE_SIZE};
use crate::crypto::IdentityKeypair;

use super::{now_millis, AddressInfo, ContactProvider, RouterContact};

/// Signing callback supplied by the owning router.
///
/// Produces a signature over a caller-provided buffer with the local
/// long-term key, so the key itself never enters the link layer.
pub trait BufferSigner: Send + Sync {
    /// Identity whose key produces the signatures.
    fn router_id(&self) -> RouterId;

    /// Sign `buf` with the long-term identity key.
    fn sign(&self, buf: &[u8]) -> [u8; SIGNATURE_SIZE];
}

/// An identity keypair bundled with its self-signed contact.
///
/// Implements both [`BufferSigner`] and [`ContactProvider`], which is what
/// tests and simple embeddings hand to the link layer.
#[derive(Debug)]
pub struct LocalIdentity {
    keypair: IdentityKeypair,
    contact: RouterContact,
}

impl LocalIdentity {
    /// Sign a contact for `keypair` advertising `addrs`, stamped now.
    pub fn new(keypair: IdentityKeypair, addrs: Vec<AddressInfo>) -> Result<Self, ContactError> {
        Self::with_timestamp(keypair, addrs, now_millis())
    }

    /// Fresh random identity advertising `addrs`.
    pub fn generate(addrs: Vec<AddressInfo>) -> Result<Self, ContactError> {
        Self::new(IdentityKeypair::generate(), addrs)
    }

    /// Sign a contact with an explicit timestamp (ms since the UNIX epoch).
    pub fn with_timestamp(
        keypair: IdentityKeypair,
        addrs: Vec<AddressInfo>,
        last_updated: u64,
    ) -> Result<Self, ContactError> {
        let contact = RouterContact::sign(&keypair, addrs, last_updated)?;
        Ok(Self { keypair, contact })
    }

    /// Replace the contact with a newer one advertising `addrs`.
    ///
    /// The timestamp always moves forward so peers see it as superseding.
    pub fn reannounce(&mut self, addrs: Vec<AddressInfo>) -> Result<(), ContactError> {
        let last_updated = now_millis().max(self.contact.last_updated() + 1);
        self.contact = RouterContact::sign(&self.keypair, addrs, last_updated)?;
        Ok(())
    }

    /// The current signed contact.
    pub fn contact(&self) -> &RouterContact {
        &self.contact
    }

    /// Identity of this router.
    pub fn router_id(&self) -> RouterId {
        self.keypair.router_id()
    }
}

impl BufferSigner for IdentityKeypair {
    fn router_id(&self) -> RouterId {
        IdentityKeypair::router_id(self)
    }

    fn sign(&self, buf: &[u8]) -> [u8; SIGNATURE_SIZE] {
        IdentityKeypair::sign(self, buf)
    }
}

impl BufferSigner for LocalIdentity {
    fn router_id(&self) -> RouterId {
        self.keypair.router_id()
    }

    fn sign(&self, buf: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.keypair.sign(buf)
    }
}

impl ContactProvider for LocalIdentity {
    fn local_contact(&self) -> RouterContact {
        self.contact.clone()
    }
}
