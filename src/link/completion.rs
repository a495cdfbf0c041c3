//! Crypto jobs and the results they post back to the network context.
//!
//! Every job is a plain function over owned inputs. Workers never see the
//! session table; they return a [`Completion`] tagged with the session
//! handle, and the link layer applies it only if that session still exists.

use std::time::Duration;

use tracing::debug;
use zeroize::Zeroizing;

use crate::contact::{BufferSigner, RouterContact};
use crate::core::{
    CloseReason, RouterId, CONTACT_CLOCK_SKEW, HANDSHAKE_ACK_SIZE, HASH_SIZE, PUBLIC_KEY_SIZE,
};
use crate::crypto::{
    ack_signing_payload, derive_rekey_keys, transcript_hash, verify_signature, EphemeralKeypair,
    SessionKey, SessionKeys,
};
use crate::transport::{HandshakeAck, HandshakeMsg};

use super::session::SessionHandle;

/// Result of one crypto job, addressed to the session that queued it.
#[derive(Debug)]
pub struct Completion {
    handle: SessionHandle,
    outcome: Outcome,
}

impl Completion {
    /// Wrap an outcome for `handle`.
    pub fn new(handle: SessionHandle, outcome: Outcome) -> Self {
        Self { handle, outcome }
    }

    /// Session the job ran for.
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub(crate) fn into_parts(self) -> (SessionHandle, Outcome) {
        (self.handle, self.outcome)
    }
}

/// Crypto job results. Failures carry the reason the session should close with.
#[derive(Debug)]
pub enum Outcome {
    /// Responder: handshake signature and identity document checked.
    HandshakeVerified(Result<RouterId, CloseReason>),
    /// Responder: key agreement done and acknowledgment signed.
    ResponderKeys(Result<ResponderKeys, CloseReason>),
    /// Initiator: acknowledgment signature checked; carries the responder's
    /// ephemeral.
    AckVerified(Result<[u8; PUBLIC_KEY_SIZE], CloseReason>),
    /// Initiator: key agreement done.
    InitiatorKeys(Result<SessionKeys, CloseReason>),
    /// Either side: next epoch derived.
    Rekeyed(Result<EpochKeys, CloseReason>),
}

/// Responder's session keys plus the acknowledgment to send.
#[derive(Debug)]
pub struct ResponderKeys {
    /// Initiator identity proven by the handshake.
    pub peer: RouterId,
    /// Derived session keys.
    pub keys: SessionKeys,
    /// Signed `HandshakeAck` datagram.
    pub ack: [u8; HANDSHAKE_ACK_SIZE],
}

/// Keys for the next epoch.
pub struct EpochKeys {
    /// Epoch the keys belong to.
    pub epoch: u32,
    /// Initiator → responder key.
    pub initiator_key: SessionKey,
    /// Responder → initiator key.
    pub responder_key: SessionKey,
    /// Responder's fresh public value, to send back in a `RekeyAck`.
    pub reply: Option<[u8; PUBLIC_KEY_SIZE]>,
}

impl std::fmt::Debug for EpochKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochKeys")
            .field("epoch", &self.epoch)
            .field("reply", &self.reply.is_some())
            .finish_non_exhaustive()
    }
}

/// Check an inbound handshake.
///
/// The handshake must name `local` as responder, be stamped within
/// `handshake_max_age` of `now_ms`, carry a valid identity document, and be
/// signed by that document's key.
pub(crate) fn verify_handshake(
    msg: &HandshakeMsg,
    local: &RouterId,
    now_ms: u64,
    contact_max_age: Duration,
    handshake_max_age: Duration,
) -> Result<RouterId, CloseReason> {
    if msg.responder != *local {
        debug!(expected = %local, got = %msg.responder, "handshake for another router");
        return Err(CloseReason::AuthenticationFailed);
    }
    if !is_fresh(msg.timestamp, now_ms, handshake_max_age) {
        debug!(timestamp = msg.timestamp, now = now_ms, "stale handshake");
        return Err(CloseReason::AuthenticationFailed);
    }

    let contact = RouterContact::decode(&msg.contact).map_err(|e| {
        debug!(error = %e, "undecodable contact in handshake");
        CloseReason::AuthenticationFailed
    })?;
    contact.verify(now_ms, contact_max_age).map_err(|e| {
        debug!(router = %contact.router_id(), error = %e, "contact rejected");
        CloseReason::AuthenticationFailed
    })?;
    verify_signature(contact.router_id(), msg.signed_bytes(), &msg.signature).map_err(|_| {
        debug!(router = %contact.router_id(), "bad handshake signature");
        CloseReason::AuthenticationFailed
    })?;

    Ok(*contact.router_id())
}

/// Whether a handshake stamped `timestamp` may still be answered at `now_ms`.
fn is_fresh(timestamp: u64, now_ms: u64, max_age: Duration) -> bool {
    let max_age = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
    let skew = u64::try_from(CONTACT_CLOCK_SKEW.as_millis()).unwrap_or(u64::MAX);
    timestamp <= now_ms.saturating_add(skew) && now_ms.saturating_sub(timestamp) <= max_age
}

/// Responder key agreement: fresh ephemeral, session keys, signed ack.
pub(crate) fn respond(
    signer: &dyn BufferSigner,
    peer: RouterId,
    handshake: &[u8],
) -> Result<ResponderKeys, CloseReason> {
    let msg = HandshakeMsg::parse(handshake).map_err(|_| CloseReason::ProtocolViolation)?;

    let ephemeral = EphemeralKeypair::generate();
    let public = *ephemeral.public_key();
    let dh = ephemeral.agree(&msg.ephemeral).map_err(|e| {
        debug!(error = %e, "responder key agreement failed");
        CloseReason::CryptoFailure
    })?;

    let transcript = transcript_hash(handshake, &public);
    let keys = SessionKeys::derive(&dh, &transcript).map_err(|_| CloseReason::CryptoFailure)?;

    let ack = HandshakeAck {
        ephemeral: public,
        signature: signer.sign(&ack_signing_payload(handshake, &public)),
    };
    Ok(ResponderKeys {
        peer,
        keys,
        ack: ack.to_bytes(),
    })
}

/// Check the responder's signature on its acknowledgment.
pub(crate) fn verify_ack(handshake: &[u8], ack: &HandshakeAck, responder: &RouterId) -> Result<(), CloseReason> {
    let payload = ack_signing_payload(handshake, &ack.ephemeral);
    verify_signature(responder, &payload, &ack.signature).map_err(|_| {
        debug!(router = %responder, "bad acknowledgment signature");
        CloseReason::AuthenticationFailed
    })
}

/// Initiator key agreement with the responder's ephemeral.
pub(crate) fn initiate(
    ephemeral: EphemeralKeypair,
    handshake: &[u8],
    responder_ephemeral: &[u8; PUBLIC_KEY_SIZE],
) -> Result<SessionKeys, CloseReason> {
    let dh = ephemeral.agree(responder_ephemeral).map_err(|e| {
        debug!(error = %e, "initiator key agreement failed");
        CloseReason::CryptoFailure
    })?;
    let transcript = transcript_hash(handshake, responder_ephemeral);
    SessionKeys::derive(&dh, &transcript).map_err(|_| CloseReason::CryptoFailure)
}

/// Derive `epoch`'s keys from a fresh exchange.
///
/// The initiator passes the ephemeral it sent in its `Rekey`; the responder
/// passes `None` and gets a new public value back to reply with.
pub(crate) fn rekey(
    ephemeral: Option<EphemeralKeypair>,
    remote: &[u8; PUBLIC_KEY_SIZE],
    rekey_auth_key: &Zeroizing<[u8; HASH_SIZE]>,
    epoch: u32,
) -> Result<EpochKeys, CloseReason> {
    let (ephemeral, reply) = match ephemeral {
        Some(ephemeral) => (ephemeral, None),
        None => {
            let ephemeral = EphemeralKeypair::generate();
            let public = *ephemeral.public_key();
            (ephemeral, Some(public))
        }
    };

    let dh = ephemeral
        .agree(remote)
        .map_err(|_| CloseReason::RenegotiationFailed)?;
    let (initiator_key, responder_key) =
        derive_rekey_keys(&dh, rekey_auth_key, epoch).map_err(|_| CloseReason::RenegotiationFailed)?;

    Ok(EpochKeys {
        epoch,
        initiator_key,
        responder_key,
        reply,
    })
}
