//! Per-peer session state machine.
//!
//! ```text
//! Initial ─┬─> HandshakeSent ─────┐
//!          └─> HandshakeReceived ─┴─> KeyAgreementPending ─> Established <─> Renegotiating
//!
//! any state ─> Closed
//! ```
//!
//! A session only holds state; the link layer decides when to move it along
//! and which crypto jobs to run for it.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::contact::BufferSigner;
use crate::core::{CloseReason, CryptoError, LinkError, RouterId, HANDSHAKE_ACK_SIZE, PUBLIC_KEY_SIZE};
use crate::crypto::{CryptoSession, EphemeralKeypair, Role};
use crate::transport::{FrameKind, HandshakeMsg, SealedFrame};

use super::config::LinkConfig;

/// Handshake/connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, nothing sent or accepted yet.
    Initial,
    /// Outbound: handshake sent, waiting for the acknowledgment.
    HandshakeSent,
    /// Inbound: handshake accepted, identity document under verification.
    HandshakeReceived,
    /// Peer authenticated, ephemeral key agreement running.
    KeyAgreementPending,
    /// Keys established, application data flows.
    Established,
    /// Key rotation in progress; data still flows under the current keys.
    Renegotiating,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Whether the peer has not authenticated yet.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            Self::Initial | Self::HandshakeSent | Self::HandshakeReceived | Self::KeyAgreementPending
        )
    }

    /// Whether session keys are in use.
    pub fn is_established(self) -> bool {
        matches!(self, Self::Established | Self::Renegotiating)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Initial, HandshakeSent | HandshakeReceived) => true,
            (HandshakeSent | HandshakeReceived, KeyAgreementPending) => true,
            (KeyAgreementPending, Established) => true,
            (Established, Renegotiating) => true,
            (Renegotiating, Established) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::HandshakeSent => "handshake-sent",
            Self::HandshakeReceived => "handshake-received",
            Self::KeyAgreementPending => "key-agreement-pending",
            Self::Established => "established",
            Self::Renegotiating => "renegotiating",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Identifies one session instance.
///
/// The generation changes every time a session is created for an address, so
/// a crypto result for a replaced session is recognized as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    addr: SocketAddr,
    generation: u64,
}

impl SessionHandle {
    pub(crate) fn new(addr: SocketAddr, generation: u64) -> Self {
        Self { addr, generation }
    }

    /// Remote address of the session.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Instance number of the session.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// What the maintenance tick should do about an unanswered handshake or
/// `Rekey`.
#[derive(Debug, PartialEq, Eq)]
pub enum Retransmit {
    /// Not due yet.
    Wait,
    /// Resend these bytes.
    Resend(Vec<u8>),
    /// Out of retries, or past the handshake deadline.
    GiveUp,
}

/// Session with one remote peer at one address.
pub struct Session {
    handle: SessionHandle,
    role: Role,
    state: SessionState,
    /// Identity the initiator dialed; set for outbound sessions only.
    target: Option<RouterId>,
    /// Identity proven by the handshake. Never changes once set.
    peer: Option<RouterId>,
    ephemeral: Option<EphemeralKeypair>,
    /// Handshake datagram sent (initiator) or accepted (responder).
    handshake: Vec<u8>,
    /// Timestamp carried by `handshake`, Unix milliseconds.
    handshake_timestamp: u64,
    /// Responder's acknowledgment, kept until the initiator proves it has keys.
    ack: Option<[u8; HANDSHAKE_ACK_SIZE]>,
    crypto: Option<CryptoSession>,
    rekey_ephemeral: Option<EphemeralKeypair>,
    /// Responder: initiator's public value of the renegotiation being answered.
    rekey_remote: Option<[u8; PUBLIC_KEY_SIZE]>,
    /// Responder: sealed `RekeyAck` for that public value, kept until the
    /// initiator uses the new epoch.
    rekey_ack: Option<([u8; PUBLIC_KEY_SIZE], Vec<u8>)>,
    /// Frames already sealed under the epoch being negotiated.
    deferred: Vec<SealedFrame>,
    outbound: VecDeque<Vec<u8>>,
    job_pending: bool,
    retries: u32,
    /// First transmission of the current handshake or `Rekey`.
    attempt_started: Instant,
    /// Latest transmission of it.
    sent_at: Instant,
    renegotiation_started: Option<Instant>,
    last_recv: Instant,
    last_send: Instant,
    anomalies: u32,
}

impl Session {
    /// Outbound session toward `target` at `addr`.
    pub fn outbound(handle: SessionHandle, target: RouterId, now: Instant) -> Self {
        Self::new(handle, Role::Initiator, Some(target), now)
    }

    /// Inbound session created by a handshake from `addr`.
    pub fn inbound(handle: SessionHandle, now: Instant) -> Self {
        Self::new(handle, Role::Responder, None, now)
    }

    /// Inbound session replacing our own unanswered dial to the same router,
    /// when both sides dialed at once and we answer. Keeps the dial target
    /// and the payloads queued for it.
    pub fn answering(handle: SessionHandle, dialed: Session, now: Instant) -> Self {
        let mut session = Self::new(handle, Role::Responder, dialed.target, now);
        session.outbound = dialed.outbound;
        session
    }

    fn new(handle: SessionHandle, role: Role, target: Option<RouterId>, now: Instant) -> Self {
        Self {
            handle,
            role,
            state: SessionState::Initial,
            target,
            peer: None,
            ephemeral: None,
            handshake: Vec::new(),
            handshake_timestamp: 0,
            ack: None,
            crypto: None,
            rekey_ephemeral: None,
            rekey_remote: None,
            rekey_ack: None,
            deferred: Vec::new(),
            outbound: VecDeque::new(),
            job_pending: false,
            retries: 0,
            attempt_started: now,
            sent_at: now,
            renegotiation_started: None,
            last_recv: now,
            last_send: now,
            anomalies: 0,
        }
    }

    /// Handle identifying this session instance.
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Remote address.
    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }

    /// Our role in the handshake.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Authenticated remote identity.
    pub fn peer(&self) -> Option<&RouterId> {
        self.peer.as_ref()
    }

    /// Identity this session was dialed toward.
    pub fn target(&self) -> Option<&RouterId> {
        self.target.as_ref()
    }

    /// Remote identity as far as it is known: verified peer, else dial target.
    pub fn remote(&self) -> Option<&RouterId> {
        self.peer.as_ref().or(self.target.as_ref())
    }

    /// Last sequence number accepted from the peer (0 before any frame).
    pub fn last_accepted(&self) -> u64 {
        self.crypto.as_ref().map_or(0, CryptoSession::last_accepted)
    }

    /// Current key epoch.
    pub fn epoch(&self) -> Option<u32> {
        self.crypto.as_ref().map(CryptoSession::epoch)
    }

    /// Payloads waiting for the session to be established.
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// Anomalies counted so far.
    pub fn anomalies(&self) -> u32 {
        self.anomalies
    }

    /// Whether a crypto job for this session is outstanding.
    pub fn job_pending(&self) -> bool {
        self.job_pending
    }

    pub(crate) fn set_job_pending(&mut self, pending: bool) {
        self.job_pending = pending;
    }

    /// Handshake bytes sent or accepted by this session.
    pub fn handshake_bytes(&self) -> &[u8] {
        &self.handshake
    }

    /// Timestamp of the handshake sent or accepted, Unix milliseconds.
    pub fn handshake_timestamp(&self) -> u64 {
        self.handshake_timestamp
    }

    /// Move to `next` if the transition is legal.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            trace!(addr = %self.addr(), from = %self.state, to = %next, "illegal transition ignored");
            return false;
        }
        trace!(addr = %self.addr(), from = %self.state, to = %next, "session transition");
        self.state = next;
        true
    }

    /// Compose and record the signed handshake (outbound, `Initial` only).
    ///
    /// `timestamp` is the wall clock in Unix milliseconds.
    pub fn compose_handshake(
        &mut self,
        signer: &dyn BufferSigner,
        contact: &[u8],
        timestamp: u64,
        now: Instant,
    ) -> Result<Vec<u8>, LinkError> {
        let target = self
            .target
            .ok_or_else(|| LinkError::Config("inbound session cannot initiate".into()))?;
        if self.state != SessionState::Initial {
            return Err(LinkError::Config(format!("handshake composed in state {}", self.state)));
        }

        let ephemeral = EphemeralKeypair::generate();
        let mut bytes = HandshakeMsg::encode_body(timestamp, &target, ephemeral.public_key(), contact)
            .map_err(|e| LinkError::Config(e.to_string()))?;
        let signature = signer.sign(&bytes);
        bytes.extend_from_slice(&signature);

        self.ephemeral = Some(ephemeral);
        self.handshake = bytes.clone();
        self.handshake_timestamp = timestamp;
        self.start_attempt(now);
        self.transition(SessionState::HandshakeSent);
        Ok(bytes)
    }

    /// Record an inbound handshake (`Initial` only).
    pub fn accept_handshake(&mut self, msg: &HandshakeMsg, now: Instant) -> bool {
        if !self.transition(SessionState::HandshakeReceived) {
            return false;
        }
        self.handshake = msg.as_bytes().to_vec();
        self.handshake_timestamp = msg.timestamp;
        self.last_recv = now;
        true
    }

    /// Record an authenticated step of the handshake.
    pub fn touch(&mut self, now: Instant) {
        self.last_recv = now;
    }

    /// Take the handshake ephemeral for the key agreement job.
    pub fn take_ephemeral(&mut self) -> Option<EphemeralKeypair> {
        self.ephemeral.take()
    }

    fn start_attempt(&mut self, now: Instant) {
        self.retries = 0;
        self.attempt_started = now;
        self.sent_at = now;
        self.last_send = now;
    }

    /// Decide whether to resend the handshake or the renegotiation `Rekey`.
    ///
    /// The timeout doubles with every retransmission. A handshake is resent
    /// byte for byte; a `Rekey` is sealed again with the same public value
    /// and a new sequence number. Either is abandoned once retries run out
    /// or the attempt outlives `handshake_deadline`.
    pub fn retransmit_due(&mut self, now: Instant, config: &LinkConfig) -> Result<Retransmit, CryptoError> {
        let rekey = match (self.state, &self.rekey_ephemeral) {
            (SessionState::HandshakeSent, _) => None,
            (SessionState::Renegotiating, Some(ephemeral)) => Some(*ephemeral.public_key()),
            _ => return Ok(Retransmit::Wait),
        };
        if self.job_pending {
            return Ok(Retransmit::Wait);
        }
        if now.saturating_duration_since(self.attempt_started) >= config.handshake_deadline() {
            return Ok(Retransmit::GiveUp);
        }
        let backoff = config.handshake_timeout.saturating_mul(1u32 << self.retries.min(16));
        if now.saturating_duration_since(self.sent_at) < backoff {
            return Ok(Retransmit::Wait);
        }
        if self.retries >= config.handshake_max_retries {
            return Ok(Retransmit::GiveUp);
        }

        let datagram = match rekey {
            Some(public) => self.seal(FrameKind::Rekey, &public, now)?,
            None => {
                self.last_send = now;
                self.handshake.clone()
            }
        };
        self.retries += 1;
        self.sent_at = now;
        Ok(Retransmit::Resend(datagram))
    }

    /// Install session keys and bind the peer identity.
    ///
    /// Fails if a different identity was already bound.
    pub fn establish(&mut self, peer: RouterId, crypto: CryptoSession, now: Instant) -> bool {
        if self.peer.is_some_and(|bound| bound != peer) {
            return false;
        }
        if !self.transition(SessionState::Established) {
            return false;
        }
        self.peer = Some(peer);
        self.crypto = Some(crypto);
        self.ephemeral = None;
        self.last_recv = now;
        true
    }

    /// Remember the acknowledgment so a retransmitted handshake can be
    /// answered without new crypto work.
    pub fn store_ack(&mut self, ack: [u8; HANDSHAKE_ACK_SIZE]) {
        self.ack = Some(ack);
    }

    /// Stored acknowledgment if `handshake` repeats the accepted one.
    pub fn ack_for(&self, handshake: &[u8]) -> Option<&[u8; HANDSHAKE_ACK_SIZE]> {
        if self.handshake == handshake {
            self.ack.as_ref()
        } else {
            None
        }
    }

    /// Queue an application payload.
    pub fn enqueue(&mut self, payload: Vec<u8>, max_queued: usize) -> Result<(), LinkError> {
        if self.outbound.len() >= max_queued {
            return Err(LinkError::QueueFull);
        }
        self.outbound.push_back(payload);
        Ok(())
    }

    /// Seal every queued payload; empty unless keys are established.
    pub fn flush(&mut self, now: Instant) -> Result<Vec<Vec<u8>>, CryptoError> {
        if !self.state.is_established() {
            return Ok(Vec::new());
        }
        let mut datagrams = Vec::with_capacity(self.outbound.len());
        while let Some(payload) = self.outbound.pop_front() {
            datagrams.push(self.seal(FrameKind::Data, &payload, now)?);
        }
        Ok(datagrams)
    }

    /// Seal one frame under the current keys.
    pub fn seal(&mut self, kind: FrameKind, plaintext: &[u8], now: Instant) -> Result<Vec<u8>, CryptoError> {
        let crypto = self
            .crypto
            .as_mut()
            .ok_or_else(|| CryptoError::HandshakeFailed("no session keys".into()))?;
        let frame = crypto.seal(kind, plaintext)?;
        self.last_send = now;
        Ok(frame.encode())
    }

    /// Open a sealed frame. Activity is only recorded for authentic frames.
    pub fn open(&mut self, frame: &SealedFrame, now: Instant) -> Result<Vec<u8>, CryptoError> {
        let crypto = self
            .crypto
            .as_mut()
            .ok_or_else(|| CryptoError::HandshakeFailed("no session keys".into()))?;
        let plaintext = crypto.open(frame, now)?;
        self.last_recv = now;
        // The initiator has our keys now; retransmitted handshakes are over.
        self.ack = None;
        if frame.header.epoch == crypto.epoch() {
            self.rekey_ack = None;
        }
        Ok(plaintext)
    }

    /// Count a replayed, reordered or wrong-epoch frame.
    ///
    /// Returns true once the threshold is reached.
    pub fn note_anomaly(&mut self, max: u32) -> bool {
        self.anomalies = self.anomalies.saturating_add(1);
        self.anomalies >= max
    }

    /// No authentic inbound frame for longer than `timeout`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_recv) > timeout
    }

    /// Nothing sent for `interval` on an established session.
    pub fn keepalive_due(&self, now: Instant, interval: Duration) -> bool {
        self.state.is_established() && now.saturating_duration_since(self.last_send) >= interval
    }

    /// Initiator whose current epoch is older than `interval`.
    pub fn rekey_due(&self, now: Instant, interval: Duration) -> bool {
        self.role == Role::Initiator
            && self.state == SessionState::Established
            && self
                .crypto
                .as_ref()
                .is_some_and(|c| c.can_rekey() && c.epoch_age(now) >= interval)
    }

    /// Start a renegotiation: seal a `Rekey` frame carrying a fresh ephemeral.
    pub fn begin_renegotiation(&mut self, now: Instant) -> Result<Vec<u8>, CryptoError> {
        let ephemeral = EphemeralKeypair::generate();
        let datagram = self.seal(FrameKind::Rekey, ephemeral.public_key(), now)?;
        self.rekey_ephemeral = Some(ephemeral);
        self.mark_renegotiating(now);
        self.start_attempt(now);
        Ok(datagram)
    }

    /// Responder: start answering the peer's `Rekey` carrying `remote`.
    pub fn answer_renegotiation(&mut self, remote: [u8; PUBLIC_KEY_SIZE], now: Instant) -> bool {
        if !self.mark_renegotiating(now) {
            return false;
        }
        self.rekey_remote = Some(remote);
        self.rekey_ack = None;
        true
    }

    /// Responder: keep the sealed `RekeyAck` so a retransmitted `Rekey` is
    /// answered again.
    pub fn store_rekey_ack(&mut self, datagram: Vec<u8>) {
        if let Some(remote) = self.rekey_remote.take() {
            self.rekey_ack = Some((remote, datagram));
        }
    }

    /// Stored `RekeyAck` if `remote` repeats the answered `Rekey`.
    pub fn rekey_ack_for(&self, remote: &[u8; PUBLIC_KEY_SIZE]) -> Option<&[u8]> {
        match &self.rekey_ack {
            Some((answered, datagram)) if answered == remote => Some(datagram),
            _ => None,
        }
    }

    /// Enter `Renegotiating` and start its deadline.
    pub fn mark_renegotiating(&mut self, now: Instant) -> bool {
        if !self.transition(SessionState::Renegotiating) {
            return false;
        }
        self.renegotiation_started = Some(now);
        true
    }

    /// Take the renegotiation ephemeral once the peer answered.
    pub fn take_rekey_ephemeral(&mut self) -> Option<EphemeralKeypair> {
        self.rekey_ephemeral.take()
    }

    /// Hold a frame sealed under the next epoch until its keys are installed.
    ///
    /// Returns false (and drops the frame) once `max` frames are held.
    pub fn defer(&mut self, frame: SealedFrame, max: usize) -> bool {
        if self.deferred.len() >= max {
            return false;
        }
        self.deferred.push(frame);
        true
    }

    /// Frames held by [`Session::defer`], oldest first.
    pub fn take_deferred(&mut self) -> Vec<SealedFrame> {
        std::mem::take(&mut self.deferred)
    }

    /// Renegotiation has been pending for longer than `deadline`.
    pub fn renegotiation_expired(&self, now: Instant, deadline: Duration) -> bool {
        self.state == SessionState::Renegotiating
            && self
                .renegotiation_started
                .is_some_and(|t| now.saturating_duration_since(t) > deadline)
    }

    /// Keys and renegotiation-auth key for off-thread derivation.
    pub fn crypto(&self) -> Option<&CryptoSession> {
        self.crypto.as_ref()
    }

    /// Install the next epoch's keys and return to `Established`.
    pub fn complete_renegotiation(
        &mut self,
        epoch: u32,
        initiator_key: crate::crypto::SessionKey,
        responder_key: crate::crypto::SessionKey,
        now: Instant,
    ) -> Result<(), CryptoError> {
        let crypto = self
            .crypto
            .as_mut()
            .ok_or_else(|| CryptoError::HandshakeFailed("no session keys".into()))?;
        crypto.install_epoch(epoch, initiator_key, responder_key, now)?;
        self.renegotiation_started = None;
        self.rekey_ephemeral = None;
        self.transition(SessionState::Established);
        Ok(())
    }

    /// Move to `Closed` and drop all key material and queued payloads.
    ///
    /// Returns false if the session was already closed, so the closed
    /// notification fires once.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if !self.transition(SessionState::Closed) {
            return false;
        }
        trace!(addr = %self.addr(), ?reason, dropped = self.outbound.len(), "session closed");
        self.outbound.clear();
        self.deferred.clear();
        self.crypto = None;
        self.ephemeral = None;
        self.rekey_ephemeral = None;
        self.rekey_remote = None;
        self.rekey_ack = None;
        self.ack = None;
        true
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("addr", &self.addr())
            .field("generation", &self.handle.generation)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("queued", &self.outbound.len())
            .finish_non_exhaustive()
    }
}

/// Public value carried in a `Rekey`/`RekeyAck` frame.
pub(crate) fn rekey_public(plaintext: &[u8]) -> Option<[u8; PUBLIC_KEY_SIZE]> {
    plaintext.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::LocalIdentity;
    use crate::crypto::SessionKeys;

    fn handle(generation: u64) -> SessionHandle {
        SessionHandle::new("192.0.2.10:1090".parse().unwrap(), generation)
    }

    fn established_pair(now: Instant) -> (Session, Session) {
        let a = RouterId::from_bytes([1; 32]);
        let b = RouterId::from_bytes([2; 32]);
        let keys = || SessionKeys::derive(&[7; 32], &[9; 32]).unwrap();

        let mut initiator = Session::outbound(handle(1), b, now);
        initiator.transition(SessionState::HandshakeSent);
        initiator.transition(SessionState::KeyAgreementPending);
        assert!(initiator.establish(b, CryptoSession::new(Role::Initiator, keys()), now));

        let mut responder = Session::inbound(handle(2), now);
        responder.transition(SessionState::HandshakeReceived);
        responder.transition(SessionState::KeyAgreementPending);
        assert!(responder.establish(a, CryptoSession::new(Role::Responder, keys()), now));

        (initiator, responder)
    }

    #[test]
    fn test_transition_table() {
        use SessionState::*;
        assert!(Initial.can_transition_to(HandshakeSent));
        assert!(Initial.can_transition_to(HandshakeReceived));
        assert!(HandshakeReceived.can_transition_to(KeyAgreementPending));
        assert!(KeyAgreementPending.can_transition_to(Established));
        assert!(Established.can_transition_to(Renegotiating));
        assert!(Renegotiating.can_transition_to(Established));
        assert!(Renegotiating.can_transition_to(Closed));

        assert!(!Initial.can_transition_to(Established));
        assert!(!HandshakeSent.can_transition_to(Established));
        assert!(!Closed.can_transition_to(Established));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_compose_handshake() {
        let now = Instant::now();
        let identity = LocalIdentity::generate(vec![]).unwrap();
        let target = RouterId::from_bytes([5; 32]);
        let mut session = Session::outbound(handle(1), target, now);

        let bytes = session.compose_handshake(&identity, b"contact", 1_700_000_000_000, now).unwrap();
        let msg = HandshakeMsg::parse(&bytes).unwrap();

        assert_eq!(session.state(), SessionState::HandshakeSent);
        assert_eq!(msg.responder, target);
        assert_eq!(msg.timestamp, 1_700_000_000_000);
        assert_eq!(session.handshake_timestamp(), 1_700_000_000_000);
        assert_eq!(msg.contact, b"contact");
        assert!(crate::crypto::verify_signature(&identity.router_id(), msg.signed_bytes(), &msg.signature).is_ok());
        assert!(session.take_ephemeral().is_some());

        // Only once.
        assert!(session.compose_handshake(&identity, b"contact", 1_700_000_000_000, now).is_err());
    }

    #[test]
    fn test_inbound_cannot_compose() {
        let now = Instant::now();
        let identity = LocalIdentity::generate(vec![]).unwrap();
        let mut session = Session::inbound(handle(1), now);
        assert!(session.compose_handshake(&identity, b"", 0, now).is_err());
    }

    #[test]
    fn test_retransmit_backoff_then_give_up() {
        let now = Instant::now();
        let identity = LocalIdentity::generate(vec![]).unwrap();
        let config = LinkConfig {
            handshake_timeout: Duration::from_millis(100),
            handshake_max_retries: 2,
            ..LinkConfig::default()
        };
        let mut session = Session::outbound(handle(1), RouterId::from_bytes([5; 32]), now);
        let sent = session.compose_handshake(&identity, b"", 0, now).unwrap();

        assert_eq!(session.retransmit_due(now + Duration::from_millis(50), &config).unwrap(), Retransmit::Wait);

        let t1 = now + Duration::from_millis(100);
        assert_eq!(session.retransmit_due(t1, &config).unwrap(), Retransmit::Resend(sent.clone()));
        // second timeout is doubled
        assert_eq!(session.retransmit_due(t1 + Duration::from_millis(150), &config).unwrap(), Retransmit::Wait);
        let t2 = t1 + Duration::from_millis(200);
        assert_eq!(session.retransmit_due(t2, &config).unwrap(), Retransmit::Resend(sent));

        let t3 = t2 + Duration::from_millis(400);
        assert_eq!(session.retransmit_due(t3, &config).unwrap(), Retransmit::GiveUp);
    }

    #[test]
    fn test_default_handshake_abandoned_by_inactivity_timeout() {
        let start = Instant::now();
        let identity = LocalIdentity::generate(vec![]).unwrap();
        let config = LinkConfig::default();
        let mut session = Session::outbound(handle(1), RouterId::from_bytes([5; 32]), start);
        session.compose_handshake(&identity, b"", 0, start).unwrap();

        let mut resent = 0;
        for second in 1..60 {
            match session.retransmit_due(start + Duration::from_secs(second), &config).unwrap() {
                Retransmit::Resend(_) => resent += 1,
                Retransmit::Wait => {}
                Retransmit::GiveUp => panic!("gave up after {second}s"),
            }
        }
        assert_eq!(resent, 5);

        let at_timeout = start + config.inactivity_timeout;
        assert_eq!(session.retransmit_due(at_timeout, &config).unwrap(), Retransmit::GiveUp);
    }

    #[test]
    fn test_rekey_resealed_on_backoff() {
        let now = Instant::now();
        let config = LinkConfig {
            handshake_timeout: Duration::from_millis(100),
            handshake_max_retries: 2,
            ..LinkConfig::default()
        };
        let (mut initiator, mut responder) = established_pair(now);

        let first = initiator.begin_renegotiation(now).unwrap();
        assert_eq!(initiator.retransmit_due(now + Duration::from_millis(50), &config).unwrap(), Retransmit::Wait);
        let Retransmit::Resend(again) = initiator.retransmit_due(now + Duration::from_millis(100), &config).unwrap() else {
            panic!("rekey not resent");
        };

        let first = SealedFrame::parse(&first).unwrap();
        let again = SealedFrame::parse(&again).unwrap();
        assert_eq!(again.header.kind, FrameKind::Rekey);
        assert!(again.header.sequence > first.header.sequence);
        assert_eq!(
            responder.open(&first, now).unwrap(),
            responder.open(&again, now).unwrap()
        );

        // Not while the answer is being processed.
        initiator.set_job_pending(true);
        assert_eq!(initiator.retransmit_due(now + Duration::from_secs(1), &config).unwrap(), Retransmit::Wait);
    }

    #[test]
    fn test_rekey_ack_kept_until_new_epoch_is_used() {
        let now = Instant::now();
        let (mut initiator, mut responder) = established_pair(now);
        let remote = [0x42; PUBLIC_KEY_SIZE];

        assert!(responder.answer_renegotiation(remote, now));
        responder.store_rekey_ack(b"sealed rekey ack".to_vec());
        assert_eq!(responder.rekey_ack_for(&remote), Some(&b"sealed rekey ack"[..]));
        assert_eq!(responder.rekey_ack_for(&[0x43; PUBLIC_KEY_SIZE]), None);

        // A frame under the current epoch shows the peer moved on.
        let datagram = initiator.seal(FrameKind::Data, b"", now).unwrap();
        responder.open(&SealedFrame::parse(&datagram).unwrap(), now).unwrap();
        assert_eq!(responder.rekey_ack_for(&remote), None);
    }

    #[test]
    fn test_answering_keeps_dial_target_and_queue() {
        let now = Instant::now();
        let target = RouterId::from_bytes([5; 32]);
        let mut dialed = Session::outbound(handle(1), target, now);
        dialed.enqueue(b"early".to_vec(), 8).unwrap();

        let session = Session::answering(handle(2), dialed, now);
        assert_eq!(session.role(), Role::Responder);
        assert_eq!(session.state(), SessionState::Initial);
        assert_eq!(session.target(), Some(&target));
        assert_eq!(session.queued(), 1);
        assert_eq!(session.handle().generation(), 2);
    }

    #[test]
    fn test_queue_bound() {
        let mut session = Session::inbound(handle(1), Instant::now());
        session.enqueue(vec![1], 2).unwrap();
        session.enqueue(vec![2], 2).unwrap();
        assert!(matches!(session.enqueue(vec![3], 2), Err(LinkError::QueueFull)));
        assert_eq!(session.queued(), 2);
    }

    #[test]
    fn test_flush_only_when_established() {
        let now = Instant::now();
        let (mut initiator, mut responder) = established_pair(now);
        let mut pending = Session::inbound(handle(3), now);

        pending.enqueue(b"early".to_vec(), 8).unwrap();
        assert!(pending.flush(now).unwrap().is_empty());
        assert_eq!(pending.queued(), 1);

        initiator.enqueue(b"hello".to_vec(), 8).unwrap();
        let datagrams = initiator.flush(now).unwrap();
        assert_eq!(datagrams.len(), 1);
        assert_eq!(initiator.queued(), 0);

        let frame = SealedFrame::parse(&datagrams[0]).unwrap();
        assert_eq!(responder.open(&frame, now).unwrap(), b"hello");
        assert_eq!(responder.last_accepted(), 1);
    }

    #[test]
    fn test_peer_identity_never_changes() {
        let now = Instant::now();
        let (mut initiator, _) = established_pair(now);
        let other = RouterId::from_bytes([3; 32]);
        let keys = SessionKeys::derive(&[7; 32], &[9; 32]).unwrap();
        assert!(!initiator.establish(other, CryptoSession::new(Role::Initiator, keys), now));
        assert_eq!(initiator.peer(), Some(&RouterId::from_bytes([2; 32])));
    }

    #[test]
    fn test_renegotiation_deadline() {
        let now = Instant::now();
        let (mut initiator, _) = established_pair(now);

        assert!(initiator.rekey_due(now + Duration::from_secs(10), Duration::from_secs(5)));
        initiator.begin_renegotiation(now).unwrap();
        assert_eq!(initiator.state(), SessionState::Renegotiating);
        assert!(!initiator.rekey_due(now + Duration::from_secs(10), Duration::from_secs(5)));

        assert!(!initiator.renegotiation_expired(now + Duration::from_secs(1), Duration::from_secs(2)));
        assert!(initiator.renegotiation_expired(now + Duration::from_secs(3), Duration::from_secs(2)));
    }

    #[test]
    fn test_responder_never_starts_rekey() {
        let now = Instant::now();
        let (_, responder) = established_pair(now);
        assert!(!responder.rekey_due(now + Duration::from_secs(3600), Duration::from_secs(1)));
    }

    #[test]
    fn test_close_once() {
        let now = Instant::now();
        let (mut initiator, _) = established_pair(now);
        initiator.enqueue(vec![1], 8).unwrap();
        initiator.transition(SessionState::Renegotiating);

        assert!(initiator.close(CloseReason::RenegotiationFailed));
        assert_eq!(initiator.state(), SessionState::Closed);
        assert_eq!(initiator.queued(), 0);
        assert!(initiator.crypto().is_none());
        assert!(!initiator.close(CloseReason::Timeout));
        assert!(!initiator.transition(SessionState::Established));
    }

    #[test]
    fn test_anomaly_threshold() {
        let mut session = Session::inbound(handle(1), Instant::now());
        assert!(!session.note_anomaly(3));
        assert!(!session.note_anomaly(3));
        assert!(session.note_anomaly(3));
    }

    #[test]
    fn test_idle_and_keepalive() {
        let now = Instant::now();
        let (initiator, _) = established_pair(now);
        let later = now + Duration::from_secs(11);
        assert!(initiator.keepalive_due(later, Duration::from_secs(10)));
        assert!(!initiator.is_idle(later, Duration::from_secs(60)));
        assert!(initiator.is_idle(now + Duration::from_secs(61), Duration::from_secs(60)));
    }
}
