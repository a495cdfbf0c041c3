//! The link layer: session table, inbound demultiplexer and maintenance tick.
//!
//! Everything here runs on one network context. Crypto work leaves through
//! the [`WorkQueue`] and comes back as [`Completion`]s, which the owner feeds
//! to [`LinkLayer::handle_completion`]; no other path touches session or
//! address state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use zeroize::Zeroizing;

use crate::contact::{now_millis, BufferSigner, ContactProvider, RouterContact};
use crate::core::{
    CloseReason, ContactError, CryptoError, DatagramSink, LinkError, LinkHandler, RouterId,
    HANDSHAKE_REPLAY_CACHE, MAX_CONTACT_SIZE, MAX_PAYLOAD_SIZE, PRIVATE_KEY_SIZE, PUMP_INTERVAL,
};
use crate::crypto::{generate_transport_secret, verify_signature, CryptoSession, Role, SessionKeys};
use crate::transport::{Frame, FrameKind, HandshakeAck, HandshakeMsg, SealedFrame};

use super::auth_table::AuthTable;
use super::completion::{
    initiate, rekey, respond, verify_ack, verify_handshake, Completion, EpochKeys, Outcome,
    ResponderKeys,
};
use super::config::LinkConfig;
use super::replay::ReplayCache;
use super::session::{rekey_public, Retransmit, Session, SessionHandle, SessionState};
use super::work_queue::{WorkQueue, WorkQueueError};

const LINK_NAME: &str = "iwp";
const IDENTITY_CHALLENGE: &[u8] = b"iwp link identity challenge";

/// IWP link layer.
///
/// Owns every session, the address authentication table and the crypto
/// worker pool. `H` receives session events; `S` puts datagrams on the wire.
pub struct LinkLayer<H, S>
where
    H: LinkHandler,
    S: DatagramSink,
{
    config: LinkConfig,
    signer: Arc<dyn BufferSigner>,
    contacts: Arc<dyn ContactProvider>,
    handler: H,
    sink: S,
    local: RouterId,
    sessions: HashMap<SocketAddr, Session>,
    auth: AuthTable,
    replays: ReplayCache,
    work: Option<WorkQueue<Completion>>,
    completions: Option<mpsc::Receiver<Completion>>,
    next_generation: u64,
}

impl<H, S> LinkLayer<H, S>
where
    H: LinkHandler,
    S: DatagramSink,
{
    /// Create a stopped link layer.
    pub fn new(
        config: LinkConfig,
        signer: Arc<dyn BufferSigner>,
        contacts: Arc<dyn ContactProvider>,
        handler: H,
        sink: S,
    ) -> Self {
        let local = signer.router_id();
        Self {
            config,
            signer,
            contacts,
            handler,
            sink,
            local,
            sessions: HashMap::new(),
            auth: AuthTable::new(),
            replays: ReplayCache::new(HANDSHAKE_REPLAY_CACHE),
            work: None,
            completions: None,
            next_generation: 0,
        }
    }

    /// Transport name advertised in contacts.
    pub fn name(&self) -> &'static str {
        LINK_NAME
    }

    /// Numeric rank used by link selection.
    pub fn rank(&self) -> u16 {
        self.config.rank
    }

    /// Fresh transport secret for the router's key file.
    pub fn key_gen(&self) -> Zeroizing<[u8; PRIVATE_KEY_SIZE]> {
        generate_transport_secret()
    }

    /// Identity of the local router.
    pub fn local_id(&self) -> &RouterId {
        &self.local
    }

    /// Active configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Event handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Mutable event handler.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Whether [`LinkLayer::start`] succeeded and [`LinkLayer::stop`] has not run.
    pub fn is_running(&self) -> bool {
        self.work.is_some()
    }

    /// Validate configuration and identity, then start the crypto workers.
    ///
    /// Calling it again while running does nothing.
    pub fn start(&mut self) -> Result<(), LinkError> {
        if self.is_running() {
            return Ok(());
        }
        self.config.validate()?;
        self.check_identity()?;

        let (tx, rx) = mpsc::channel(self.config.work_queue_depth);
        let work = WorkQueue::start(self.config.worker_count, self.config.work_queue_depth, tx)
            .map_err(|e| LinkError::WorkerSpawn(e.to_string()))?;

        self.work = Some(work);
        self.completions = Some(rx);
        info!(router = %self.local, workers = self.config.worker_count, "iwp link started");
        Ok(())
    }

    fn check_identity(&self) -> Result<(), LinkError> {
        let contact = self.contacts.local_contact();
        if *contact.router_id() != self.local {
            return Err(ContactError::IdentityMismatch.into());
        }
        contact.verify_signature()?;
        if contact.encode()?.len() > MAX_CONTACT_SIZE {
            return Err(ContactError::LimitExceeded("contact too large for a handshake").into());
        }

        let signature = self.signer.sign(IDENTITY_CHALLENGE);
        verify_signature(&self.local, IDENTITY_CHALLENGE, &signature)
            .map_err(|_| ContactError::BadSignature)?;
        Ok(())
    }

    /// Close every session, drain the completion channel and join the workers.
    ///
    /// Idempotent. Joining waits for jobs already running; async callers
    /// use [`LinkLayer::stop_sessions`] and join the returned pool off the
    /// runtime.
    pub fn stop(&mut self) {
        if let Some(mut work) = self.stop_sessions() {
            work.stop();
        }
    }

    /// Close every session and the completion channel, leaving the worker
    /// pool for the caller to join.
    ///
    /// Returns `None` if the layer was not running.
    pub fn stop_sessions(&mut self) -> Option<WorkQueue<Completion>> {
        let work = self.work.take()?;

        let addrs: Vec<SocketAddr> = self.sessions.keys().copied().collect();
        for addr in addrs {
            self.close(addr, CloseReason::Shutdown);
        }

        // Workers blocked on a full channel see it closed and exit.
        if let Some(mut rx) = self.completions.take() {
            rx.close();
            while rx.try_recv().is_ok() {}
        }
        info!(router = %self.local, "iwp link stopped");
        Some(work)
    }

    /// Start a session toward `peer` at `addr`.
    ///
    /// If a session to `addr` already exists it is returned instead; there is
    /// never more than one session per address.
    pub fn new_outbound_session(
        &mut self,
        peer: RouterId,
        addr: SocketAddr,
    ) -> Result<SessionHandle, LinkError> {
        if !self.is_running() {
            return Err(LinkError::NotRunning);
        }
        if let Some(existing) = self.sessions.get(&addr) {
            trace!(%addr, state = %existing.state(), "reusing session");
            return Ok(existing.handle());
        }

        let contact = self.contacts.local_contact().encode()?;
        let handle = self.next_handle(addr);
        let now = Instant::now();
        let mut session = Session::outbound(handle, peer, now);
        let datagram = session.compose_handshake(self.signer.as_ref(), &contact, now_millis(), now)?;

        self.sessions.insert(addr, session);
        self.sink.send_to(addr, &datagram);
        debug!(%addr, router = %peer, "handshake sent");
        Ok(handle)
    }

    /// Entry point for every inbound datagram.
    ///
    /// Nothing is ever sent back for input that does not authenticate.
    pub fn recv_from(&mut self, addr: SocketAddr, datagram: &[u8]) {
        if !self.is_running() {
            return;
        }
        let frame = match Frame::parse(datagram) {
            Ok(frame) => frame,
            Err(e) if e.is_silent_drop() => {
                trace!(%addr, error = %e, "malformed datagram dropped");
                return;
            }
            Err(e) => {
                debug!(%addr, error = %e, "oversized handshake dropped");
                return;
            }
        };

        let now = Instant::now();
        match frame {
            Frame::Handshake(msg) => self.on_handshake(addr, msg, now),
            Frame::HandshakeAck(ack) => self.on_ack(addr, ack),
            Frame::Sealed(frame) => self.on_sealed(addr, frame, now),
        }
    }

    /// Maintenance tick at the current time.
    pub fn pump(&mut self) {
        self.pump_at(Instant::now());
    }

    /// Maintenance tick at `now`.
    ///
    /// Evicts idle sessions, retransmits or abandons unanswered handshakes,
    /// fails stuck renegotiations, starts due rekeys, sends keepalives and
    /// flushes queued payloads.
    pub fn pump_at(&mut self, now: Instant) {
        if !self.is_running() {
            return;
        }
        let addrs: Vec<SocketAddr> = self.sessions.keys().copied().collect();
        for addr in addrs {
            self.maintain(addr, now);
        }
    }

    /// Bind `addr` to `peer` in the address authentication table.
    ///
    /// Fails if a different identity holds the address.
    pub fn map_addr(&mut self, peer: RouterId, addr: SocketAddr) -> bool {
        if self.auth.bind(addr, peer) {
            return true;
        }
        warn!(%addr, router = %peer, holder = ?self.auth.lookup(&addr), "address already bound");
        false
    }

    /// Remove whatever binding `addr` has.
    pub fn unmap_addr(&mut self, addr: &SocketAddr) -> Option<RouterId> {
        self.auth.unbind(addr)
    }

    /// Identity bound to `addr`.
    pub fn bound_identity(&self, addr: &SocketAddr) -> Option<&RouterId> {
        self.auth.lookup(addr)
    }

    /// Submit a crypto job. Never blocks.
    ///
    /// # Errors
    /// `Saturated` when the queue is full, `Stopped` when the link is not
    /// running.
    pub fn queue_work<F>(&self, job: F) -> Result<(), WorkQueueError>
    where
        F: FnOnce() -> Completion + Send + 'static,
    {
        self.work
            .as_ref()
            .ok_or(WorkQueueError::Stopped)?
            .submit(job)
    }

    /// Wait for the next crypto result. `None` once the link is stopped.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        match self.completions.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Apply every crypto result already waiting. Returns how many ran.
    pub fn process_completions(&mut self) -> usize {
        let mut applied = 0;
        while let Some(completion) = self
            .completions
            .as_mut()
            .and_then(|rx| rx.try_recv().ok())
        {
            self.handle_completion(completion);
            applied += 1;
        }
        applied
    }

    /// Apply one crypto result on the network context.
    ///
    /// Results for sessions that closed or were replaced are dropped.
    pub fn handle_completion(&mut self, completion: Completion) {
        let (handle, outcome) = completion.into_parts();
        let addr = handle.addr();
        match self.sessions.get_mut(&addr) {
            Some(session) if session.handle() == handle => session.set_job_pending(false),
            _ => {
                trace!(%addr, generation = handle.generation(), "stale completion dropped");
                return;
            }
        }

        let now = Instant::now();
        match outcome {
            Outcome::HandshakeVerified(Ok(peer)) => self.on_handshake_verified(addr, peer, now),
            Outcome::ResponderKeys(Ok(keys)) => self.on_responder_keys(addr, keys, now),
            Outcome::AckVerified(Ok(ephemeral)) => self.on_ack_verified(addr, ephemeral, now),
            Outcome::InitiatorKeys(Ok(keys)) => self.on_initiator_keys(addr, keys, now),
            Outcome::Rekeyed(Ok(keys)) => self.on_rekeyed(addr, keys, now),
            Outcome::HandshakeVerified(Err(reason))
            | Outcome::ResponderKeys(Err(reason))
            | Outcome::AckVerified(Err(reason))
            | Outcome::InitiatorKeys(Err(reason))
            | Outcome::Rekeyed(Err(reason)) => self.close(addr, reason),
        }
    }

    /// Queue an application payload for the session at `addr`.
    ///
    /// Sent at once when the session is established, otherwise when it
    /// becomes established.
    pub fn send_to(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), LinkError> {
        if !self.is_running() {
            return Err(LinkError::NotRunning);
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(LinkError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let session = self
            .sessions
            .get_mut(&addr)
            .ok_or(LinkError::UnknownSession(addr))?;
        session.enqueue(payload.to_vec(), self.config.max_queued_frames)?;
        if session.state().is_established() {
            self.flush(addr, Instant::now());
        }
        Ok(())
    }

    /// Close the session at `addr`. Returns false if there was none.
    pub fn close_session(&mut self, addr: SocketAddr) -> bool {
        if !self.sessions.contains_key(&addr) {
            return false;
        }
        self.close(addr, CloseReason::LocalClose);
        true
    }

    /// Whether an authenticated session with `peer` exists.
    pub fn has_session_to(&self, peer: &RouterId) -> bool {
        self.auth.addr_of(peer).is_some()
    }

    /// Address of the authenticated session with `peer`.
    pub fn session_addr(&self, peer: &RouterId) -> Option<SocketAddr> {
        self.auth.addr_of(peer)
    }

    /// Session at `addr`.
    pub fn session(&self, addr: &SocketAddr) -> Option<&Session> {
        self.sessions.get(addr)
    }

    /// State of the session at `addr`.
    pub fn session_state(&self, addr: &SocketAddr) -> Option<SessionState> {
        self.sessions.get(addr).map(Session::state)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions that have not authenticated yet.
    pub fn pending_handshakes(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state().is_pending())
            .count()
    }

    fn next_handle(&mut self, addr: SocketAddr) -> SessionHandle {
        self.next_generation += 1;
        SessionHandle::new(addr, self.next_generation)
    }

    fn submit<F>(&mut self, handle: SessionHandle, job: F)
    where
        F: FnOnce() -> Outcome + Send + 'static,
    {
        let addr = handle.addr();
        match self.queue_work(move || Completion::new(handle, job())) {
            Ok(()) => {
                if let Some(session) = self.sessions.get_mut(&addr) {
                    session.set_job_pending(true);
                }
            }
            Err(WorkQueueError::Saturated) => {
                warn!(%addr, "crypto work queue saturated, shedding session");
                self.close(addr, CloseReason::Overloaded);
            }
            Err(e) => {
                debug!(%addr, error = %e, "crypto job not queued");
                self.close(addr, CloseReason::Shutdown);
            }
        }
    }

    fn on_handshake(&mut self, addr: SocketAddr, msg: HandshakeMsg, now: Instant) {
        let mut yielding = false;
        if let Some(session) = self.sessions.get(&addr) {
            // Our acknowledgment was lost; answer the same handshake again.
            if let Some(ack) = session.ack_for(msg.as_bytes()) {
                let ack = *ack;
                self.sink.send_to(addr, &ack);
                trace!(%addr, "acknowledgment resent");
                return;
            }
            if !self.config.permit_inbound || !yields_to(session, &msg, &self.local) {
                trace!(%addr, state = %session.state(), "handshake for live session dropped");
                return;
            }
            yielding = true;
        }

        if self.replays.is_replay(msg.as_bytes(), msg.timestamp) {
            debug!(%addr, "replayed handshake dropped");
            return;
        }
        if !self.config.permit_inbound {
            trace!(%addr, "inbound handshake dropped, inbound sessions disabled");
            return;
        }
        if !yielding && self.pending_handshakes() >= self.config.max_pending_handshakes {
            debug!(%addr, limit = self.config.max_pending_handshakes, "half-open limit reached, handshake dropped");
            return;
        }

        let dialed = if yielding {
            debug!(%addr, "both sides dialed, answering the peer's handshake");
            self.sessions.remove(&addr)
        } else {
            None
        };
        let handle = self.next_handle(addr);
        let mut session = match dialed {
            Some(dialed) => Session::answering(handle, dialed, now),
            None => Session::inbound(handle, now),
        };
        session.accept_handshake(&msg, now);
        self.sessions.insert(addr, session);
        trace!(%addr, "handshake accepted for verification");

        let local = self.local;
        let contact_max_age = self.config.contact_max_age;
        let handshake_max_age = self.config.handshake_max_age();
        self.submit(handle, move || {
            Outcome::HandshakeVerified(verify_handshake(
                &msg,
                &local,
                now_millis(),
                contact_max_age,
                handshake_max_age,
            ))
        });
    }

    fn on_handshake_verified(&mut self, addr: SocketAddr, peer: RouterId, now: Instant) {
        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        if session.target().is_some_and(|target| *target != peer) {
            debug!(%addr, router = %peer, "answered handshake came from another router");
            self.close(addr, CloseReason::AuthenticationFailed);
            return;
        }
        let handshake = session.handshake_bytes().to_vec();
        let fresh = self.replays.insert(
            &handshake,
            session.handshake_timestamp(),
            now_millis(),
            self.config.handshake_max_age(),
        );
        if !fresh {
            debug!(%addr, router = %peer, "replayed handshake rejected");
            self.close(addr, CloseReason::AuthenticationFailed);
            return;
        }
        if !session.transition(SessionState::KeyAgreementPending) {
            return;
        }
        session.touch(now);
        let handle = session.handle();
        let signer = Arc::clone(&self.signer);
        self.submit(handle, move || {
            Outcome::ResponderKeys(respond(signer.as_ref(), peer, &handshake))
        });
    }

    fn on_responder_keys(&mut self, addr: SocketAddr, keys: ResponderKeys, now: Instant) {
        let ResponderKeys { peer, keys, ack } = keys;
        if self.session_state(&addr) != Some(SessionState::KeyAgreementPending) {
            return;
        }
        if !self.map_addr(peer, addr) {
            self.close(addr, CloseReason::AddressConflict);
            return;
        }

        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        if !session.establish(peer, CryptoSession::new(Role::Responder, keys), now) {
            self.auth.unbind(&addr);
            self.close(addr, CloseReason::ProtocolViolation);
            return;
        }
        session.store_ack(ack);
        self.sink.send_to(addr, &ack);

        debug!(%addr, router = %peer, "inbound session established");
        self.handler.on_established(&peer, addr);
        self.flush(addr, now);
    }

    fn on_ack(&mut self, addr: SocketAddr, ack: HandshakeAck) {
        let Some(session) = self.sessions.get(&addr) else {
            trace!(%addr, "acknowledgment without session dropped");
            return;
        };
        if session.role() != Role::Initiator
            || session.state() != SessionState::HandshakeSent
            || session.job_pending()
        {
            trace!(%addr, state = %session.state(), "unexpected acknowledgment dropped");
            return;
        }
        let Some(responder) = session.target().copied() else {
            return;
        };

        let handle = session.handle();
        let handshake = session.handshake_bytes().to_vec();
        self.submit(handle, move || {
            Outcome::AckVerified(verify_ack(&handshake, &ack, &responder).map(|()| ack.ephemeral))
        });
    }

    fn on_ack_verified(&mut self, addr: SocketAddr, responder_ephemeral: [u8; 32], now: Instant) {
        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        if !session.transition(SessionState::KeyAgreementPending) {
            return;
        }
        session.touch(now);
        let Some(ephemeral) = session.take_ephemeral() else {
            self.close(addr, CloseReason::CryptoFailure);
            return;
        };

        let handle = session.handle();
        let handshake = session.handshake_bytes().to_vec();
        self.submit(handle, move || {
            Outcome::InitiatorKeys(initiate(ephemeral, &handshake, &responder_ephemeral))
        });
    }

    fn on_initiator_keys(&mut self, addr: SocketAddr, keys: SessionKeys, now: Instant) {
        let Some(session) = self.sessions.get(&addr) else {
            return;
        };
        let Some(peer) = session.target().copied() else {
            return;
        };
        if session.state() != SessionState::KeyAgreementPending {
            return;
        }
        if !self.map_addr(peer, addr) {
            self.close(addr, CloseReason::AddressConflict);
            return;
        }

        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        if !session.establish(peer, CryptoSession::new(Role::Initiator, keys), now) {
            self.auth.unbind(&addr);
            self.close(addr, CloseReason::ProtocolViolation);
            return;
        }

        debug!(%addr, router = %peer, "outbound session established");
        self.handler.on_established(&peer, addr);
        self.flush(addr, now);
    }

    fn on_sealed(&mut self, addr: SocketAddr, frame: SealedFrame, now: Instant) {
        let max_anomalies = self.config.max_anomalies;
        let max_deferred = self.config.max_queued_frames;

        let Some(session) = self.sessions.get_mut(&addr) else {
            trace!(%addr, "sealed frame without session dropped");
            return;
        };
        if !session.state().is_established() {
            trace!(%addr, state = %session.state(), "sealed frame before keys dropped");
            return;
        }
        let Some(peer) = session.peer().copied() else {
            return;
        };
        if !self.auth.is_bound_to(&addr, &peer) {
            warn!(%addr, router = %peer, "session identity disagrees with address table");
            self.close(addr, CloseReason::ProtocolViolation);
            return;
        }

        let kind = frame.header.kind;
        match session.open(&frame, now) {
            Ok(plaintext) => self.dispatch(addr, peer, kind, plaintext, now),
            Err(CryptoError::UnknownEpoch(epoch))
                if session.state() == SessionState::Renegotiating
                    && session.epoch().and_then(|e| e.checked_add(1)) == Some(epoch) =>
            {
                if !session.defer(frame, max_deferred) {
                    trace!(%addr, epoch, "next-epoch frame dropped");
                }
            }
            Err(e @ (CryptoError::ReplayDetected | CryptoError::UnknownEpoch(_))) => {
                debug!(%addr, router = %peer, error = %e, "anomalous frame dropped");
                if session.note_anomaly(max_anomalies) {
                    self.close(addr, CloseReason::AnomalyThreshold);
                }
            }
            Err(CryptoError::DecryptionFailed) => self.close(addr, CloseReason::IntegrityFailure),
            Err(e) => {
                debug!(%addr, error = %e, "frame could not be opened");
                self.close(addr, CloseReason::CryptoFailure);
            }
        }
    }

    fn dispatch(&mut self, addr: SocketAddr, peer: RouterId, kind: FrameKind, plaintext: Vec<u8>, now: Instant) {
        match kind {
            FrameKind::Data => {
                // Empty data frames are keepalives.
                if !plaintext.is_empty() {
                    self.handler.on_message(&peer, &plaintext);
                }
            }
            FrameKind::Close => self.close(addr, CloseReason::RemoteClose),
            FrameKind::Rekey => self.on_rekey(addr, &plaintext, now),
            FrameKind::RekeyAck => self.on_rekey_ack(addr, &plaintext),
            FrameKind::Handshake | FrameKind::HandshakeAck => {
                self.close(addr, CloseReason::ProtocolViolation);
            }
        }
    }

    /// Responder side of a renegotiation.
    ///
    /// A retransmitted `Rekey` is ignored while its answer is being derived
    /// and answered with the stored `RekeyAck` once it has been.
    fn on_rekey(&mut self, addr: SocketAddr, plaintext: &[u8], now: Instant) {
        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        let (Some(remote), Role::Responder) = (rekey_public(plaintext), session.role()) else {
            self.close(addr, CloseReason::ProtocolViolation);
            return;
        };
        match session.state() {
            SessionState::Established => {}
            SessionState::Renegotiating => {
                trace!(%addr, "repeated rekey ignored");
                return;
            }
            _ => {
                self.close(addr, CloseReason::ProtocolViolation);
                return;
            }
        }
        if let Some(answer) = session.rekey_ack_for(&remote) {
            self.sink.send_to(addr, answer);
            trace!(%addr, "rekey acknowledgment resent");
            return;
        }
        let Some((epoch, auth)) = next_epoch(session) else {
            self.close(addr, CloseReason::RenegotiationFailed);
            return;
        };

        session.answer_renegotiation(remote, now);
        let handle = session.handle();
        debug!(%addr, epoch, "renegotiation requested by peer");
        self.submit(handle, move || Outcome::Rekeyed(rekey(None, &remote, &auth, epoch)));
    }

    /// Initiator side: the peer answered our `Rekey`.
    fn on_rekey_ack(&mut self, addr: SocketAddr, plaintext: &[u8]) {
        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        let valid = session.role() == Role::Initiator
            && session.state() == SessionState::Renegotiating
            && !session.job_pending();
        let (Some(remote), true) = (rekey_public(plaintext), valid) else {
            self.close(addr, CloseReason::ProtocolViolation);
            return;
        };
        let (Some(ephemeral), Some((epoch, auth))) = (session.take_rekey_ephemeral(), next_epoch(session)) else {
            self.close(addr, CloseReason::RenegotiationFailed);
            return;
        };

        let handle = session.handle();
        self.submit(handle, move || {
            Outcome::Rekeyed(rekey(Some(ephemeral), &remote, &auth, epoch))
        });
    }

    fn on_rekeyed(&mut self, addr: SocketAddr, keys: EpochKeys, now: Instant) {
        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        if session.state() != SessionState::Renegotiating {
            return;
        }
        let Some(peer) = session.peer().copied() else {
            return;
        };

        // The answer goes out under the old epoch; the initiator has no new keys yet.
        if let Some(reply) = keys.reply {
            match session.seal(FrameKind::RekeyAck, &reply, now) {
                Ok(datagram) => {
                    self.sink.send_to(addr, &datagram);
                    session.store_rekey_ack(datagram);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "rekey acknowledgment not sealed");
                    self.close(addr, CloseReason::RenegotiationFailed);
                    return;
                }
            }
        }

        let epoch = keys.epoch;
        if let Err(e) = session.complete_renegotiation(epoch, keys.initiator_key, keys.responder_key, now) {
            debug!(%addr, error = %e, "new epoch not installed");
            self.close(addr, CloseReason::RenegotiationFailed);
            return;
        }
        let deferred = session.take_deferred();

        debug!(%addr, router = %peer, epoch, "session renegotiated");
        self.handler.on_renegotiated(&peer, addr);
        for frame in deferred {
            self.on_sealed(addr, frame, now);
        }
        self.flush(addr, now);
    }

    fn maintain(&mut self, addr: SocketAddr, now: Instant) {
        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };

        // Unanswered handshakes are bounded by the handshake deadline.
        let retransmitting = session.state() == SessionState::HandshakeSent && !session.job_pending();
        if !retransmitting && session.is_idle(now, self.config.inactivity_timeout) {
            let remote = session.remote().copied();
            debug!(%addr, router = ?remote, state = %session.state(), "session idle");
            self.handler.on_timeout(addr, remote.as_ref());
            self.close(addr, CloseReason::Timeout);
            return;
        }

        let renegotiating = session.state() == SessionState::Renegotiating;
        match session.retransmit_due(now, &self.config) {
            Ok(Retransmit::Wait) => {}
            Ok(Retransmit::Resend(datagram)) => {
                trace!(%addr, renegotiating, "retransmitted");
                self.sink.send_to(addr, &datagram);
                return;
            }
            Ok(Retransmit::GiveUp) if renegotiating => {
                self.close(addr, CloseReason::RenegotiationFailed);
                return;
            }
            Ok(Retransmit::GiveUp) => {
                self.close(addr, CloseReason::HandshakeTimeout);
                return;
            }
            Err(e) => {
                debug!(%addr, error = %e, "rekey not resealed");
                self.close(addr, CloseReason::RenegotiationFailed);
                return;
            }
        }

        if session.renegotiation_expired(now, self.config.handshake_deadline()) {
            self.close(addr, CloseReason::RenegotiationFailed);
            return;
        }

        if session.rekey_due(now, self.config.rekey_interval) {
            match session.begin_renegotiation(now) {
                Ok(datagram) => {
                    debug!(%addr, "renegotiation started");
                    self.sink.send_to(addr, &datagram);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "renegotiation not started");
                    self.close(addr, CloseReason::RenegotiationFailed);
                    return;
                }
            }
        } else if session.keepalive_due(now, self.config.keepalive_interval) {
            match session.seal(FrameKind::Data, &[], now) {
                Ok(datagram) => self.sink.send_to(addr, &datagram),
                Err(_) => {
                    self.close(addr, CloseReason::CryptoFailure);
                    return;
                }
            }
        }

        self.flush(addr, now);
    }

    fn flush(&mut self, addr: SocketAddr, now: Instant) {
        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        match session.flush(now) {
            Ok(datagrams) => {
                for datagram in datagrams {
                    self.sink.send_to(addr, &datagram);
                }
            }
            Err(e) => {
                debug!(%addr, error = %e, "queued payloads not sealed");
                self.close(addr, CloseReason::CryptoFailure);
            }
        }
    }

    /// Remove the session, release its binding and notify the handler once.
    fn close(&mut self, addr: SocketAddr, reason: CloseReason) {
        let Some(mut session) = self.sessions.remove(&addr) else {
            return;
        };

        if reason != CloseReason::RemoteClose && session.state().is_established() {
            if let Ok(datagram) = session.seal(FrameKind::Close, &[], Instant::now()) {
                self.sink.send_to(addr, &datagram);
            }
        }
        if let Some(peer) = session.peer() {
            if self.auth.is_bound_to(&addr, peer) {
                self.auth.unbind(&addr);
            }
        }

        let remote = session.remote().copied();
        if !session.close(reason) {
            return;
        }
        if reason.is_security_event() {
            warn!(%addr, router = ?remote, %reason, "session closed");
        } else {
            debug!(%addr, router = ?remote, %reason, "session closed");
        }
        self.handler.on_closed(addr, remote.as_ref(), reason);
    }
}

/// Next epoch number and the key that authenticates it.
fn next_epoch(session: &Session) -> Option<(u32, Zeroizing<[u8; 32]>)> {
    let crypto = session.crypto()?;
    let epoch = crypto.epoch().checked_add(1)?;
    Some((epoch, crypto.rekey_auth_key()))
}

impl<H, S> Drop for LinkLayer<H, S>
where
    H: LinkHandler,
    S: DatagramSink,
{
    fn drop(&mut self) {
        self.stop();
    }
}

impl<H, S> std::fmt::Debug for LinkLayer<H, S>
where
    H: LinkHandler,
    S: DatagramSink,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkLayer")
            .field("router", &self.local)
            .field("running", &self.is_running())
            .field("sessions", &self.sessions.len())
            .field("bindings", &self.auth.len())
            .finish_non_exhaustive()
    }
}

/// Pump cadence that keeps every timer in `config` within one tick.
///
/// Never shorter than a millisecond.
pub fn pump_interval(config: &LinkConfig) -> Duration {
    PUMP_INTERVAL
        .min(config.handshake_timeout / 2)
        .max(Duration::from_millis(1))
}

/// Both sides dialed each other at once. The router with the lower identity
/// drops its own unanswered handshake and answers the peer's; the other keeps
/// its attempt and ignores the crossing handshake.
fn yields_to(dialed: &Session, msg: &HandshakeMsg, local: &RouterId) -> bool {
    let Some(target) = dialed.target() else {
        return false;
    };
    dialed.role() == Role::Initiator
        && dialed.state() == SessionState::HandshakeSent
        && !dialed.job_pending()
        && msg.responder == *local
        && local < target
        && RouterContact::decode(&msg.contact).is_ok_and(|contact| contact.router_id() == target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::LocalIdentity;
    use crate::core::NoopHandler;
    use crate::crypto::EphemeralKeypair;
    use std::sync::Mutex;

    type Sent = Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>;

    fn link(config: LinkConfig) -> (LinkLayer<NoopHandler, impl DatagramSink>, Sent) {
        let identity = Arc::new(LocalIdentity::generate(vec![]).unwrap());
        let sent: Sent = Arc::default();
        let log = Arc::clone(&sent);
        let sink = move |addr: SocketAddr, datagram: &[u8]| {
            log.lock().unwrap().push((addr, datagram.to_vec()));
        };
        let layer = LinkLayer::new(config, identity.clone(), identity, NoopHandler, sink);
        (layer, sent)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([198, 51, 100, 7], port))
    }

    fn unsigned_handshake(responder: &RouterId) -> Vec<u8> {
        let ephemeral = EphemeralKeypair::generate();
        let mut bytes =
            HandshakeMsg::encode_body(now_millis(), responder, ephemeral.public_key(), b"").unwrap();
        bytes.extend_from_slice(&[0u8; 64]);
        bytes
    }

    #[test]
    fn test_name_and_rank() {
        let (layer, _) = link(LinkConfig {
            rank: 9,
            ..LinkConfig::default()
        });
        assert_eq!(layer.name(), "iwp");
        assert_eq!(layer.rank(), 9);
        assert_ne!(*layer.key_gen(), [0u8; 32]);
    }

    #[test]
    fn test_operations_require_start() {
        let (mut layer, sent) = link(LinkConfig::default());
        let peer = RouterId::from_bytes([3; 32]);

        assert!(matches!(
            layer.new_outbound_session(peer, addr(1)),
            Err(LinkError::NotRunning)
        ));
        assert!(matches!(layer.send_to(addr(1), b"x"), Err(LinkError::NotRunning)));
        layer.recv_from(addr(1), &unsigned_handshake(layer.local_id()));
        assert_eq!(layer.session_count(), 0);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_start_rejects_bad_config() {
        let (mut layer, _) = link(LinkConfig {
            worker_count: 0,
            ..LinkConfig::default()
        });
        assert!(matches!(layer.start(), Err(LinkError::Config(_))));
        assert!(!layer.is_running());
    }

    #[test]
    fn test_start_rejects_foreign_contact() {
        let signer = Arc::new(LocalIdentity::generate(vec![]).unwrap());
        let other = Arc::new(LocalIdentity::generate(vec![]).unwrap());
        let mut layer = LinkLayer::new(
            LinkConfig::default(),
            signer,
            other,
            NoopHandler,
            |_: SocketAddr, _: &[u8]| {},
        );
        assert!(matches!(
            layer.start(),
            Err(LinkError::Identity(ContactError::IdentityMismatch))
        ));
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let (mut layer, _) = link(LinkConfig::default());
        layer.start().unwrap();
        layer.start().unwrap();
        assert!(layer.is_running());
        layer.stop();
        layer.stop();
        assert!(!layer.is_running());
    }

    #[test]
    fn test_one_session_per_address() {
        let (mut layer, sent) = link(LinkConfig::default());
        layer.start().unwrap();
        let peer = RouterId::from_bytes([3; 32]);

        let first = layer.new_outbound_session(peer, addr(1)).unwrap();
        let second = layer.new_outbound_session(peer, addr(1)).unwrap();

        assert_eq!(first, second);
        assert_eq!(layer.session_count(), 1);
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(layer.session_state(&addr(1)), Some(SessionState::HandshakeSent));
    }

    #[test]
    fn test_half_open_limit() {
        let (mut layer, sent) = link(LinkConfig {
            max_pending_handshakes: 2,
            ..LinkConfig::default()
        });
        layer.start().unwrap();
        let handshake = unsigned_handshake(layer.local_id());

        for port in 1..=5 {
            layer.recv_from(addr(port), &handshake);
        }
        assert_eq!(layer.session_count(), 2);
        assert_eq!(layer.pending_handshakes(), 2);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_inbound_disabled_drops_handshake() {
        let (mut layer, sent) = link(LinkConfig {
            permit_inbound: false,
            ..LinkConfig::default()
        });
        layer.start().unwrap();
        layer.recv_from(addr(1), &unsigned_handshake(layer.local_id()));
        assert_eq!(layer.session_count(), 0);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_garbage_is_dropped_silently() {
        let (mut layer, sent) = link(LinkConfig::default());
        layer.start().unwrap();
        let garbage: [&[u8]; 4] = [b"", &[0xff; 40], &[0x03; 10], &[0x02; 97]];
        for datagram in garbage {
            layer.recv_from(addr(1), datagram);
        }
        assert_eq!(layer.session_count(), 0);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_map_addr_conflict() {
        let (mut layer, _) = link(LinkConfig::default());
        let a = RouterId::from_bytes([1; 32]);
        let b = RouterId::from_bytes([2; 32]);

        assert!(layer.map_addr(a, addr(1)));
        assert!(!layer.map_addr(b, addr(1)));
        assert_eq!(layer.bound_identity(&addr(1)), Some(&a));
        assert_eq!(layer.unmap_addr(&addr(1)), Some(a));
        assert!(layer.map_addr(b, addr(1)));
    }

    #[test]
    fn test_close_session_releases_address() {
        let (mut layer, _) = link(LinkConfig::default());
        layer.start().unwrap();
        let peer = RouterId::from_bytes([3; 32]);

        layer.new_outbound_session(peer, addr(1)).unwrap();
        assert!(layer.close_session(addr(1)));
        assert!(!layer.close_session(addr(1)));
        assert_eq!(layer.session_count(), 0);

        let again = layer.new_outbound_session(peer, addr(1)).unwrap();
        assert_eq!(again.generation(), 2);
    }

    #[test]
    fn test_send_to_unknown_session() {
        let (mut layer, _) = link(LinkConfig::default());
        layer.start().unwrap();
        assert!(matches!(
            layer.send_to(addr(1), b"x"),
            Err(LinkError::UnknownSession(_))
        ));
        assert!(matches!(
            layer.send_to(addr(1), &[0u8; MAX_PAYLOAD_SIZE + 1]),
            Err(LinkError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_pending_payloads_are_bounded() {
        let (mut layer, _) = link(LinkConfig {
            max_queued_frames: 2,
            ..LinkConfig::default()
        });
        layer.start().unwrap();
        layer.new_outbound_session(RouterId::from_bytes([3; 32]), addr(1)).unwrap();

        layer.send_to(addr(1), b"one").unwrap();
        layer.send_to(addr(1), b"two").unwrap();
        assert!(matches!(layer.send_to(addr(1), b"three"), Err(LinkError::QueueFull)));
        assert_eq!(layer.session(&addr(1)).map(Session::queued), Some(2));
    }

    #[test]
    fn test_handshake_retransmit_then_timeout() {
        let (mut layer, sent) = link(LinkConfig {
            handshake_timeout: Duration::from_millis(100),
            handshake_max_retries: 1,
            ..LinkConfig::default()
        });
        layer.start().unwrap();
        let start = Instant::now();
        layer.new_outbound_session(RouterId::from_bytes([3; 32]), addr(1)).unwrap();

        layer.pump_at(start + Duration::from_millis(150));
        {
            let sent = sent.lock().unwrap();
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[0], sent[1]);
        }

        layer.pump_at(start + Duration::from_secs(1));
        assert_eq!(layer.session_count(), 0);
        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_default_handshake_abandoned_within_inactivity_timeout() {
        let (mut layer, sent) = link(LinkConfig::default());
        layer.start().unwrap();
        let start = Instant::now();
        layer.new_outbound_session(RouterId::from_bytes([3; 32]), addr(1)).unwrap();

        // Retransmissions at 1s, 3s, 7s, 15s and 31s; the next would be due at 63s.
        for millis in [1_100, 3_100, 7_100, 15_100, 31_100, 59_100] {
            layer.pump_at(start + Duration::from_millis(millis));
            assert_eq!(layer.session_state(&addr(1)), Some(SessionState::HandshakeSent));
        }
        assert_eq!(sent.lock().unwrap().len(), 6);

        layer.pump_at(start + layer.config().inactivity_timeout + Duration::from_millis(1));
        assert_eq!(layer.session_count(), 0);
    }

    #[test]
    fn test_pump_interval_tracks_handshake_timeout() {
        let config = LinkConfig {
            handshake_timeout: Duration::from_millis(50),
            ..LinkConfig::default()
        };
        assert_eq!(pump_interval(&config), Duration::from_millis(25));
        assert_eq!(pump_interval(&LinkConfig::default()), PUMP_INTERVAL);
    }

    #[test]
    fn test_pump_interval_never_zero() {
        for timeout in [Duration::from_nanos(1), Duration::from_micros(500), Duration::from_millis(1)] {
            let config = LinkConfig {
                handshake_timeout: timeout,
                ..LinkConfig::default()
            };
            assert!(config.validate().is_ok());
            assert_eq!(pump_interval(&config), Duration::from_millis(1));
        }
    }

    #[test]
    fn test_stop_sessions_hands_back_the_pool() {
        let (mut layer, _) = link(LinkConfig::default());
        layer.start().unwrap();
        layer.new_outbound_session(RouterId::from_bytes([3; 32]), addr(1)).unwrap();

        let mut work = layer.stop_sessions().unwrap();
        assert!(!layer.is_running());
        assert_eq!(layer.session_count(), 0);
        assert!(layer.stop_sessions().is_none());

        work.stop();
        // Already stopped; dropping the layer does not join again.
        drop(layer);
    }

    #[test]
    fn test_simultaneous_dial_tie_break() {
        let low = Arc::new(LocalIdentity::generate(vec![]).unwrap());
        let high = Arc::new(LocalIdentity::generate(vec![]).unwrap());
        let (low, high) = if low.router_id() < high.router_id() { (low, high) } else { (high, low) };

        let handshake_from = |from: &LocalIdentity, to: &RouterId| {
            let ephemeral = EphemeralKeypair::generate();
            let contact = from.contact().encode().unwrap();
            let mut bytes =
                HandshakeMsg::encode_body(now_millis(), to, ephemeral.public_key(), &contact).unwrap();
            let signature = from.sign(&bytes);
            bytes.extend_from_slice(&signature);
            bytes
        };
        let layer_for = |identity: &Arc<LocalIdentity>| {
            let mut layer = LinkLayer::new(
                LinkConfig::default(),
                identity.clone(),
                identity.clone(),
                NoopHandler,
                |_: SocketAddr, _: &[u8]| {},
            );
            layer.start().unwrap();
            layer
        };

        // The higher identity keeps its own attempt.
        let mut keeps = layer_for(&high);
        let first = keeps.new_outbound_session(low.router_id(), addr(1)).unwrap();
        keeps.recv_from(addr(1), &handshake_from(low.as_ref(), &high.router_id()));
        assert_eq!(keeps.session(&addr(1)).map(Session::handle), Some(first));
        assert_eq!(keeps.session_state(&addr(1)), Some(SessionState::HandshakeSent));

        // The lower identity answers instead, keeping what it queued.
        let mut answers = layer_for(&low);
        let dialed = answers.new_outbound_session(high.router_id(), addr(2)).unwrap();
        answers.send_to(addr(2), b"queued").unwrap();
        answers.recv_from(addr(2), &handshake_from(high.as_ref(), &low.router_id()));
        let session = answers.session(&addr(2)).unwrap();
        assert_ne!(session.handle(), dialed);
        assert_eq!(session.role(), Role::Responder);
        assert_eq!(session.state(), SessionState::HandshakeReceived);
        assert_eq!(session.queued(), 1);

        // A crossing handshake from some other router does not displace the dial.
        let mut guarded = layer_for(&low);
        guarded.new_outbound_session(high.router_id(), addr(3)).unwrap();
        let stranger = LocalIdentity::generate(vec![]).unwrap();
        guarded.recv_from(addr(3), &handshake_from(&stranger, &low.router_id()));
        assert_eq!(guarded.session(&addr(3)).map(Session::role), Some(Role::Initiator));
    }
}
