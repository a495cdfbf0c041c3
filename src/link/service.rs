//! Async driver: runs a [`LinkLayer`] on one tokio task over a UDP socket.
//!
//! The task is the network context. Socket reads, crypto completions, the
//! pump tick and commands from [`LinkHandle`]s are all multiplexed onto it, so
//! the link layer itself needs no locking.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::contact::{BufferSigner, ContactProvider};
use crate::core::{DatagramSink, LinkError, LinkHandler, RouterId, MAX_DATAGRAM_SIZE};

use super::config::LinkConfig;
use super::layer::{pump_interval, LinkLayer};
use super::session::SessionHandle;

const COMMAND_QUEUE_DEPTH: usize = 256;

/// [`DatagramSink`] over a shared tokio UDP socket.
///
/// Sends never wait: a datagram the socket cannot take right now is dropped,
/// as any datagram may be.
#[derive(Debug, Clone)]
pub struct UdpSink {
    socket: Arc<UdpSocket>,
}

impl UdpSink {
    /// Wrap a bound socket.
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl DatagramSink for UdpSink {
    fn send_to(&self, addr: SocketAddr, datagram: &[u8]) {
        if let Err(e) = self.socket.try_send_to(datagram, addr) {
            trace!(%addr, error = %e, "datagram dropped by socket");
        }
    }
}

enum Command {
    Connect {
        peer: RouterId,
        addr: SocketAddr,
        reply: oneshot::Sender<Result<SessionHandle, LinkError>>,
    },
    Send {
        addr: SocketAddr,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Close {
        addr: SocketAddr,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Cloneable handle to a running [`LinkService`].
#[derive(Debug, Clone)]
pub struct LinkHandle {
    commands: mpsc::Sender<Command>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect { peer, addr, .. } => write!(f, "Connect({peer:?}, {addr})"),
            Self::Send { addr, payload, .. } => write!(f, "Send({addr}, {} bytes)", payload.len()),
            Self::Close { addr, .. } => write!(f, "Close({addr})"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl LinkHandle {
    /// Address the service's socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open (or reuse) a session toward `peer` at `addr`.
    pub async fn connect(&self, peer: RouterId, addr: SocketAddr) -> Result<SessionHandle, LinkError> {
        self.request(|reply| Command::Connect { peer, addr, reply })
            .await?
    }

    /// Queue `payload` on the session at `addr`.
    pub async fn send(&self, addr: SocketAddr, payload: impl Into<Vec<u8>>) -> Result<(), LinkError> {
        let payload = payload.into();
        self.request(|reply| Command::Send {
            addr,
            payload,
            reply,
        })
        .await?
    }

    /// Close the session at `addr`. Returns false if there was none.
    pub async fn close(&self, addr: SocketAddr) -> Result<bool, LinkError> {
        self.request(|reply| Command::Close { addr, reply }).await
    }

    /// Ask the service to stop. Returns once the request is queued.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| LinkError::NotRunning)?;
        rx.await.map_err(|_| LinkError::NotRunning)
    }
}

/// A link layer bound to a UDP socket, driven by a single task.
///
/// # Example
///
/// ```ignore
/// let identity = Arc::new(LocalIdentity::generate(addrs)?);
/// let (service, handle) = LinkService::bind(
///     "0.0.0.0:1090".parse()?,
///     LinkConfig::default(),
///     identity.clone(),
///     identity,
///     MyRouter::new(),
/// )
/// .await?;
/// let task = service.spawn();
///
/// handle.connect(peer_id, peer_addr).await?;
/// handle.send(peer_addr, b"cell".to_vec()).await?;
/// ```
pub struct LinkService<H: LinkHandler> {
    link: LinkLayer<H, UdpSink>,
    socket: Arc<UdpSocket>,
    commands: mpsc::Receiver<Command>,
}

impl<H: LinkHandler> LinkService<H> {
    /// Bind `bind_addr` and start the link layer.
    pub async fn bind(
        bind_addr: SocketAddr,
        config: LinkConfig,
        signer: Arc<dyn BufferSigner>,
        contacts: Arc<dyn ContactProvider>,
        handler: H,
    ) -> Result<(Self, LinkHandle), LinkError> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;

        let sink = UdpSink::new(Arc::clone(&socket));
        let mut link = LinkLayer::new(config, signer, contacts, handler, sink);
        link.start()?;

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        info!(%local_addr, router = %link.local_id(), "iwp link listening");

        let service = Self {
            link,
            socket,
            commands: rx,
        };
        let handle = LinkHandle {
            commands: tx,
            local_addr,
        };
        Ok((service, handle))
    }

    /// The link layer this service drives.
    pub fn link(&self) -> &LinkLayer<H, UdpSink> {
        &self.link
    }

    /// Run until shut down or every handle is dropped, then stop the link.
    pub async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut pump = time::interval(pump_interval(self.link.config()));
        pump.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.link.recv_from(from, &buf[..len]),
                    Err(e) => debug!(error = %e, "socket receive failed"),
                },
                Some(completion) = self.link.next_completion() => {
                    self.link.handle_completion(completion);
                }
                _ = pump.tick() => self.link.pump(),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.execute(command),
                },
            }
        }

        // Sessions close here; joining the workers waits on running jobs and
        // happens on the blocking pool.
        if let Some(mut work) = self.link.stop_sessions() {
            if let Err(e) = task::spawn_blocking(move || work.stop()).await {
                warn!(error = %e, "crypto workers not joined");
            }
        }
        info!("iwp link service exited");
    }

    /// Run on a new tokio task.
    pub fn spawn(self) -> JoinHandle<()>
    where
        H: 'static,
    {
        tokio::spawn(self.run())
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Connect { peer, addr, reply } => {
                let _ = reply.send(self.link.new_outbound_session(peer, addr));
            }
            Command::Send {
                addr,
                payload,
                reply,
            } => {
                let _ = reply.send(self.link.send_to(addr, &payload));
            }
            Command::Close { addr, reply } => {
                let _ = reply.send(self.link.close_session(addr));
            }
            Command::Shutdown => {}
        }
    }
}

impl<H: LinkHandler> std::fmt::Debug for LinkService<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkService")
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::{AddressInfo, LocalIdentity};
    use crate::core::CloseReason;
    use crate::link::{Completion, Outcome};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Clone, Default)]
    struct Inbox(Arc<Mutex<Vec<(RouterId, Vec<u8>)>>>);

    impl LinkHandler for Inbox {
        fn on_message(&mut self, from: &RouterId, payload: &[u8]) {
            self.0.lock().unwrap().push((*from, payload.to_vec()));
        }
    }

    async fn node(inbox: Inbox) -> (Arc<LocalIdentity>, LinkHandle, JoinHandle<()>) {
        let identity = Arc::new(
            LocalIdentity::generate(vec![AddressInfo::iwp("127.0.0.1:0".parse().unwrap(), 1)]).unwrap(),
        );
        let (service, handle) = LinkService::bind(
            "127.0.0.1:0".parse().unwrap(),
            LinkConfig::default(),
            identity.clone(),
            identity.clone(),
            inbox,
        )
        .await
        .unwrap();
        (identity, handle, service.spawn())
    }

    #[tokio::test]
    async fn test_services_exchange_payload_over_udp() {
        let inbox = Inbox::default();
        let (alice, alice_handle, alice_task) = node(Inbox::default()).await;
        let (bob, bob_handle, bob_task) = node(inbox.clone()).await;

        let bob_addr = bob_handle.local_addr();
        alice_handle.connect(bob.router_id(), bob_addr).await.unwrap();
        // Queued until the session is established, then flushed.
        alice_handle.send(bob_addr, b"first cell".to_vec()).await.unwrap();

        let delivered = time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(message) = inbox.0.lock().unwrap().first().cloned() {
                    return message;
                }
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(delivered, (alice.router_id(), b"first cell".to_vec()));

        alice_handle.shutdown().await;
        bob_handle.shutdown().await;
        alice_task.await.unwrap();
        bob_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_keeps_runtime_responsive_while_workers_finish() {
        let identity = Arc::new(LocalIdentity::generate(vec![]).unwrap());
        let (service, handle) = LinkService::bind(
            "127.0.0.1:0".parse().unwrap(),
            LinkConfig::default(),
            identity.clone(),
            identity,
            Inbox::default(),
        )
        .await
        .unwrap();

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let stale = SessionHandle::new("127.0.0.1:9".parse().unwrap(), 0);
        service
            .link()
            .queue_work(move || {
                let _ = started_tx.send(());
                std::thread::sleep(Duration::from_millis(400));
                Completion::new(stale, Outcome::AckVerified(Err(CloseReason::Shutdown)))
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let service_task = service.spawn();
        handle.shutdown().await;
        let finished = tokio::spawn(async move {
            service_task.await.unwrap();
            Instant::now()
        });
        let ticked = tokio::spawn(async {
            time::sleep(Duration::from_millis(50)).await;
            Instant::now()
        })
        .await
        .unwrap();
        let finished = finished.await.unwrap();

        // The tick ran while the worker was still busy.
        assert!(finished.saturating_duration_since(ticked) >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_handle_after_shutdown() {
        let (_, handle, task) = node(Inbox::default()).await;
        handle.shutdown().await;
        task.await.unwrap();

        let addr = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(handle.close(addr).await, Err(LinkError::NotRunning)));
    }
}
