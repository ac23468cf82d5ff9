//! Listening endpoints
//!
//! An [`Endpoint`] owns one listening socket plus the connections accepted on it that
//! are waiting for a partner (`pending`, oldest first) or already paired (`active`).
//! The accept loop runs in its own task and reports connections to the coordinator
//! through the event queue; the pending/active bookkeeping is only ever touched by the
//! coordinator.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::connection::{Connection, ConnectionId, ConnectionSettings};

/// Upper bound for a client to complete the TLS handshake
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Back-off after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Wildcard address covering IPv6 and, on dual-stack hosts, IPv4
pub const ANY_HOST: &str = "::";

const ANY_HOST_V4: &str = "0.0.0.0";

/// Endpoint errors
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}:{port}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Which side of the tunnel an endpoint serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// Private listener for trusted tunneling agents
    Relay,
    /// Public listener for arbitrary clients
    Service,
}

impl EndpointKind {
    pub fn opposite(self) -> Self {
        match self {
            EndpointKind::Relay => EndpointKind::Service,
            EndpointKind::Service => EndpointKind::Relay,
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Relay => write!(f, "relay"),
            EndpointKind::Service => write!(f, "service"),
        }
    }
}

/// Endpoint configuration
#[derive(Clone)]
pub struct EndpointConfig {
    pub kind: EndpointKind,
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsAcceptor>,
    pub settings: ConnectionSettings,
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

/// Notifications from connections to the coordinator
#[derive(Debug)]
pub(crate) enum EndpointEvent {
    /// Authorized (or needed no authorization) and may be paired
    Eligible(Connection),
    /// Stream closed; remove it from whichever set holds it
    Closed(ConnectionId),
}

pub(crate) type EventQueue = mpsc::UnboundedSender<(EndpointKind, EndpointEvent)>;

pub(crate) fn event_channel() -> (
    EventQueue,
    mpsc::UnboundedReceiver<(EndpointKind, EndpointEvent)>,
) {
    mpsc::unbounded_channel()
}

/// Event queue handle tagged with the endpoint it reports for
#[derive(Clone)]
pub(crate) struct EventSender {
    kind: EndpointKind,
    tx: EventQueue,
}

impl EventSender {
    pub(crate) fn new(kind: EndpointKind, tx: EventQueue) -> Self {
        Self { kind, tx }
    }

    pub(crate) fn send(&self, event: EndpointEvent) {
        // The coordinator is gone once shutdown completed; nothing left to notify.
        let _ = self.tx.send((self.kind, event));
    }
}

/// Pending/active counts for one endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub pending: usize,
    pub active: usize,
}

pub(crate) struct Endpoint {
    kind: EndpointKind,
    local_addr: SocketAddr,
    pending: VecDeque<Connection>,
    active: HashMap<ConnectionId, Connection>,
    shutdown: CancellationToken,
}

impl Endpoint {
    /// Bind the listener and start accepting connections.
    ///
    /// Bind failures are returned; everything after that is handled by the accept loop.
    pub(crate) async fn start(
        config: EndpointConfig,
        events: EventQueue,
        parent: &CancellationToken,
    ) -> Result<Self, EndpointError> {
        let listener = bind(&config.host, config.port)
            .await
            .map_err(|e| EndpointError::BindError {
                address: config.host.clone(),
                port: config.port,
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            "{} endpoint listening on {}{}",
            config.kind,
            local_addr,
            if config.tls.is_some() { " (TLS)" } else { "" }
        );

        let shutdown = parent.child_token();
        let acceptor = Acceptor {
            kind: config.kind,
            tls: config.tls,
            settings: Arc::new(config.settings),
            events: EventSender::new(config.kind, events),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(acceptor.run(listener));

        Ok(Self {
            kind: config.kind,
            local_addr,
            pending: VecDeque::new(),
            active: HashMap::new(),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue an eligible connection behind the ones already waiting
    pub fn admit(&mut self, connection: Connection) {
        debug_assert_eq!(connection.kind(), self.kind);
        debug!(
            "{} connection {} waiting for a partner ({} already pending)",
            self.kind,
            connection.id(),
            self.pending.len()
        );
        self.pending.push_back(connection);
    }

    /// Forget a connection, wherever it is tracked. Unknown ids are ignored.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        if let Some(index) = self.pending.iter().position(|c| c.id() == id) {
            return self.pending.remove(index);
        }
        self.active.remove(&id)
    }

    /// Pop the connection that has been waiting longest.
    ///
    /// Connections whose stream is already torn down are discarded on the way.
    pub fn take_oldest_pending(&mut self) -> Option<Connection> {
        while let Some(connection) = self.pending.pop_front() {
            if !connection.is_closed() {
                return Some(connection);
            }
            debug!(
                "Skipping closed {} connection {}",
                self.kind,
                connection.id()
            );
        }
        None
    }

    /// Track a freshly paired connection
    pub fn mark_active(&mut self, connection: Connection) {
        self.active.insert(connection.id(), connection);
    }

    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            pending: self.pending.len(),
            active: self.active.len(),
        }
    }

    /// Close the listener and destroy every tracked connection
    pub fn stop(&mut self) {
        self.shutdown.cancel();

        let count = self.pending.len() + self.active.len();
        for connection in self.pending.drain(..) {
            connection.destroy();
        }
        for (_, connection) in self.active.drain() {
            connection.destroy();
        }

        info!(
            "{} endpoint on {} stopped ({} connections closed)",
            self.kind, self.local_addr, count
        );
    }
}

/// Bind `host:port`. The IPv6 wildcard falls back to `0.0.0.0` on hosts without IPv6.
async fn bind(host: &str, port: u16) -> std::io::Result<TcpListener> {
    match TcpListener::bind((host, port)).await {
        Err(e) if host == ANY_HOST && e.kind() != std::io::ErrorKind::AddrInUse => {
            debug!("Binding [{}]:{} failed ({}), using {}", host, port, e, ANY_HOST_V4);
            TcpListener::bind((ANY_HOST_V4, port)).await
        }
        result => result,
    }
}

struct Acceptor {
    kind: EndpointKind,
    tls: Option<TlsAcceptor>,
    settings: Arc<ConnectionSettings>,
    events: EventSender,
    shutdown: CancellationToken,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, remote_addr)) => {
                    debug!("Accepted {} connection from {}", self.kind, remote_addr);
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", remote_addr, e);
                    }
                    self.handle(socket, remote_addr);
                }
                Err(e) => {
                    error!("Failed to accept {} connection: {}", self.kind, e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    fn handle(&self, socket: TcpStream, remote_addr: SocketAddr) {
        let Some(tls) = self.tls.clone() else {
            Connection::spawn(
                Box::new(socket),
                remote_addr,
                self.kind,
                self.settings.clone(),
                self.shutdown.child_token(),
                self.events.clone(),
            );
            return;
        };

        // Handshakes run off the accept loop so a slow client cannot stall it.
        let kind = self.kind;
        let settings = self.settings.clone();
        let events = self.events.clone();
        let closed = self.shutdown.child_token();
        tokio::spawn(async move {
            let handshake = tokio::select! {
                _ = closed.cancelled() => return,
                result = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, tls.accept(socket)) => result,
            };

            match handshake {
                Ok(Ok(stream)) => {
                    Connection::spawn(
                        Box::new(stream),
                        remote_addr,
                        kind,
                        settings,
                        closed,
                        events,
                    );
                }
                Ok(Err(e)) => debug!("TLS handshake with {} failed: {}", remote_addr, e),
                Err(_) => debug!("TLS handshake with {} timed out", remote_addr),
            }
        });
    }
}
