//! Per-socket state machine
//!
//! Every accepted stream is driven by two tasks:
//!
//! - a reader task owning the read half. It runs the state machine
//!   (`Authorizing -> Eligible -> Paired -> Closed`), buffers bytes until the
//!   connection is paired, forwards bytes to the peer afterwards and runs teardown.
//! - a writer task owning the write half. It drains the connection's outbound queue,
//!   which is what the peer's reader writes into.
//!
//! The coordinator only ever sees a [`Connection`] handle. The handle carries the
//! one-shot pairing slot, the outbound queue sender and the close token, never the
//! stream itself.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::endpoint::{EndpointEvent, EndpointKind, EventSender};
use crate::stream::BoxedStream;

const READ_CHUNK_SIZE: usize = 8192;

/// Chunks a reader may queue on its peer's writer before it has to wait
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// How long a destroyed connection keeps flushing bytes that were already queued
const WRITE_LINGER: Duration = Duration::from_secs(5);

/// Bytes an unpaired connection may hold before its reads pause.
///
/// Beyond this the TCP receive window pushes back on the sender.
pub const MAX_PENDING_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Behaviour an endpoint imposes on the connections it accepts
#[derive(Debug, Clone, Default)]
pub struct ConnectionSettings {
    /// Prefix a connection has to send before it may be paired
    pub secret: Option<Bytes>,

    /// Queue inbound bytes until paired even without a secret
    pub always_buffer: bool,

    /// Destroy the connection if it is still unpaired after this long
    pub idle_timeout: Option<Duration>,
}

impl ConnectionSettings {
    pub fn requires_auth(&self) -> bool {
        self.secret.is_some()
    }

    pub fn buffer_until_paired(&self) -> bool {
        self.requires_auth() || self.always_buffer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Authorizing,
    Eligible,
    Paired,
    Closed,
}

/// Non-owning reference to the paired connection
#[derive(Clone)]
pub(crate) struct PeerLink {
    id: ConnectionId,
    outbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

/// Coordinator-side handle to an eligible connection
pub(crate) struct Connection {
    id: ConnectionId,
    kind: EndpointKind,
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
    pair_slot: Option<oneshot::Sender<PeerLink>>,
}

impl Connection {
    /// Take ownership of `stream` and start driving it.
    ///
    /// `closed` is the connection's own close token; cancelling it destroys the stream.
    pub(crate) fn spawn(
        stream: BoxedStream,
        remote_addr: SocketAddr,
        kind: EndpointKind,
        settings: Arc<ConnectionSettings>,
        closed: CancellationToken,
        events: EventSender,
    ) -> ConnectionId {
        let id = ConnectionId::next();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (pair_tx, pair_rx) = oneshot::channel();
        let (reader, writer) = tokio::io::split(stream);

        let handle = Connection {
            id,
            kind,
            remote_addr,
            outbound: outbound_tx,
            closed: closed.clone(),
            pair_slot: Some(pair_tx),
        };

        let task = ConnectionTask {
            id,
            kind,
            remote_addr,
            state: if settings.requires_auth() {
                ConnectionState::Authorizing
            } else {
                ConnectionState::Eligible
            },
            buffer_until_paired: settings.buffer_until_paired(),
            settings,
            pending: VecDeque::new(),
            peer: None,
            closed: closed.clone(),
            events,
            handle: Some(handle),
            bytes_received: 0,
            bytes_forwarded: 0,
        };

        tokio::spawn(write_loop(id, writer, outbound_rx, closed));
        tokio::spawn(task.run(reader, pair_rx));

        id
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether the underlying stream has been (or is being) torn down
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Forcibly destroy the underlying stream
    pub fn destroy(&self) {
        self.closed.cancel();
    }

    /// Make `other` this connection's peer.
    ///
    /// # Panics
    ///
    /// A connection can be paired only once; a second call is an invariant violation.
    pub fn pair_with(&mut self, other: &Connection) {
        let slot = self.pair_slot.take();
        assert!(
            slot.is_some(),
            "connection {} is already paired, refusing to pair it with {}",
            self.id,
            other.id
        );

        if let Some(slot) = slot {
            if slot.send(other.link()).is_err() {
                // The reader task already exited; the peer will see our close token.
                debug!("Connection {} closed before it could be paired", self.id);
            }
        }
    }

    fn link(&self) -> PeerLink {
        PeerLink {
            id: self.id,
            outbound: self.outbound.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote_addr", &self.remote_addr)
            .field("paired", &self.pair_slot.is_none())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug)]
enum CloseReason {
    Eof,
    ReadError(std::io::Error),
    Destroyed,
    PeerClosed,
    Unauthorized,
    IdleTimeout,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof => write!(f, "closed by remote"),
            CloseReason::ReadError(e) => write!(f, "read error: {}", e),
            CloseReason::Destroyed => write!(f, "destroyed"),
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Unauthorized => write!(f, "authorization failed"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
        }
    }
}

/// Outcome of checking the buffered prefix against the secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthDecision {
    /// Fewer bytes than the secret have arrived
    Undecided,
    /// Prefix matched and was stripped from the buffer
    Authorized,
    Rejected,
}

/// Compare the first `secret.len()` buffered bytes with `secret`.
///
/// On a match the prefix is removed and whatever followed it stays queued.
pub(crate) fn check_authorization(buffered: &mut VecDeque<Bytes>, secret: &[u8]) -> AuthDecision {
    let available: usize = buffered.iter().map(Bytes::len).sum();
    if available < secret.len() {
        return AuthDecision::Undecided;
    }

    let mut prefix = Vec::with_capacity(secret.len());
    for chunk in buffered.iter() {
        let wanted = secret.len() - prefix.len();
        if wanted == 0 {
            break;
        }
        prefix.extend_from_slice(&chunk[..wanted.min(chunk.len())]);
    }

    if !bool::from(prefix.as_slice().ct_eq(secret)) {
        return AuthDecision::Rejected;
    }

    let mut remaining = secret.len();
    while remaining > 0 {
        let Some(front) = buffered.front_mut() else {
            break;
        };
        if front.len() <= remaining {
            remaining -= front.len();
            buffered.pop_front();
        } else {
            *front = front.slice(remaining..);
            remaining = 0;
        }
    }

    AuthDecision::Authorized
}

struct ConnectionTask {
    id: ConnectionId,
    kind: EndpointKind,
    remote_addr: SocketAddr,
    settings: Arc<ConnectionSettings>,
    state: ConnectionState,
    buffer_until_paired: bool,
    pending: VecDeque<Bytes>,
    peer: Option<PeerLink>,
    closed: CancellationToken,
    events: EventSender,
    /// Handed to the coordinator once the connection becomes eligible
    handle: Option<Connection>,
    bytes_received: u64,
    bytes_forwarded: u64,
}

impl ConnectionTask {
    async fn run(
        mut self,
        mut reader: ReadHalf<BoxedStream>,
        mut pair_rx: oneshot::Receiver<PeerLink>,
    ) {
        if self.state == ConnectionState::Eligible {
            self.become_eligible();
        }

        // Armed at creation; only matters while unpaired and buffering.
        let idle_armed = self.settings.idle_timeout.is_some();
        let idle = tokio::time::sleep(self.settings.idle_timeout.unwrap_or_default());
        tokio::pin!(idle);

        let mut pair_open = true;
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

        let reason = loop {
            let peer_closed = self.peer.as_ref().map(|peer| peer.closed.clone());

            tokio::select! {
                biased;

                _ = self.closed.cancelled() => break CloseReason::Destroyed,

                _ = cancelled(peer_closed.as_ref()) => break CloseReason::PeerClosed,

                link = &mut pair_rx, if pair_open => {
                    pair_open = false;
                    if let Ok(link) = link {
                        self.pair(link).await;
                    }
                }

                _ = &mut idle, if idle_armed && self.buffer_until_paired => {
                    break CloseReason::IdleTimeout;
                }

                read = reader.read_buf(&mut buf), if self.accepts_reads() => match read {
                    Ok(0) => break CloseReason::Eof,
                    Ok(n) => {
                        self.bytes_received += n as u64;
                        let chunk = buf.split().freeze();
                        buf.reserve(READ_CHUNK_SIZE);
                        if let Err(reason) = self.on_data(chunk).await {
                            break reason;
                        }
                    }
                    Err(e) => break CloseReason::ReadError(e),
                },
            }
        };

        self.close(reason);
    }

    fn buffered_len(&self) -> usize {
        self.pending.iter().map(Bytes::len).sum()
    }

    /// Reading pauses while the pre-pairing buffer is full. A secret longer than the
    /// cap can still be received in full.
    fn accepts_reads(&self) -> bool {
        if !self.buffer_until_paired {
            return true;
        }
        let secret_len = self.settings.secret.as_ref().map_or(0, Bytes::len);
        self.buffered_len() < MAX_PENDING_BYTES.max(secret_len)
    }

    async fn on_data(&mut self, chunk: Bytes) -> Result<(), CloseReason> {
        if self.buffer_until_paired {
            self.pending.push_back(chunk);

            if self.state == ConnectionState::Authorizing {
                if let Some(secret) = self.settings.secret.clone() {
                    match check_authorization(&mut self.pending, &secret) {
                        AuthDecision::Undecided => {}
                        AuthDecision::Rejected => return Err(CloseReason::Unauthorized),
                        AuthDecision::Authorized => {
                            debug!(
                                "{} connection {} from {} authorized",
                                self.kind, self.id, self.remote_addr
                            );
                            self.become_eligible();
                        }
                    }
                }
            }
            return Ok(());
        }

        if self.peer.is_some() {
            self.forward(chunk).await;
        } else {
            trace!(
                "Dropping {} bytes received by unpaired connection {}",
                chunk.len(),
                self.id
            );
        }
        Ok(())
    }

    /// Write `chunk` to the peer's stream; failures mean the peer is closing and are ignored
    async fn forward(&mut self, chunk: Bytes) {
        let Some(outbound) = self.peer.as_ref().map(|peer| peer.outbound.clone()) else {
            return;
        };
        let len = chunk.len() as u64;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {}
            sent = outbound.send(chunk) => match sent {
                Ok(()) => self.bytes_forwarded += len,
                Err(_) => trace!("Peer of connection {} is gone, {} bytes discarded", self.id, len),
            },
        }
    }

    async fn pair(&mut self, link: PeerLink) {
        debug!(
            "{} connection {} paired with connection {}",
            self.kind, self.id, link.id
        );
        self.peer = Some(link);
        self.state = ConnectionState::Paired;

        let pending = std::mem::take(&mut self.pending);
        for chunk in pending {
            self.forward(chunk).await;
        }
        self.buffer_until_paired = false;
    }

    fn become_eligible(&mut self) {
        self.state = ConnectionState::Eligible;
        if let Some(handle) = self.handle.take() {
            self.events.send(EndpointEvent::Eligible(handle));
        }
    }

    fn close(mut self, reason: CloseReason) {
        let previous = self.state;
        self.state = ConnectionState::Closed;
        self.closed.cancel();

        // A broken half of a tunnel takes the other half down with it.
        if let Some(peer) = &self.peer {
            peer.closed.cancel();
        }

        match reason {
            CloseReason::Unauthorized | CloseReason::IdleTimeout => debug!(
                "{} connection {} from {} dropped ({}, state {:?})",
                self.kind, self.id, self.remote_addr, reason, previous
            ),
            _ => debug!(
                "{} connection {} from {} closed: {} (received {}B, forwarded {}B)",
                self.kind,
                self.id,
                self.remote_addr,
                reason,
                self.bytes_received,
                self.bytes_forwarded
            ),
        }

        self.events.send(EndpointEvent::Closed(self.id));
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn next_chunk(
    outbound: &mut mpsc::Receiver<Bytes>,
    closed: &CancellationToken,
) -> Option<Bytes> {
    if closed.is_cancelled() {
        return outbound.try_recv().ok();
    }
    tokio::select! {
        biased;
        chunk = outbound.recv() => chunk,
        _ = closed.cancelled() => outbound.try_recv().ok(),
    }
}

async fn write_loop(
    id: ConnectionId,
    mut writer: WriteHalf<BoxedStream>,
    mut outbound: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
) {
    let drain = async {
        while let Some(chunk) = next_chunk(&mut outbound, &closed).await {
            writer.write_all(&chunk).await?;
        }
        writer.shutdown().await
    };

    let linger = async {
        closed.cancelled().await;
        tokio::time::sleep(WRITE_LINGER).await;
    };

    tokio::select! {
        result = drain => {
            if let Err(e) = result {
                debug!("Write to connection {} failed: {}", id, e);
                closed.cancel();
            }
        }
        _ = linger => {
            debug!("Gave up flushing connection {} after {:?}", id, WRITE_LINGER);
        }
    }
}
