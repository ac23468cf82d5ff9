//! Relay coordinator
//!
//! Owns the relay endpoint and the service endpoint and pairs their connections.
//! Every state change goes through one coordinator task, so the pairing check
//! (read the opposite endpoint's queue, then mutate both endpoints) can never race
//! with another arrival.

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use sunnel_cert::{CertError, TlsIdentityConfig};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionSettings};
use crate::endpoint::{
    event_channel, Endpoint, EndpointConfig, EndpointError, EndpointEvent, EndpointKind,
    EndpointStats, ANY_HOST,
};

/// How long a public client may wait for a relay partner
pub const SERVICE_IDLE_TIMEOUT: Duration = Duration::from_secs(20);

pub const DEFAULT_RELAY_PORT: u16 = 9000;

/// Relay server errors
#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("{0}")]
    Endpoint(#[from] EndpointError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] CertError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Relay server is not running")]
    Stopped,
}

/// Which listeners are secured with TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    #[default]
    Off,
    /// Only the relay listener
    Relay,
    /// Relay and service listeners
    Both,
}

impl TlsMode {
    pub fn secures(self, kind: EndpointKind) -> bool {
        match (self, kind) {
            (TlsMode::Off, _) => false,
            (TlsMode::Relay, EndpointKind::Relay) => true,
            (TlsMode::Relay, EndpointKind::Service) => false,
            (TlsMode::Both, _) => true,
        }
    }
}

/// Where the TLS certificate comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsIdentity {
    Files(TlsIdentityConfig),
    /// Ephemeral certificate generated at startup
    SelfSigned,
}

impl TlsIdentity {
    fn acceptor(&self, hostname: Option<&str>) -> Result<TlsAcceptor, CertError> {
        match self {
            TlsIdentity::Files(config) => config.acceptor(),
            TlsIdentity::SelfSigned => {
                let names = self_signed_names(hostname);
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                let cert = sunnel_cert::generate_self_signed_cert_with_domains(&names)?;
                cert.into_certificate().into_acceptor()
            }
        }
    }
}

/// Loopback names plus the bind hostname, unless that is a wildcard address
fn self_signed_names(hostname: Option<&str>) -> Vec<String> {
    let mut names: Vec<String> = ["localhost", "127.0.0.1", "::1"]
        .iter()
        .map(|name| name.to_string())
        .collect();
    if let Some(hostname) = hostname {
        let wildcard = hostname
            .parse::<std::net::IpAddr>()
            .is_ok_and(|ip| ip.is_unspecified());
        if !wildcard && !names.iter().any(|name| name == hostname) {
            names.push(hostname.to_string());
        }
    }
    names
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub relay_port: u16,
    pub service_port: u16,
    /// Bind address for both listeners; all interfaces (`::`, or `0.0.0.0` without IPv6) when unset
    pub hostname: Option<String>,
    /// Prefix relay agents must send before they are paired
    pub secret: Option<String>,
    pub tls: TlsMode,
    pub tls_identity: Option<TlsIdentity>,
    pub service_idle_timeout: Duration,
}

impl RelayConfig {
    pub fn new(relay_port: u16, service_port: u16) -> Self {
        Self {
            relay_port,
            service_port,
            hostname: None,
            secret: None,
            tls: TlsMode::Off,
            tls_identity: None,
            service_idle_timeout: SERVICE_IDLE_TIMEOUT,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_tls(mut self, mode: TlsMode, identity: TlsIdentity) -> Self {
        self.tls = mode;
        self.tls_identity = Some(identity);
        self
    }

    pub fn with_service_idle_timeout(mut self, timeout: Duration) -> Self {
        self.service_idle_timeout = timeout;
        self
    }

    pub fn bind_host(&self) -> &str {
        self.hostname.as_deref().unwrap_or(ANY_HOST)
    }

    /// Secret bytes, if a non-empty secret is configured
    fn secret_bytes(&self) -> Option<Bytes> {
        self.secret
            .as_deref()
            .filter(|secret| !secret.is_empty())
            .map(|secret| Bytes::copy_from_slice(secret.as_bytes()))
    }

    /// Translate into listen options for the relay and the service endpoint
    pub fn endpoint_configs(&self) -> Result<(EndpointConfig, EndpointConfig), RelayServerError> {
        let acceptor = match self.tls {
            TlsMode::Off => None,
            mode => {
                let identity = self.tls_identity.as_ref().ok_or_else(|| {
                    RelayServerError::Config(format!(
                        "TLS mode {:?} requires a certificate",
                        mode
                    ))
                })?;
                Some(identity.acceptor(self.hostname.as_deref())?)
            }
        };

        let secret = self.secret_bytes();
        let relay = EndpointConfig {
            kind: EndpointKind::Relay,
            host: self.bind_host().to_string(),
            port: self.relay_port,
            tls: acceptor
                .clone()
                .filter(|_| self.tls.secures(EndpointKind::Relay)),
            settings: ConnectionSettings {
                secret,
                always_buffer: false,
                idle_timeout: None,
            },
        };

        let service = EndpointConfig {
            kind: EndpointKind::Service,
            host: self.bind_host().to_string(),
            port: self.service_port,
            tls: acceptor.filter(|_| self.tls.secures(EndpointKind::Service)),
            settings: ConnectionSettings {
                secret: None,
                always_buffer: true,
                idle_timeout: Some(self.service_idle_timeout),
            },
        };

        Ok((relay, service))
    }
}

/// Snapshot of the coordinator's bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub relay: EndpointStats,
    pub service: EndpointStats,
    /// Pairings made since start
    pub pairings: u64,
}

enum Command {
    Stats(oneshot::Sender<RelayStats>),
}

/// Running relay: both listeners plus the coordinator task
pub struct RelayServer {
    relay_addr: SocketAddr,
    service_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    coordinator: Option<JoinHandle<()>>,
}

impl RelayServer {
    /// Bind both listeners and start pairing connections
    pub async fn start(config: RelayConfig) -> Result<Self, RelayServerError> {
        let (relay_config, service_config) = config.endpoint_configs()?;

        let shutdown = CancellationToken::new();
        let (events_tx, events_rx) = event_channel();

        let relay = Endpoint::start(relay_config, events_tx.clone(), &shutdown).await?;
        let service = match Endpoint::start(service_config, events_tx, &shutdown).await {
            Ok(service) => service,
            Err(e) => {
                shutdown.cancel();
                return Err(e.into());
            }
        };

        let relay_addr = relay.local_addr();
        let service_addr = service.local_addr();
        info!(
            "Relay started: agents on {}, clients on {}",
            relay_addr, service_addr
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            relay,
            service,
            pairings: 0,
        };
        let handle = tokio::spawn(coordinator.run(events_rx, commands_rx, shutdown.clone()));

        Ok(Self {
            relay_addr,
            service_addr,
            commands: commands_tx,
            shutdown,
            coordinator: Some(handle),
        })
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    pub fn service_addr(&self) -> SocketAddr {
        self.service_addr
    }

    pub async fn stats(&self) -> Result<RelayStats, RelayServerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .map_err(|_| RelayServerError::Stopped)?;
        rx.await.map_err(|_| RelayServerError::Stopped)
    }

    /// Stop both listeners and force-close every tracked connection
    pub async fn shutdown(mut self) {
        info!("Shutting down relay");
        self.shutdown.cancel();
        if let Some(coordinator) = self.coordinator.take() {
            let _ = coordinator.await;
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Coordinator {
    relay: Endpoint,
    service: Endpoint,
    pairings: u64,
}

impl Coordinator {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<(EndpointKind, EndpointEvent)>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(command) = commands.recv() => match command {
                    Command::Stats(reply) => {
                        let _ = reply.send(self.stats());
                    }
                },

                Some((kind, event)) = events.recv() => match event {
                    EndpointEvent::Eligible(connection) => self.on_eligible(kind, connection),
                    EndpointEvent::Closed(id) => {
                        self.endpoint_mut(kind).remove(id);
                    }
                },

                else => break,
            }
        }

        self.relay.stop();
        self.service.stop();
    }

    fn endpoint_mut(&mut self, kind: EndpointKind) -> &mut Endpoint {
        match kind {
            EndpointKind::Relay => &mut self.relay,
            EndpointKind::Service => &mut self.service,
        }
    }

    /// `(own, opposite)` endpoints for a connection arriving on `kind`
    fn endpoints_mut(&mut self, kind: EndpointKind) -> (&mut Endpoint, &mut Endpoint) {
        match kind {
            EndpointKind::Relay => (&mut self.relay, &mut self.service),
            EndpointKind::Service => (&mut self.service, &mut self.relay),
        }
    }

    /// Match a newly eligible connection against the oldest one waiting on the other
    /// side, or queue it on its own side.
    fn on_eligible(&mut self, kind: EndpointKind, mut connection: Connection) {
        if connection.is_closed() {
            debug!(
                "{} connection {} closed before it could be matched",
                kind,
                connection.id()
            );
            return;
        }

        let (own, opposite) = self.endpoints_mut(kind);
        match opposite.take_oldest_pending() {
            Some(mut partner) => {
                connection.pair_with(&partner);
                partner.pair_with(&connection);
                info!(
                    "Paired {} connection {} ({}) with {} connection {} ({})",
                    kind,
                    connection.id(),
                    connection.remote_addr(),
                    partner.kind(),
                    partner.id(),
                    partner.remote_addr()
                );
                own.mark_active(connection);
                opposite.mark_active(partner);
                self.pairings += 1;
            }
            None => own.admit(connection),
        }
    }

    fn stats(&self) -> RelayStats {
        RelayStats {
            relay: self.relay.stats(),
            service: self.service.stats(),
            pairings: self.pairings,
        }
    }
}
