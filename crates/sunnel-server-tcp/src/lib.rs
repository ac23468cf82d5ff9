//! Reverse TCP/TLS tunnel server
//!
//! Two listeners: a private relay endpoint for trusted agents and a public service
//! endpoint for arbitrary clients. Every eligible connection is paired with the
//! oldest connection waiting on the opposite endpoint, and the two streams are
//! spliced until either side closes.

pub mod connection;
pub mod endpoint;
pub mod relay;
pub mod stream;

pub use connection::{ConnectionSettings, MAX_PENDING_BYTES};
pub use endpoint::{EndpointConfig, EndpointError, EndpointKind, EndpointStats};
pub use relay::{
    RelayConfig, RelayServer, RelayServerError, RelayStats, TlsIdentity, TlsMode,
    DEFAULT_RELAY_PORT, SERVICE_IDLE_TIMEOUT,
};
pub use stream::{BoxedStream, TunnelStream};
pub use sunnel_cert::TlsIdentityConfig;
