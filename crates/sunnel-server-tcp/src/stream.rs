//! Byte streams accepted by an endpoint (plain TCP or TLS over TCP)

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional async byte stream a connection can own
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn TunnelStream>;
