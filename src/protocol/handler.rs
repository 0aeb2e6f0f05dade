//! The seam between the dispatcher and protocol implementations.

use std::net::SocketAddr;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::net::ConnectionId;
use crate::protocol::descriptor::ProtocolDescriptor;
use crate::protocol::sniffer::RejectReason;

/// A duplex byte stream a handler can own.
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased connection stream (plain TCP, TLS, with or without replay).
pub type BoxedIo = Box<dyn AsyncIo>;

/// What the dispatcher learned about a connection before hand-off.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    /// Address of the TCP peer.
    pub peer_addr: SocketAddr,
    /// Client address announced by a PROXY header, when one was present.
    pub proxied_addr: Option<SocketAddr>,
    pub protocol: ProtocolDescriptor,
    /// The stream was TLS-terminated by the dispatcher.
    pub secure: bool,
}

impl ConnectionInfo {
    /// The best known address of the real client.
    pub fn client_addr(&self) -> SocketAddr {
        self.proxied_addr.unwrap_or(self.peer_addr)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rejected: {0}")]
    Rejected(RejectReason),

    #[error("no bytes received within the first-packet timeout")]
    FirstPacketTimeout,

    #[error("peer closed the connection before a protocol was recognized")]
    ClosedBeforeMatch,

    #[error("TLS record received but no certificate is configured")]
    TlsUnavailable,

    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),

    #[error("TLS inside TLS is not supported")]
    NestedTls,

    #[error("no handler registered for protocol '{0}'")]
    NoHandler(ProtocolDescriptor),

    #[error("{protocol} handler failed: {message}")]
    Handler {
        protocol: ProtocolDescriptor,
        message: String,
    },
}

impl ProtocolError {
    pub fn handler(protocol: ProtocolDescriptor, err: impl std::fmt::Display) -> Self {
        ProtocolError::Handler {
            protocol,
            message: err.to_string(),
        }
    }
}

/// Serves connections of one or more protocols once they are recognized.
///
/// The stream passed to [`handle`](Self::handle) starts with the sniffed bytes,
/// so the handler sees the connection exactly as the client sent it.
pub trait ProtocolHandler: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn supports(&self, protocol: &ProtocolDescriptor) -> bool;

    fn handle(&self, io: BoxedIo, conn: ConnectionInfo) -> BoxFuture<'static, Result<(), ProtocolError>>;
}
