//! Byte-for-byte TCP forwarding for protocols the server does not terminate.
//!
//! MQTT, MySQL and Dubbo connections are relayed to a configured backend. The
//! sniffed prefix reaches the backend first because the incoming stream
//! replays it.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::net::TcpStream;

use crate::config::ForwardConfig;
use crate::protocol::descriptor::ProtocolDescriptor;
use crate::protocol::handler::{BoxedIo, ConnectionInfo, ProtocolError, ProtocolHandler};

#[derive(Debug, Clone)]
pub struct ForwardHandler {
    protocol: ProtocolDescriptor,
    backend: SocketAddr,
    connect_timeout: Duration,
}

impl ForwardHandler {
    pub fn new(protocol: ProtocolDescriptor, backend: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            protocol,
            backend,
            connect_timeout,
        }
    }

    /// Build from a validated `[[forwards]]` entry.
    pub fn from_config(config: &ForwardConfig) -> Option<Self> {
        let protocol = *ProtocolDescriptor::by_name(&config.protocol)?;
        let backend = config.backend.parse().ok()?;
        Some(Self::new(
            protocol,
            backend,
            Duration::from_millis(config.connect_timeout_ms),
        ))
    }
}

impl ProtocolHandler for ForwardHandler {
    fn name(&self) -> &'static str {
        "forward"
    }

    fn supports(&self, protocol: &ProtocolDescriptor) -> bool {
        *protocol == self.protocol
    }

    fn handle(&self, mut io: BoxedIo, conn: ConnectionInfo) -> BoxFuture<'static, Result<(), ProtocolError>> {
        let this = self.clone();
        Box::pin(async move {
            let connect = tokio::time::timeout(this.connect_timeout, TcpStream::connect(this.backend));
            let mut upstream = match connect.await {
                Ok(stream) => stream?,
                Err(_) => {
                    return Err(ProtocolError::handler(
                        this.protocol,
                        format!("connect to {} timed out", this.backend),
                    ))
                }
            };
            if let Err(e) = upstream.set_nodelay(true) {
                tracing::debug!(backend = %this.backend, error = %e, "Failed to set TCP_NODELAY");
            }

            let (sent, received) = tokio::io::copy_bidirectional(&mut io, &mut upstream).await?;
            tracing::debug!(
                connection_id = %conn.id,
                protocol = %this.protocol,
                backend = %this.backend,
                bytes_sent = sent,
                bytes_received = received,
                "Forwarded connection closed"
            );
            Ok(())
        })
    }
}
