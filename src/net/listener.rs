//! Shared-port TCP listener.
//!
//! Every protocol arrives through the same socket, so `max_connections`
//! bounds the whole server. A slot is taken before `accept` so excess
//! clients wait in the kernel backlog instead of in memory.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ListenerConfig;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("cannot bind listener: {0}")]
    Bind(std::io::Error),

    #[error("accept failed: {0}")]
    Accept(std::io::Error),

    /// The slot pool was closed while waiting.
    #[error("listener closed")]
    Closed,
}

pub struct Listener {
    inner: TcpListener,
    slots: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr = config
            .bind_address
            .parse::<SocketAddr>()
            .map_err(|e| ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
        TcpListener::bind(addr)
            .await
            .map(|tcp| Self::from_tcp(tcp, config.max_connections))
            .map_err(ListenerError::Bind)
    }

    /// Wrap an already bound listener (tests bind to port 0).
    pub fn from_tcp(listener: TcpListener, max_connections: usize) -> Self {
        tracing::info!(address = ?listener.local_addr().ok(), max_connections, "Listener bound");
        Self {
            inner: listener,
            slots: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Wait for a free slot, then for the next client.
    ///
    /// The permit is the slot; hold it for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;
        let (stream, peer) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        // Small NRPC frames must not wait on Nagle.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer_addr = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        tracing::debug!(peer_addr = %peer, free_slots = self.slots.available_permits(), "Accepted");
        Ok((stream, peer, ConnectionPermit { _slot: slot }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Released on drop, including when a handler task panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _slot: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_bound_concurrent_connections() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let listener = Listener::from_tcp(tcp, 1);

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let (_s1, _, permit) = listener.accept().await.unwrap();
        assert_eq!(listener.available_permits(), 0);

        let _c2 = TcpStream::connect(addr).await.unwrap();
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(50), listener.accept()).await;
        assert!(blocked.is_err());

        drop(permit);
        let accepted =
            tokio::time::timeout(std::time::Duration::from_millis(500), listener.accept()).await;
        assert!(matches!(accepted, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn bad_bind_address_is_reported() {
        let config = ListenerConfig {
            bind_address: "not-an-address".into(),
            ..Default::default()
        };
        assert!(matches!(Listener::bind(&config).await, Err(ListenerError::Bind(_))));
    }
}
