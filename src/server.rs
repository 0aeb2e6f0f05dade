//! The shared-port server: accept loop, dispatcher wiring, hot reload, drain.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::http::HttpHandler;
use crate::lifecycle::Shutdown;
use crate::net::{tls, ConnectionTracker, Listener, ListenerError};
use crate::protocol::{DispatchSettings, ForwardHandler, ProtocolDispatcher};
use crate::rpc::codec;
use crate::rpc::{RpcServerHandler, ServiceRegistry};

/// Upper bound on waiting for in-flight connections after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to load TLS material: {0}")]
    Tls(std::io::Error),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

pub struct PolyportServer {
    dispatcher: Arc<ProtocolDispatcher>,
    tracker: ConnectionTracker,
    nrpc_magic: [u8; 4],
}

impl PolyportServer {
    /// Wire handlers from `config`. NRPC requests are served from `services`.
    pub async fn new(config: &ServerConfig, services: ServiceRegistry) -> Result<Self, ServerError> {
        let nrpc_magic = codec::parse_magic(&config.nrpc.server.magic).unwrap_or(codec::DEFAULT_MAGIC);
        let acceptor = tls::acceptor_from_config(config.listener.tls.as_ref())
            .await
            .map_err(ServerError::Tls)?;

        let mut dispatcher = ProtocolDispatcher::new(DispatchSettings::from_config(&config.dispatch, nrpc_magic))
            .with_tls(acceptor);
        if config.http.enabled {
            dispatcher = dispatcher.with_handler(Arc::new(HttpHandler::new(&config.http)));
        }
        if config.nrpc.server.enabled {
            dispatcher = dispatcher.with_handler(Arc::new(RpcServerHandler::new(services, &config.nrpc.server)));
        }
        for forward in &config.forwards {
            match ForwardHandler::from_config(forward) {
                Some(handler) => dispatcher = dispatcher.with_handler(Arc::new(handler)),
                None => tracing::warn!(protocol = %forward.protocol, backend = %forward.backend, "Ignoring invalid forward"),
            }
        }

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            tracker: ConnectionTracker::new(),
            nrpc_magic,
        })
    }

    pub fn dispatcher(&self) -> &Arc<ProtocolDispatcher> {
        &self.dispatcher
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Serve until `shutdown` triggers, applying config reloads as they arrive.
    ///
    /// Reloads only change dispatch settings; listener, TLS and handler
    /// changes need a restart.
    pub async fn run(
        self,
        listener: Listener,
        mut reloads: mpsc::UnboundedReceiver<ServerConfig>,
        shutdown: Shutdown,
    ) -> Result<(), ServerError> {
        let mut stop = shutdown.subscribe();
        tracing::info!(
            address = ?listener.local_addr().ok(),
            max_connections = listener.max_connections(),
            "Server accepting connections"
        );

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting");
                    break;
                }
                Some(config) = reloads.recv() => {
                    self.dispatcher.update_settings(DispatchSettings::from_config(&config.dispatch, self.nrpc_magic));
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(ListenerError::Closed) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let guard = self.tracker.track();
                    let dispatcher = Arc::clone(&self.dispatcher);
                    tokio::spawn(async move {
                        let id = guard.id();
                        if let Err(e) = dispatcher.dispatch(stream, peer_addr, id).await {
                            tracing::debug!(connection_id = %id, peer_addr = %peer_addr, error = %e, "Connection ended with error");
                        }
                        drop(permit);
                        drop(guard);
                    });
                }
            }
        }

        if self.tracker.drain(DRAIN_TIMEOUT).await {
            tracing::info!("All connections drained");
        } else {
            tracing::warn!(remaining = self.tracker.active_count(), "Drain timed out");
        }
        Ok(())
    }
}
