//! Per-connection protocol dispatch.
//!
//! # Responsibilities
//! - Read the first bytes of each accepted connection under a deadline
//! - Drive the [`Sniffer`] until it matches or rejects
//! - Terminate TLS when the prefix is a TLS record, then sniff again
//! - Hand the connection, with its sniffed bytes replayed, to one handler
//!
//! # Data Flow
//! ```text
//! TcpStream ─▶ sniff ─┬─ Matched(tls)  ─▶ TlsAcceptor(Rewind) ─▶ sniff again
//!                     ├─ Matched(p)    ─▶ handler.handle(Rewind, info)
//!                     ├─ timeout, 0 B  ─▶ server-first handler (if configured)
//!                     └─ Rejected      ─▶ drop (connection closed)
//! ```
//!
//! # Design Decisions
//! - The handler is chosen once per connection; nothing is re-routed later
//! - Settings are swapped atomically on config reload and only affect
//!   connections accepted afterwards

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::io::AsyncReadExt;
use tokio_rustls::TlsAcceptor;

use crate::config::DispatchConfig;
use crate::net::{ConnectionId, Rewind};
use crate::observability::metrics;
use crate::protocol::descriptor::ProtocolDescriptor;
use crate::protocol::handler::{AsyncIo, BoxedIo, ConnectionInfo, ProtocolError, ProtocolHandler};
use crate::protocol::recognizer::{RecognizerOptions, RecognizerSet};
use crate::protocol::sniffer::{RejectReason, SniffState, Sniffer};

const READ_CHUNK: usize = 2048;

/// Hot-swappable dispatch parameters.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_sniff_bytes: usize,
    pub first_packet_timeout: Duration,
    /// Protocol that speaks first; gets connections that send nothing.
    pub server_first: Option<ProtocolDescriptor>,
    pub accept_proxy_protocol: bool,
    pub nrpc_magic: [u8; 4],
}

impl DispatchSettings {
    pub fn from_config(config: &DispatchConfig, nrpc_magic: [u8; 4]) -> Self {
        Self {
            max_sniff_bytes: config.max_sniff_bytes,
            first_packet_timeout: Duration::from_millis(config.first_packet_timeout_ms),
            server_first: config
                .server_first_protocol
                .as_deref()
                .and_then(ProtocolDescriptor::by_name)
                .copied(),
            accept_proxy_protocol: config.accept_proxy_protocol,
            nrpc_magic,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default(), *b"NRPC")
    }
}

#[derive(Debug)]
struct Snapshot {
    settings: DispatchSettings,
    recognizers: RecognizerSet,
}

impl Snapshot {
    fn new(settings: DispatchSettings) -> Self {
        let recognizers = RecognizerSet::standard(&RecognizerOptions {
            nrpc_magic: settings.nrpc_magic,
            accept_proxy_protocol: settings.accept_proxy_protocol,
            max_prefix_len: settings.max_sniff_bytes,
        });
        Self { settings, recognizers }
    }
}

/// Routes accepted connections to protocol handlers.
pub struct ProtocolDispatcher {
    snapshot: ArcSwap<Snapshot>,
    handlers: Vec<Arc<dyn ProtocolHandler>>,
    tls: Option<TlsAcceptor>,
}

impl ProtocolDispatcher {
    pub fn new(settings: DispatchSettings) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::new(settings)),
            handlers: Vec::new(),
            tls: None,
        }
    }

    pub fn with_tls(mut self, acceptor: Option<TlsAcceptor>) -> Self {
        self.tls = acceptor;
        self
    }

    /// Register a handler; earlier registrations win when several support a protocol.
    pub fn with_handler(mut self, handler: Arc<dyn ProtocolHandler>) -> Self {
        tracing::debug!(handler = handler.name(), "Protocol handler registered");
        self.handlers.push(handler);
        self
    }

    /// Replace the dispatch settings for subsequently accepted connections.
    pub fn update_settings(&self, settings: DispatchSettings) {
        tracing::info!(
            max_sniff_bytes = settings.max_sniff_bytes,
            first_packet_timeout_ms = settings.first_packet_timeout.as_millis() as u64,
            accept_proxy_protocol = settings.accept_proxy_protocol,
            "Dispatch settings updated"
        );
        self.snapshot.store(Arc::new(Snapshot::new(settings)));
    }

    pub fn settings(&self) -> DispatchSettings {
        self.snapshot.load().settings.clone()
    }

    fn handler_for(&self, protocol: &ProtocolDescriptor) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.iter().find(|h| h.supports(protocol)).cloned()
    }

    /// Classify `stream` and run the matching handler to completion.
    ///
    /// Returns the protocol the connection was served as. Any error means the
    /// connection was closed; rejections are counted but not reported to the peer.
    pub async fn dispatch<S: AsyncIo>(
        &self,
        stream: S,
        peer_addr: SocketAddr,
        id: ConnectionId,
    ) -> Result<ProtocolDescriptor, ProtocolError> {
        let snapshot = self.snapshot.load_full();
        let settings = &snapshot.settings;
        let mut io: BoxedIo = Box::new(stream);
        let mut secure = false;
        let mut proxied_addr = None;

        loop {
            let mut sniffer = Sniffer::new(&snapshot.recognizers);
            let protocol = match sniff(&mut io, &mut sniffer, settings, secure).await {
                Ok(protocol) => protocol,
                Err(e) => {
                    metrics::record_rejection(rejection_label(&e));
                    tracing::debug!(connection_id = %id, peer_addr = %peer_addr, error = %e, "Connection rejected");
                    return Err(e);
                }
            };
            proxied_addr = proxied_addr.or(sniffer.proxy_source());
            let replay = Rewind::new(sniffer.into_buffer().freeze(), io);

            if protocol == ProtocolDescriptor::TLS {
                if secure {
                    return Err(ProtocolError::NestedTls);
                }
                let acceptor = self.tls.as_ref().ok_or(ProtocolError::TlsUnavailable)?;
                let tls_stream = acceptor.accept(replay).await.map_err(ProtocolError::Handshake)?;
                tracing::trace!(connection_id = %id, "TLS terminated, sniffing inner stream");
                io = Box::new(tls_stream);
                secure = true;
                continue;
            }

            let protocol = if secure { protocol.secure_variant() } else { protocol };
            let handler = self
                .handler_for(&protocol)
                .ok_or(ProtocolError::NoHandler(protocol))?;

            metrics::record_connection(protocol.name);
            tracing::debug!(
                connection_id = %id,
                peer_addr = %peer_addr,
                protocol = %protocol,
                handler = handler.name(),
                "Protocol recognized"
            );

            let conn = ConnectionInfo {
                id,
                peer_addr,
                proxied_addr,
                protocol,
                secure,
            };
            handler.handle(Box::new(replay), conn).await?;
            return Ok(protocol);
        }
    }
}

/// Read until the sniffer leaves `Accumulating` or the deadline passes.
async fn sniff(
    io: &mut BoxedIo,
    sniffer: &mut Sniffer<'_>,
    settings: &DispatchSettings,
    secure: bool,
) -> Result<ProtocolDescriptor, ProtocolError> {
    let deadline = tokio::time::Instant::now() + settings.first_packet_timeout;
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        // Never read past the ceiling; whatever is read must be replayed.
        let room = settings.max_sniff_bytes.saturating_sub(sniffer.buffered());
        if room == 0 {
            return Err(ProtocolError::Rejected(RejectReason::Overflow));
        }
        let want = room.min(READ_CHUNK);
        let n = match tokio::time::timeout_at(deadline, io.read(&mut chunk[..want])).await {
            Ok(read) => read?,
            Err(_) => {
                return match settings.server_first {
                    Some(protocol) if sniffer.buffered() == 0 && !secure => Ok(protocol),
                    _ => Err(ProtocolError::FirstPacketTimeout),
                };
            }
        };
        if n == 0 {
            return Err(ProtocolError::ClosedBeforeMatch);
        }

        match sniffer.feed(&chunk[..n]) {
            SniffState::Accumulating => continue,
            SniffState::Matched(protocol) => return Ok(protocol),
            SniffState::Rejected(reason) => return Err(ProtocolError::Rejected(reason)),
        }
    }
}

fn rejection_label(err: &ProtocolError) -> &'static str {
    match err {
        ProtocolError::Rejected(reason) => reason.as_str(),
        ProtocolError::FirstPacketTimeout => "timeout",
        ProtocolError::ClosedBeforeMatch => "closed",
        _ => "io",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sniffer::RejectReason;
    use futures_util::future::BoxFuture;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    /// Records the protocol and every byte the handler receives.
    struct Recorder {
        protocols: Vec<ProtocolDescriptor>,
        seen: mpsc::UnboundedSender<(ConnectionInfo, Vec<u8>)>,
    }

    impl ProtocolHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn supports(&self, protocol: &ProtocolDescriptor) -> bool {
            self.protocols.contains(protocol)
        }

        fn handle(&self, mut io: BoxedIo, conn: ConnectionInfo) -> BoxFuture<'static, Result<(), ProtocolError>> {
            let seen = self.seen.clone();
            Box::pin(async move {
                let mut bytes = Vec::new();
                io.read_to_end(&mut bytes).await?;
                let _ = seen.send((conn, bytes));
                Ok(())
            })
        }
    }

    fn dispatcher(
        settings: DispatchSettings,
        protocols: Vec<ProtocolDescriptor>,
    ) -> (ProtocolDispatcher, mpsc::UnboundedReceiver<(ConnectionInfo, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = ProtocolDispatcher::new(settings).with_handler(Arc::new(Recorder { protocols, seen: tx }));
        (dispatcher, rx)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn handler_sees_every_byte_exactly_once() {
        let (dispatcher, mut seen) = dispatcher(DispatchSettings::default(), vec![ProtocolDescriptor::HTTP1_1]);
        let (mut client, server) = tokio::io::duplex(1024);
        let request = b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n";

        let writer = tokio::spawn(async move {
            for b in request.iter() {
                client.write_all(std::slice::from_ref(b)).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let protocol = dispatcher.dispatch(server, peer(), ConnectionId::new()).await.unwrap();
        writer.await.unwrap();
        assert_eq!(protocol, ProtocolDescriptor::HTTP1_1);

        let (conn, bytes) = seen.recv().await.unwrap();
        assert_eq!(bytes, request.to_vec());
        assert_eq!(conn.protocol, ProtocolDescriptor::HTTP1_1);
        assert!(!conn.secure);
    }

    #[tokio::test]
    async fn unknown_prefix_is_closed_without_handler() {
        let (dispatcher, mut seen) = dispatcher(DispatchSettings::default(), vec![ProtocolDescriptor::HTTP1_1]);
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"\x00\x01garbage").await.unwrap();

        let err = dispatcher.dispatch(server, peer(), ConnectionId::new()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Rejected(RejectReason::Unrecognized)));
        drop(dispatcher);
        assert!(seen.recv().await.is_none());
    }

    #[tokio::test]
    async fn silent_client_goes_to_server_first_protocol() {
        let settings = DispatchSettings {
            first_packet_timeout: Duration::from_millis(50),
            server_first: Some(ProtocolDescriptor::MYSQL),
            ..Default::default()
        };
        let (dispatcher, mut seen) = dispatcher(settings, vec![ProtocolDescriptor::MYSQL]);
        let (client, server) = tokio::io::duplex(1024);

        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            drop(client);
        });
        let protocol = dispatcher.dispatch(server, peer(), ConnectionId::new()).await.unwrap();
        closer.await.unwrap();

        assert_eq!(protocol, ProtocolDescriptor::MYSQL);
        let (_, bytes) = seen.recv().await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn silent_client_without_server_first_times_out() {
        let settings = DispatchSettings {
            first_packet_timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let (dispatcher, _seen) = dispatcher(settings, vec![ProtocolDescriptor::MYSQL]);
        let (_client, server) = tokio::io::duplex(1024);

        let err = dispatcher.dispatch(server, peer(), ConnectionId::new()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FirstPacketTimeout));
    }

    #[tokio::test]
    async fn partial_prefix_then_silence_is_not_server_first() {
        let settings = DispatchSettings {
            first_packet_timeout: Duration::from_millis(30),
            server_first: Some(ProtocolDescriptor::MYSQL),
            ..Default::default()
        };
        let (dispatcher, _seen) = dispatcher(settings, vec![ProtocolDescriptor::MYSQL]);
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"GE").await.unwrap();

        let err = dispatcher.dispatch(server, peer(), ConnectionId::new()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FirstPacketTimeout));
    }

    #[tokio::test]
    async fn missing_handler_is_an_error() {
        let (dispatcher, _seen) = dispatcher(DispatchSettings::default(), vec![]);
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"NRPC\x01").await.unwrap();

        let err = dispatcher.dispatch(server, peer(), ConnectionId::new()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::NoHandler(p) if p == ProtocolDescriptor::NRPC));
    }

    #[tokio::test]
    async fn tls_without_certificate_is_refused() {
        let (dispatcher, _seen) = dispatcher(DispatchSettings::default(), vec![ProtocolDescriptor::HTTPS1_1]);
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(&[0x16, 0x03, 0x01, 0x00, 0x10]).await.unwrap();

        let err = dispatcher.dispatch(server, peer(), ConnectionId::new()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::TlsUnavailable));
    }

    #[tokio::test]
    async fn oversized_proxy_v2_header_is_rejected() {
        let settings = DispatchSettings {
            accept_proxy_protocol: true,
            max_sniff_bytes: 64,
            ..Default::default()
        };
        let (dispatcher, _seen) = dispatcher(settings, vec![ProtocolDescriptor::NRPC]);
        let (mut client, server) = tokio::io::duplex(4096);
        let mut header = crate::protocol::recognizer::PROXY_V2_SIGNATURE.to_vec();
        header.extend_from_slice(&[0x21, 0x11]);
        header.extend_from_slice(&1000u16.to_be_bytes());
        header.extend_from_slice(&[0u8; 500]);
        client.write_all(&header).await.unwrap();

        let err = dispatcher.dispatch(server, peer(), ConnectionId::new()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Rejected(RejectReason::Overflow)), "{:?}", err);
    }

    #[tokio::test]
    async fn proxy_header_sets_client_address() {
        let settings = DispatchSettings {
            accept_proxy_protocol: true,
            ..Default::default()
        };
        let (dispatcher, mut seen) = dispatcher(settings, vec![ProtocolDescriptor::NRPC]);
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"PROXY TCP4 203.0.113.7 10.0.0.1 51000 9000\r\nNRPC\x01")
            .await
            .unwrap();
        drop(client);

        dispatcher.dispatch(server, peer(), ConnectionId::new()).await.unwrap();
        let (conn, bytes) = seen.recv().await.unwrap();
        assert_eq!(conn.client_addr(), "203.0.113.7:51000".parse().unwrap());
        assert_eq!(bytes, b"NRPC\x01".to_vec());
    }

    #[tokio::test]
    async fn settings_swap_applies_to_new_connections() {
        let (dispatcher, mut seen) = dispatcher(DispatchSettings::default(), vec![ProtocolDescriptor::NRPC]);
        dispatcher.update_settings(DispatchSettings {
            nrpc_magic: *b"XRPC",
            ..Default::default()
        });
        assert_eq!(dispatcher.settings().nrpc_magic, *b"XRPC");

        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"XRPC\x01").await.unwrap();
        drop(client);
        dispatcher.dispatch(server, peer(), ConnectionId::new()).await.unwrap();
        assert_eq!(seen.recv().await.unwrap().1, b"XRPC\x01".to_vec());
    }
}
