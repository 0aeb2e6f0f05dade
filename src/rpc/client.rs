//! One shared NRPC client per remote address.
//!
//! # Data Flow
//! ```text
//! caller ──serialize──► outbound queue ──► connection task ──frame──► socket
//!    ▲                                         │
//!    └──── oneshot ◄── correlation table ◄─────┘ (Response by request id)
//! ```
//!
//! # Design Decisions
//! - Each client owns a small dedicated I/O runtime; socket work and framing
//!   never run on the caller's runtime
//! - A single manager task owns the socket, so at most one connect or
//!   reconnect attempt is ever in flight
//! - The manager publishes its link state over a `watch` channel; callers wait
//!   for `Up` within the connect timeout
//! - Heartbeats: a ping is sent after each silent heartbeat window; after
//!   `missed_heartbeats` consecutive silent windows the link is torn down,
//!   pending calls fail, and a reconnect follows after the reconnect interval

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;

use crate::config::NrpcClientConfig;
use crate::lifecycle::{Shutdown, ShutdownSignal};
use crate::observability::metrics;
use crate::resilience::{reconnect_delay, CallTimeout};
use crate::rpc::codec::{self, PacketKind, RpcCodec, RpcPacket, FLAG_NO_ACK};
use crate::rpc::correlation::CorrelationTable;
use crate::rpc::error::RpcError;
use crate::rpc::instance::{DispatchTable, InterfaceDescriptor, ParameterNameResolver, ReturnKind, RpcInstanceKey};
use crate::rpc::message::{RpcRequest, RpcResponse, RpcStatus};

const OUTBOUND_QUEUE: usize = 1024;

/// Client tuning resolved from [`NrpcClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub io_threads: usize,
    pub io_ratio: u32,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub missed_heartbeats: u32,
    pub reconnect_interval: Duration,
    pub reconnect_enabled: bool,
    pub reconnect_jitter: f64,
    pub heartbeat_log: bool,
    pub message_max_length: usize,
    pub default_timeout_ms: i64,
    pub default_version: String,
    pub method_overwrite_check: bool,
    pub magic: [u8; 4],
}

impl ClientSettings {
    pub fn from_config(config: &NrpcClientConfig) -> Self {
        Self {
            io_threads: config.io_threads.max(1),
            io_ratio: config.io_ratio,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms.max(1)),
            missed_heartbeats: config.missed_heartbeats.max(1),
            reconnect_interval: Duration::from_millis(config.reconnect_interval_ms),
            reconnect_enabled: config.reconnect_enabled,
            reconnect_jitter: config.reconnect_jitter,
            heartbeat_log: config.heartbeat_log,
            message_max_length: config.message_max_length,
            default_timeout_ms: config.default_timeout_ms,
            default_version: config.default_version.clone(),
            method_overwrite_check: config.method_overwrite_check,
            // Validation rejects magics that are not four bytes.
            magic: codec::parse_magic(&config.magic).unwrap_or(codec::DEFAULT_MAGIC),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from_config(&NrpcClientConfig::default())
    }
}

/// Callbacks for connection lifecycle events.
pub trait ClientObserver: Send + Sync {
    fn on_connect(&self, _address: SocketAddr) {}

    fn on_disconnect(&self, _address: SocketAddr, _reason: &str) {}

    fn on_error(&self, _address: SocketAddr, _error: &RpcError) {}
}

/// A dedicated multi-thread runtime, shut down in the background on drop so
/// it can be released from inside another runtime.
#[derive(Debug)]
pub(crate) struct IoRuntime {
    runtime: Option<Runtime>,
}

impl IoRuntime {
    /// `io_ratio` (1-100) is the share of scheduler ticks spent polling I/O;
    /// 100 polls the driver on every tick.
    pub(crate) fn new(name: &str, threads: usize, io_ratio: u32) -> std::io::Result<Self> {
        let ratio = io_ratio.clamp(1, 100);
        let event_interval = 1 + 60 * (100 - ratio) / 100;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .event_interval(event_interval)
            .thread_name(name)
            .enable_all()
            .build()?;
        Ok(Self { runtime: Some(runtime) })
    }

    pub(crate) fn handle(&self) -> Option<&Handle> {
        self.runtime.as_ref().map(Runtime::handle)
    }

    pub(crate) fn block_on<F: std::future::Future>(&self, future: F) -> Option<F::Output> {
        self.runtime.as_ref().map(|rt| rt.block_on(future))
    }
}

impl Drop for IoRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// A live link: queue into the connection task plus its pending calls.
#[derive(Debug)]
struct Connection {
    outbound: mpsc::Sender<RpcPacket>,
    table: Arc<CorrelationTable>,
}

#[derive(Debug, Clone)]
enum LinkState {
    Connecting,
    Up(Arc<Connection>),
    Closed,
}

pub struct RpcClient {
    address: SocketAddr,
    settings: ClientSettings,
    state: watch::Receiver<LinkState>,
    instances: DashMap<RpcInstanceKey, Arc<DispatchTable>>,
    shutdown: Shutdown,
    in_flight: AtomicUsize,
    reconnects: Arc<AtomicU64>,
    last_error: Arc<Mutex<Option<String>>>,
    // Declared last: dropped after everything that may reference its tasks.
    _runtime: IoRuntime,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("address", &self.address)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcClient {
    /// Start the client's I/O runtime and connection manager.
    ///
    /// Returns immediately; the first connect happens in the background and
    /// calls wait for it up to the connect timeout.
    pub fn connect(
        address: SocketAddr,
        settings: ClientSettings,
        observers: Vec<Arc<dyn ClientObserver>>,
    ) -> Result<Arc<Self>, RpcError> {
        let runtime = IoRuntime::new("nrpc-io", settings.io_threads, settings.io_ratio)
            .map_err(|e| RpcError::Connect(format!("{}: failed to start I/O runtime: {}", address, e)))?;
        let handle = runtime
            .handle()
            .cloned()
            .ok_or_else(|| RpcError::Connect(format!("{}: I/O runtime unavailable", address)))?;

        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let shutdown = Shutdown::new();
        let reconnects = Arc::new(AtomicU64::new(0));
        let last_error = Arc::new(Mutex::new(None));

        let manager = Manager {
            address,
            settings: settings.clone(),
            state: state_tx,
            observers,
            shutdown: shutdown.subscribe(),
            reconnects: Arc::clone(&reconnects),
            last_error: Arc::clone(&last_error),
        };
        handle.spawn(manager.run());

        tracing::debug!(address = %address, io_threads = settings.io_threads, "RPC client created");

        Ok(Arc::new(Self {
            address,
            settings,
            state: state_rx,
            instances: DashMap::new(),
            shutdown,
            in_flight: AtomicUsize::new(0),
            reconnects,
            last_error,
            _runtime: runtime,
        }))
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn default_timeout_ms(&self) -> i64 {
        self.settings.default_timeout_ms
    }

    /// Dispatch table for `interface`, built on first use and cached.
    pub fn instance(
        &self,
        interface: &InterfaceDescriptor,
        resolver: &dyn ParameterNameResolver,
    ) -> Result<Arc<DispatchTable>, RpcError> {
        let key = interface.key(&self.settings.default_version);
        if let Some(table) = self.instances.get(&key) {
            return Ok(Arc::clone(table.value()));
        }
        let entry = self.instances.entry(key).or_try_insert_with(|| {
            DispatchTable::build(
                interface,
                &self.settings.default_version,
                resolver,
                self.settings.method_overwrite_check,
            )
            .map(Arc::new)
        })?;
        Ok(Arc::clone(entry.value()))
    }

    pub fn cached_instances(&self) -> usize {
        self.instances.len()
    }

    /// Send a request and wait for its response under `timeout`.
    pub async fn call(&self, request: RpcRequest, timeout: CallTimeout, kind: ReturnKind) -> Result<Value, RpcError> {
        let _in_flight = InFlight::enter(&self.in_flight);
        let connection = self.connection().await?;
        let body = Bytes::from(serde_json::to_vec(&request)?);

        if kind == ReturnKind::OneWay {
            // One-way requests are never correlated.
            let packet = RpcPacket::request(0, body).with_flags(FLAG_NO_ACK);
            connection
                .outbound
                .send(packet)
                .await
                .map_err(|_| RpcError::Transport("connection closed".into()))?;
            return Ok(Value::Null);
        }

        let (pending, rx) = connection.table.register();
        let request_id = pending.id();
        let exchange = async {
            connection
                .outbound
                .send(RpcPacket::request(request_id, body))
                .await
                .map_err(|_| RpcError::Transport("connection closed".into()))?;
            rx.await
                .map_err(|_| RpcError::Transport("connection closed before response".into()))?
        };

        let reply = match timeout.duration() {
            Some(limit) => match time::timeout(limit, exchange).await {
                Ok(reply) => reply,
                Err(_) => {
                    tracing::debug!(address = %self.address, request_id, "RPC call timed out");
                    Err(RpcError::Timeout(limit))
                }
            },
            None => exchange.await,
        };
        // Dropping the guard removes the entry, so a late response is ignored.
        drop(pending);

        let response: RpcResponse = serde_json::from_slice(&reply?)?;
        match response.status {
            RpcStatus::Ok if kind == ReturnKind::Unit => Ok(Value::Null),
            RpcStatus::Ok => Ok(response.data),
            status => Err(RpcError::Remote {
                status,
                message: response.message.unwrap_or_default(),
            }),
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, RpcError> {
        let mut state = self.state.clone();
        let wait = async {
            loop {
                let current = state.borrow_and_update().clone();
                match current {
                    LinkState::Up(connection) => return Ok(connection),
                    LinkState::Closed => return Err(self.connect_error("client is closed")),
                    LinkState::Connecting => {}
                }
                if state.changed().await.is_err() {
                    return Err(self.connect_error("connection manager stopped"));
                }
            }
        };
        match time::timeout(self.settings.connect_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(self.connect_error(&format!(
                "not connected within {:?}",
                self.settings.connect_timeout
            ))),
        }
    }

    fn connect_error(&self, reason: &str) -> RpcError {
        let last = self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match last {
            Some(cause) => RpcError::Connect(format!("{}: {} ({})", self.address, reason, cause)),
            None => RpcError::Connect(format!("{}: {}", self.address, reason)),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.state.borrow(), LinkState::Up(_))
    }

    /// Closed clients are replaced by the registry on next use.
    pub fn is_closed(&self) -> bool {
        matches!(&*self.state.borrow(), LinkState::Closed)
    }

    /// Calls currently between send and response.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Stop the connection manager; pending calls fail with a transport error.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

enum LinkEnd {
    Shutdown,
    Lost(String),
}

/// Owns the socket for one client; runs on the client's I/O runtime.
struct Manager {
    address: SocketAddr,
    settings: ClientSettings,
    state: watch::Sender<LinkState>,
    observers: Vec<Arc<dyn ClientObserver>>,
    shutdown: ShutdownSignal,
    reconnects: Arc<AtomicU64>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl Manager {
    async fn run(mut self) {
        loop {
            self.state.send_replace(LinkState::Connecting);

            let attempt = tokio::select! {
                _ = self.shutdown.recv() => break,
                attempt = time::timeout(self.settings.connect_timeout, TcpStream::connect(self.address)) => attempt,
            };
            match attempt {
                Ok(Ok(stream)) => {
                    self.set_last_error(None);
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(address = %self.address, error = %e, "Failed to set TCP_NODELAY");
                    }
                    match self.serve(stream).await {
                        LinkEnd::Shutdown => break,
                        LinkEnd::Lost(reason) => {
                            tracing::warn!(address = %self.address, reason = %reason, "RPC connection lost");
                            self.set_last_error(Some(reason.clone()));
                            for observer in &self.observers {
                                observer.on_disconnect(self.address, &reason);
                            }
                        }
                    }
                }
                Ok(Err(e)) => self.connect_failed(e.to_string()),
                Err(_) => self.connect_failed(format!("connect timed out after {:?}", self.settings.connect_timeout)),
            }

            if !self.settings.reconnect_enabled {
                break;
            }
            let delay = reconnect_delay(self.settings.reconnect_interval, self.settings.reconnect_jitter);
            tokio::select! {
                _ = self.shutdown.recv() => break,
                _ = time::sleep(delay) => {}
            }
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            metrics::record_reconnect(self.address);
            tracing::info!(address = %self.address, "Reconnecting");
        }

        self.state.send_replace(LinkState::Closed);
        tracing::debug!(address = %self.address, "RPC client closed");
    }

    fn connect_failed(&self, reason: String) {
        tracing::warn!(address = %self.address, reason = %reason, "RPC connect failed");
        let error = RpcError::Connect(reason.clone());
        self.set_last_error(Some(reason));
        for observer in &self.observers {
            observer.on_error(self.address, &error);
        }
    }

    fn set_last_error(&self, reason: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = reason;
    }

    async fn serve(&mut self, stream: TcpStream) -> LinkEnd {
        let framed = Framed::new(stream, RpcCodec::new(self.settings.magic, self.settings.message_max_length));
        let (mut sink, mut frames) = framed.split();
        // Opening ping: the server classifies the connection from its first
        // bytes, so an idle new link must not stay silent.
        if let Err(e) = sink.send(RpcPacket::ping()).await {
            return LinkEnd::Lost(format!("write failed: {}", e));
        }
        let (outbound, mut queue) = mpsc::channel(OUTBOUND_QUEUE);
        let table = CorrelationTable::new();
        self.state.send_replace(LinkState::Up(Arc::new(Connection {
            outbound,
            table: Arc::clone(&table),
        })));

        tracing::info!(address = %self.address, "RPC connection established");
        for observer in &self.observers {
            observer.on_connect(self.address);
        }

        let window = self.settings.heartbeat_interval;
        let mut ticker = time::interval_at(Instant::now() + window, window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heard = false;
        let mut silent_windows = 0u32;

        let end = loop {
            tokio::select! {
                _ = self.shutdown.recv() => break LinkEnd::Shutdown,
                packet = queue.recv() => {
                    let Some(packet) = packet else {
                        break LinkEnd::Lost("outbound queue closed".into());
                    };
                    if let Err(e) = sink.send(packet).await {
                        break LinkEnd::Lost(format!("write failed: {}", e));
                    }
                }
                frame = frames.next() => {
                    let packet = match frame {
                        Some(Ok(packet)) => packet,
                        Some(Err(e)) => break LinkEnd::Lost(format!("read failed: {}", e)),
                        None => break LinkEnd::Lost("connection closed by peer".into()),
                    };
                    heard = true;
                    match packet.kind {
                        PacketKind::Response => {
                            if !table.complete(packet.request_id, packet.body) {
                                tracing::debug!(
                                    address = %self.address,
                                    request_id = packet.request_id,
                                    "Late response dropped"
                                );
                            }
                        }
                        PacketKind::Ping => {
                            if let Err(e) = sink.send(RpcPacket::pong()).await {
                                break LinkEnd::Lost(format!("write failed: {}", e));
                            }
                        }
                        PacketKind::Pong => {
                            if self.settings.heartbeat_log {
                                tracing::debug!(address = %self.address, "Heartbeat acknowledged");
                            }
                        }
                        PacketKind::Request => {
                            tracing::warn!(address = %self.address, "Unexpected request frame from server");
                        }
                    }
                }
                _ = ticker.tick() => {
                    if heard {
                        heard = false;
                        silent_windows = 0;
                        continue;
                    }
                    silent_windows += 1;
                    if silent_windows >= self.settings.missed_heartbeats {
                        break LinkEnd::Lost(format!("{} heartbeat windows without traffic", silent_windows));
                    }
                    if self.settings.heartbeat_log {
                        tracing::debug!(address = %self.address, silent_windows, "Sending heartbeat");
                    }
                    if let Err(e) = sink.send(RpcPacket::ping()).await {
                        break LinkEnd::Lost(format!("write failed: {}", e));
                    }
                }
            }
        };

        let reason = match &end {
            LinkEnd::Shutdown => "client shut down".to_string(),
            LinkEnd::Lost(reason) => reason.clone(),
        };
        self.state.send_replace(LinkState::Connecting);
        // Callers still holding this connection must not queue behind the teardown.
        queue.close();
        let failed = table.fail_all(RpcError::Transport(reason));
        if failed > 0 {
            tracing::debug!(address = %self.address, failed, "Failed in-flight calls");
        }
        end
    }
}
