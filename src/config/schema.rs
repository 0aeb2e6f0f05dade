//! The `polyport.toml` document.
//!
//! Every table and field has a default, so an empty file is a working
//! single-port server with HTTP and NRPC enabled.

use serde::{Deserialize, Serialize};

/// Root configuration for the multi-protocol server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// The one shared port.
    pub listener: ListenerConfig,

    /// Protocol sniffing settings.
    pub dispatch: DispatchConfig,

    /// HTTP hand-off settings.
    pub http: HttpConfig,

    /// NRPC server and client settings.
    pub nrpc: NrpcConfig,

    /// Byte-for-byte forwarding of protocols the server does not speak itself.
    pub forwards: Vec<ForwardConfig>,

    /// Logs and the Prometheus exporter.
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// `ip:port`, every protocol arrives here.
    pub bind_address: String,

    /// Enables TLS termination for clients whose first bytes are a TLS record.
    pub tls: Option<TlsConfig>,

    /// Connections beyond this wait in the kernel backlog.
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            max_connections: 10_000,
        }
    }
}

/// PEM certificate chain and private key.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert_path: String,

    pub key_path: String,
}

/// Protocol sniffing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum bytes buffered while the protocol is still undetermined.
    pub max_sniff_bytes: usize,

    /// How long to wait for the first bytes before giving up, in milliseconds.
    pub first_packet_timeout_ms: u64,

    /// Protocol that receives connections whose client sends nothing
    /// (the server greets first), e.g. "mysql".
    pub server_first_protocol: Option<String>,

    /// Accept and strip a leading HAProxy PROXY protocol header.
    pub accept_proxy_protocol: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_sniff_bytes: 8 * 1024,
            first_packet_timeout_ms: 3_000,
            server_first_protocol: None,
            accept_proxy_protocol: false,
        }
    }
}

/// HTTP hand-off configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Serve HTTP/1.1 and HTTP/2 on the shared port.
    pub enabled: bool,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            request_timeout_secs: 30,
        }
    }
}

/// NRPC settings, split into the serving and the calling side.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NrpcConfig {
    pub server: NrpcServerConfig,
    pub client: NrpcClientConfig,
}

/// NRPC server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NrpcServerConfig {
    /// Accept NRPC connections on the shared port.
    pub enabled: bool,

    /// Maximum accepted frame body in bytes.
    pub message_max_length: usize,

    /// Four-byte magic prefix identifying NRPC frames.
    pub magic: String,

    /// Version given to services that do not declare one; requests with an
    /// empty version are served by it.
    pub default_version: String,

    /// Refuse to register a service whose methods clash on one RPC name.
    pub method_overwrite_check: bool,
}

impl Default for NrpcServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            message_max_length: 10 * 1024 * 1024,
            magic: "NRPC".to_string(),
            default_version: String::new(),
            method_overwrite_check: true,
        }
    }
}

/// NRPC client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NrpcClientConfig {
    /// Worker threads of each client's I/O runtime.
    pub io_threads: usize,

    /// Share of scheduler time given to I/O polling (1-100).
    pub io_ratio: u32,

    /// Connection establishment timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Idle interval after which a heartbeat ping is sent, in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Consecutive silent heartbeat windows before the connection is torn down.
    pub missed_heartbeats: u32,

    /// Delay between reconnect attempts in milliseconds.
    pub reconnect_interval_ms: u64,

    /// Reconnect after connection loss.
    pub reconnect_enabled: bool,

    /// Random jitter added to the reconnect delay (0.0 - 1.0 of the interval).
    pub reconnect_jitter: f64,

    /// Log every heartbeat exchange at debug level.
    pub heartbeat_log: bool,

    /// Maximum accepted frame body in bytes.
    pub message_max_length: usize,

    /// Default call timeout in milliseconds (-1 never, 0 defer to the server).
    pub default_timeout_ms: i64,

    /// Version used when an interface does not declare one.
    pub default_version: String,

    /// Reject interfaces where two methods resolve to the same RPC name.
    pub method_overwrite_check: bool,

    /// Four-byte magic prefix identifying NRPC frames.
    pub magic: String,

    /// Addresses offered to the load balancer.
    pub addresses: Vec<String>,
}

impl Default for NrpcClientConfig {
    fn default() -> Self {
        Self {
            io_threads: 1,
            io_ratio: 100,
            connect_timeout_ms: 1_000,
            heartbeat_interval_ms: 20_000,
            missed_heartbeats: 3,
            reconnect_interval_ms: 5_000,
            reconnect_enabled: true,
            reconnect_jitter: 0.0,
            heartbeat_log: false,
            message_max_length: 10 * 1024 * 1024,
            default_timeout_ms: 1_000,
            default_version: String::new(),
            method_overwrite_check: true,
            magic: "NRPC".to_string(),
            addresses: Vec::new(),
        }
    }
}

/// Forward one recognized protocol to a backend TCP address.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForwardConfig {
    /// Protocol name as reported by the recognizer (e.g. "mqtt", "mysql").
    pub protocol: String,

    /// Backend address (e.g., "127.0.0.1:3306").
    pub backend: String,

    /// Connect timeout towards the backend in milliseconds.
    #[serde(default = "default_forward_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_forward_connect_timeout() -> u64 {
    3_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub log_level: String,

    /// Emit logs as JSON lines instead of human-readable text.
    pub json_logs: bool,

    pub metrics_enabled: bool,

    /// Where the Prometheus scrape endpoint listens.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
