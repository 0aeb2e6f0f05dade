//! Polyport: one listening socket, many wire protocols.
//!
//! Each accepted connection is classified from its first bytes and handed to
//! the matching handler: HTTP/1.1 and HTTP/2 (cleartext or TLS) go to an axum
//! router, NRPC goes to the RPC server, and MQTT, MySQL or Dubbo can be
//! forwarded to a backend. The [`rpc`] module also carries the NRPC client
//! used for service-to-service calls.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod resilience;
pub mod rpc;
pub mod server;

pub use config::ServerConfig;
pub use lifecycle::Shutdown;
pub use server::{PolyportServer, ServerError};
