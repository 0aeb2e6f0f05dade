//! HTTP hand-off handler.
//!
//! # Responsibilities
//! - Serve HTTP/1.1 and HTTP/2 connections the dispatcher recognized
//! - Wire up middleware (tracing, timeout, request ID)
//! - Expose `/health` and a per-connection status document
//!
//! Routing beyond these two endpoints is left to embedders, who can supply
//! their own router through [`HttpHandler::with_router`].

use std::time::Duration;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use futures_util::future::BoxFuture;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::HttpConfig;
use crate::protocol::descriptor::ProtocolDescriptor;
use crate::protocol::handler::{BoxedIo, ConnectionInfo, ProtocolError, ProtocolHandler};

/// Serves recognized HTTP connections with an axum router.
#[derive(Clone)]
pub struct HttpHandler {
    router: Router,
}

impl HttpHandler {
    pub fn new(config: &HttpConfig) -> Self {
        Self::with_router(default_routes(), config)
    }

    /// Serve a caller-supplied router behind the standard middleware.
    pub fn with_router(routes: Router, config: &HttpConfig) -> Self {
        Self {
            router: Self::build_router(routes, config),
        }
    }

    #[allow(deprecated)]
    fn build_router(routes: Router, config: &HttpConfig) -> Router {
        // Outermost first: the trace span sees the generated request id.
        routes.layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs))),
        )
    }
}

impl ProtocolHandler for HttpHandler {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports(&self, protocol: &ProtocolDescriptor) -> bool {
        protocol.is_http()
    }

    fn handle(&self, io: BoxedIo, conn: ConnectionInfo) -> BoxFuture<'static, Result<(), ProtocolError>> {
        let protocol = conn.protocol;
        let service = TowerToHyperService::new(self.router.clone().layer(Extension(conn)));
        Box::pin(async move {
            // The auto builder reads the HTTP/2 preface itself, so h2c prior
            // knowledge and h2 over TLS share this path with HTTP/1.1.
            auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(io), service)
                .await
                .map_err(|e| ProtocolError::handler(protocol, e))
        })
    }
}

fn default_routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/", get(status))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Serialize)]
struct StatusDocument {
    name: &'static str,
    version: &'static str,
    connection_id: u64,
    protocol: &'static str,
    secure: bool,
    client_addr: String,
}

async fn status(Extension(conn): Extension<ConnectionInfo>) -> Json<StatusDocument> {
    Json(StatusDocument {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        connection_id: conn.id.as_u64(),
        protocol: conn.protocol.name,
        secure: conn.secure,
        client_addr: conn.client_addr().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{ConnectionId, Rewind};
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn conn(protocol: ProtocolDescriptor) -> ConnectionInfo {
        ConnectionInfo {
            id: ConnectionId::new(),
            peer_addr: "127.0.0.1:5555".parse().unwrap(),
            proxied_addr: None,
            protocol,
            secure: false,
        }
    }

    #[test]
    fn supports_every_http_variant() {
        let handler = HttpHandler::new(&HttpConfig::default());
        for p in [
            ProtocolDescriptor::HTTP1_1,
            ProtocolDescriptor::HTTPS1_1,
            ProtocolDescriptor::H2,
            ProtocolDescriptor::H2C_PRIOR_KNOWLEDGE,
        ] {
            assert!(handler.supports(&p), "{}", p);
        }
        assert!(!handler.supports(&ProtocolDescriptor::NRPC));
    }

    #[tokio::test]
    async fn serves_health_over_replayed_stream() {
        let handler = HttpHandler::new(&HttpConfig::default());
        let (mut client, server) = tokio::io::duplex(4096);

        // The dispatcher already consumed "GET "; the replay puts it back.
        let io = Rewind::new(Bytes::from_static(b"GET "), server);
        let task = tokio::spawn(handler.handle(Box::new(io), conn(ProtocolDescriptor::HTTP1_1)));

        client
            .write_all(b"/health HTTP/1.1\r\nHost: local\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
        assert!(response.to_ascii_lowercase().contains("x-request-id"));
        assert!(response.ends_with("ok"));
        task.await.unwrap().unwrap();
    }
}
