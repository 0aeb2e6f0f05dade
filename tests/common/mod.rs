//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use polyport::config::ServerConfig;
use polyport::lifecycle::Shutdown;
use polyport::net::Listener;
use polyport::rpc::codec::PacketKind;
use polyport::rpc::{
    BoxError, DeclaredNames, InterfaceDescriptor, MethodSignature, RpcCodec, RpcPacket, RpcRequest, RpcResponse,
    RpcService, ServiceRegistry,
};
use polyport::PolyportServer;

/// A running server on an ephemeral port; shuts down on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub reloads: mpsc::UnboundedSender<ServerConfig>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Start a server with `config` and the [`EchoService`] registered.
pub async fn start_server(config: ServerConfig) -> TestServer {
    let mut services = ServiceRegistry::from_config(Arc::new(DeclaredNames), &config.nrpc.server);
    services.register(Arc::new(EchoService)).unwrap();

    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let listener = Listener::from_tcp(tcp, 64);

    let server = PolyportServer::new(&config, services).await.unwrap();
    let shutdown = Shutdown::new();
    let (reloads, reload_rx) = mpsc::unbounded_channel();
    tokio::spawn(server.run(listener, reload_rx, shutdown.clone()));

    TestServer {
        addr,
        shutdown,
        reloads,
    }
}

pub fn echo_interface() -> InterfaceDescriptor {
    InterfaceDescriptor::new("EchoService")
        .method(MethodSignature::new("echo").param("message"))
        // Never times out on either side unless a caller overrides it.
        .method(MethodSignature::new("slow").param("millis").timeout_ms(-1))
        .method(MethodSignature::new("fail"))
}

/// `echo(message)`, `slow(millis)` and an always-failing `fail()`.
pub struct EchoService;

impl RpcService for EchoService {
    fn interface(&self) -> InterfaceDescriptor {
        echo_interface()
    }

    fn call<'a>(&'a self, method: &'a str, args: Vec<Value>) -> BoxFuture<'a, Result<Value, BoxError>> {
        Box::pin(async move {
            match method {
                "echo" => Ok(args.into_iter().next().unwrap_or(Value::Null)),
                "slow" => {
                    let millis = args.first().and_then(Value::as_u64).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Ok(json!(millis))
                }
                _ => Err("service failure".into()),
            }
        })
    }
}

/// A bare NRPC server for client-side tests.
pub struct MockNrpc {
    pub addr: SocketAddr,
    /// Connections accepted so far.
    pub accepted: Arc<AtomicUsize>,
    /// Request frames received on any connection, answered or not.
    pub requests: Arc<AtomicUsize>,
}

/// Answers pings and echoes the `message` argument of every request.
///
/// With `swallow_first`, the first connection never answers anything.
pub async fn start_mock_nrpc_server(swallow_first: bool) -> MockNrpc {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));
    let (connections, seen) = (Arc::clone(&accepted), Arc::clone(&requests));

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let nth = connections.fetch_add(1, Ordering::SeqCst);
            let silent = swallow_first && nth == 0;
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, RpcCodec::default());
                while let Some(Ok(packet)) = framed.next().await {
                    if packet.kind == PacketKind::Request {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    if silent {
                        continue;
                    }
                    let reply = match packet.kind {
                        PacketKind::Ping => RpcPacket::pong(),
                        PacketKind::Request => {
                            let request: RpcRequest = serde_json::from_slice(&packet.body).unwrap();
                            let data = request.args.get("message").cloned().unwrap_or(Value::Null);
                            let body = serde_json::to_vec(&RpcResponse::ok(data)).unwrap();
                            RpcPacket::response(packet.request_id, body)
                        }
                        _ => continue,
                    };
                    if framed.send(reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    MockNrpc {
        addr,
        accepted,
        requests,
    }
}

/// A TCP backend that greets every connection with `greeting` and then
/// echoes whatever it receives.
pub async fn start_greeting_backend(greeting: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                if socket.write_all(greeting).await.is_err() {
                    return;
                }
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}
