//! NRPC server: the protocol handler for recognized NRPC connections.
//!
//! # Responsibilities
//! - Decode request frames and route them to registered services by
//!   `(request_mapping_name, version)` and method name
//! - Execute requests concurrently; responses go out as they finish, so a
//!   later request may be answered first
//! - Answer heartbeat pings
//! - Apply the server-side method timeout policy
//!
//! # Status codes
//! 400 malformed request, 404 unknown service, 405 unknown method,
//! 500 service failure, 504 method deadline exceeded.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::config::NrpcServerConfig;
use crate::protocol::descriptor::ProtocolDescriptor;
use crate::protocol::handler::{BoxedIo, ConnectionInfo, ProtocolError, ProtocolHandler};
use crate::resilience::server_deadline;
use crate::rpc::builtin::PingService;
use crate::rpc::codec::{self, PacketKind, RpcCodec, RpcPacket};
use crate::rpc::error::{BoxError, InstanceError};
use crate::rpc::instance::{DeclaredNames, DispatchTable, ParameterNameResolver};
use crate::rpc::message::{RpcRequest, RpcResponse, RpcStatus};

/// An application service exposed over NRPC.
pub trait RpcService: Send + Sync {
    fn interface(&self) -> crate::rpc::instance::InterfaceDescriptor;

    /// `method` is the declared method name; `args` are positional.
    fn call<'a>(&'a self, method: &'a str, args: Vec<Value>) -> BoxFuture<'a, Result<Value, BoxError>>;
}

struct Registered {
    table: Arc<DispatchTable>,
    service: Arc<dyn RpcService>,
}

/// Services keyed by `(request_mapping_name, version)`.
pub struct ServiceRegistry {
    services: HashMap<(String, String), Registered>,
    resolver: Arc<dyn ParameterNameResolver>,
    default_version: String,
    overwrite_check: bool,
}

impl ServiceRegistry {
    /// Starts with the built-in `_ping` service registered.
    pub fn new(resolver: Arc<dyn ParameterNameResolver>, default_version: &str, overwrite_check: bool) -> Self {
        let mut registry = Self {
            services: HashMap::new(),
            resolver,
            default_version: default_version.to_string(),
            overwrite_check,
        };
        let ping: Arc<dyn RpcService> = Arc::new(PingService);
        // Declared names only: descriptor files do not cover built-ins.
        if let Err(e) = registry.insert(ping, &DeclaredNames) {
            tracing::error!(error = %e, "Failed to register the built-in ping service");
        }
        registry
    }

    /// Registry using the server section's version and overwrite settings.
    pub fn from_config(resolver: Arc<dyn ParameterNameResolver>, config: &NrpcServerConfig) -> Self {
        Self::new(resolver, &config.default_version, config.method_overwrite_check)
    }

    pub fn register(&mut self, service: Arc<dyn RpcService>) -> Result<(), InstanceError> {
        let resolver = Arc::clone(&self.resolver);
        self.insert(service, resolver.as_ref())
    }

    fn insert(&mut self, service: Arc<dyn RpcService>, resolver: &dyn ParameterNameResolver) -> Result<(), InstanceError> {
        let interface = service.interface();
        let table = DispatchTable::build(&interface, &self.default_version, resolver, self.overwrite_check)?;
        let id = (table.key.request_mapping_name.clone(), table.key.version.clone());
        if self.services.contains_key(&id) {
            return Err(InstanceError::DuplicateService {
                request_mapping_name: id.0,
                version: id.1,
            });
        }
        tracing::info!(service = %table.key, methods = table.len(), "RPC service registered");
        self.services.insert(
            id,
            Registered {
                table: Arc::new(table),
                service,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// An empty request version means the server's default version.
    fn lookup(&self, mapping: &str, version: &str) -> Option<&Registered> {
        let version = if version.is_empty() { &self.default_version } else { version };
        self.services.get(&(mapping.to_string(), version.to_string()))
    }

    /// Run one request to completion, mapping every failure to a status.
    pub async fn execute(&self, request: RpcRequest) -> RpcResponse {
        let Some(registered) = self.lookup(&request.request_mapping_name, &request.version) else {
            return RpcResponse::error(
                RpcStatus::NoSuchService,
                format!("no service '{}' version '{}'", request.request_mapping_name, request.version),
            );
        };
        let Some(method) = registered.table.method(&request.method_name) else {
            return RpcResponse::error(
                RpcStatus::NoSuchMethod,
                format!("{} has no method '{}'", registered.table.key, request.method_name),
            );
        };

        // Missing arguments are passed as null.
        let mut named = request.args;
        let args: Vec<Value> = method
            .parameter_names
            .iter()
            .map(|name| named.remove(name).unwrap_or(Value::Null))
            .collect();

        let deadline = server_deadline(
            method.timeout_ms.or(registered.table.interface_timeout_ms),
            request.timeout_ms,
        );
        let call = registered.service.call(&method.name, args);
        let result = match deadline {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    return RpcResponse::error(
                        RpcStatus::Timeout,
                        format!("{} exceeded its deadline of {:?}", method.method_name, limit),
                    )
                }
            },
            None => call.await,
        };

        match result {
            Ok(data) => RpcResponse::ok(data),
            Err(e) => RpcResponse::error(RpcStatus::ServerError, e.to_string()),
        }
    }
}

/// Serves NRPC connections handed off by the dispatcher.
#[derive(Clone)]
pub struct RpcServerHandler {
    services: Arc<ServiceRegistry>,
    magic: [u8; 4],
    message_max_length: usize,
}

impl RpcServerHandler {
    pub fn new(services: ServiceRegistry, config: &NrpcServerConfig) -> Self {
        Self {
            services: Arc::new(services),
            magic: codec::parse_magic(&config.magic).unwrap_or(codec::DEFAULT_MAGIC),
            message_max_length: config.message_max_length,
        }
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    async fn serve(self, io: BoxedIo, conn: ConnectionInfo) -> Result<(), ProtocolError> {
        let framed = Framed::new(io, RpcCodec::new(self.magic, self.message_max_length));
        let (mut sink, mut frames) = framed.split();
        let (responses, mut finished) = mpsc::channel::<RpcPacket>(256);

        tracing::debug!(connection_id = %conn.id, client = %conn.client_addr(), "NRPC session started");

        loop {
            tokio::select! {
                frame = frames.next() => {
                    let packet = match frame {
                        Some(Ok(packet)) => packet,
                        Some(Err(e)) => return Err(ProtocolError::handler(conn.protocol, e)),
                        None => break,
                    };
                    match packet.kind {
                        PacketKind::Ping => {
                            sink.send(RpcPacket::pong())
                                .await
                                .map_err(|e| ProtocolError::handler(conn.protocol, e))?;
                        }
                        PacketKind::Pong => {}
                        PacketKind::Request => {
                            let services = Arc::clone(&self.services);
                            let responses = responses.clone();
                            tokio::spawn(async move {
                                if let Some(reply) = handle_request(&services, packet).await {
                                    let _ = responses.send(reply).await;
                                }
                            });
                        }
                        PacketKind::Response => {
                            tracing::warn!(connection_id = %conn.id, "Unexpected response frame from client");
                        }
                    }
                }
                Some(reply) = finished.recv() => {
                    sink.send(reply)
                        .await
                        .map_err(|e| ProtocolError::handler(conn.protocol, e))?;
                }
            }
        }

        tracing::debug!(connection_id = %conn.id, "NRPC session closed");
        Ok(())
    }
}

async fn handle_request(services: &ServiceRegistry, packet: RpcPacket) -> Option<RpcPacket> {
    let request_id = packet.request_id;
    let respond = packet.expects_response();
    let response = match serde_json::from_slice::<RpcRequest>(&packet.body) {
        Ok(request) => {
            tracing::debug!(
                request_id,
                service = %request.request_mapping_name,
                method = %request.method_name,
                "NRPC request"
            );
            services.execute(request).await
        }
        Err(e) => RpcResponse::error(RpcStatus::BadRequest, format!("malformed request: {}", e)),
    };
    if response.status != RpcStatus::Ok {
        tracing::debug!(
            request_id,
            status = %response.status,
            message = response.message.as_deref().unwrap_or(""),
            "NRPC request failed"
        );
    }
    if !respond {
        return None;
    }
    match serde_json::to_vec(&response) {
        Ok(body) => Some(RpcPacket::response(request_id, body)),
        Err(e) => {
            tracing::error!(request_id, error = %e, "Failed to encode NRPC response");
            None
        }
    }
}

impl ProtocolHandler for RpcServerHandler {
    fn name(&self) -> &'static str {
        "nrpc"
    }

    fn supports(&self, protocol: &ProtocolDescriptor) -> bool {
        *protocol == ProtocolDescriptor::NRPC
    }

    fn handle(&self, io: BoxedIo, conn: ConnectionInfo) -> BoxFuture<'static, Result<(), ProtocolError>> {
        Box::pin(self.clone().serve(io, conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::instance::{InterfaceDescriptor, MethodSignature};
    use serde_json::json;
    use std::time::Duration;

    struct Math;

    impl RpcService for Math {
        fn interface(&self) -> InterfaceDescriptor {
            InterfaceDescriptor::new("Math")
                .version("1.0")
                .method(MethodSignature::new("sub").param("a").param("b"))
                .method(MethodSignature::new("slow").timeout_ms(20))
                .method(MethodSignature::new("fail"))
        }

        fn call<'a>(&'a self, method: &'a str, args: Vec<Value>) -> BoxFuture<'a, Result<Value, BoxError>> {
            Box::pin(async move {
                match method {
                    "sub" => {
                        let a = args[0].as_i64().unwrap_or(0);
                        let b = args[1].as_i64().unwrap_or(0);
                        Ok(json!(a - b))
                    }
                    "slow" => {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Ok(Value::Null)
                    }
                    _ => Err("boom".into()),
                }
            })
        }
    }

    #[tokio::test]
    async fn server_section_sets_the_default_version() {
        let config = NrpcServerConfig {
            default_version: "1.0".into(),
            ..NrpcServerConfig::default()
        };
        let mut services = ServiceRegistry::from_config(Arc::new(DeclaredNames), &config);
        services.register(Arc::new(Unversioned)).unwrap();

        let mut req = request("unversioned", "sub", json!({"a": 5, "b": 2}));
        req.version = String::new();
        let resp = services.execute(req).await;
        assert_eq!(resp.status, RpcStatus::Ok);
        assert_eq!(resp.data, json!(3));
    }

    /// `Math` without a declared version.
    struct Unversioned;

    impl RpcService for Unversioned {
        fn interface(&self) -> InterfaceDescriptor {
            InterfaceDescriptor::new("Unversioned").method(MethodSignature::new("sub").param("a").param("b"))
        }

        fn call<'a>(&'a self, method: &'a str, args: Vec<Value>) -> BoxFuture<'a, Result<Value, BoxError>> {
            Box::pin(async move { Math.call(method, args).await })
        }
    }

    fn registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new(Arc::new(DeclaredNames), "1.0", true);
        registry.register(Arc::new(Math)).unwrap();
        registry
    }

    fn request(mapping: &str, method: &str, args: Value) -> RpcRequest {
        RpcRequest {
            request_mapping_name: mapping.into(),
            version: "1.0".into(),
            method_name: method.into(),
            args: args.as_object().cloned().unwrap_or_default(),
            timeout_ms: 0,
            attachments: Default::default(),
        }
    }

    #[tokio::test]
    async fn arguments_are_matched_by_name() {
        let response = registry().execute(request("math", "sub", json!({"b": 2, "a": 5}))).await;
        assert_eq!(response, RpcResponse::ok(json!(3)));
    }

    #[tokio::test]
    async fn status_codes() {
        let registry = registry();
        assert_eq!(
            registry.execute(request("nope", "sub", json!({}))).await.status,
            RpcStatus::NoSuchService
        );
        assert_eq!(
            registry.execute(request("math", "nope", json!({}))).await.status,
            RpcStatus::NoSuchMethod
        );
        assert_eq!(
            registry.execute(request("math", "fail", json!({}))).await.status,
            RpcStatus::ServerError
        );
        assert_eq!(
            registry.execute(request("math", "slow", json!({}))).await.status,
            RpcStatus::Timeout
        );
    }

    #[tokio::test]
    async fn builtin_ping_is_registered() {
        let registry = registry();
        assert_eq!(registry.len(), 2);
        let mut req = request("_ping", "echo", json!({"message": "hi"}));
        req.version = String::new();
        assert_eq!(registry.execute(req).await, RpcResponse::ok(json!("hi")));
    }

    #[test]
    fn duplicate_service_is_rejected() {
        let mut registry = registry();
        let err = registry.register(Arc::new(Math)).unwrap_err();
        assert!(matches!(err, InstanceError::DuplicateService { .. }));
    }
}
