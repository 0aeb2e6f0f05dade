//! NRPC: the binary RPC protocol served on the shared port, and its client.
//!
//! # Data Flow
//! ```text
//! Client:
//!     RpcClientProxy::invoke(method, args)
//!         → context.rs (pooled call state)
//!         → load_balancer (choose address)
//!         → registry.rs (one RpcClient per address)
//!         → instance.rs (cached dispatch table)
//!         → filter.rs (ordered filter chain)
//!         → client.rs (correlate, frame, send; await response or timeout)
//!
//! Server:
//!     ProtocolDispatcher (NRPC recognized)
//!         → server.rs (decode, route by mapping name/version/method)
//!         → RpcService::call → response frame
//! ```
//!
//! # Design Decisions
//! - Frames carry JSON bodies; arguments travel keyed by parameter name
//! - Requests on one connection are correlated by id and may complete out of order
//! - Heartbeats are uncorrelated ping/pong frames

pub mod builtin;
pub mod client;
pub mod codec;
pub mod context;
pub mod correlation;
pub mod error;
pub mod filter;
pub mod instance;
pub mod message;
pub mod proxy;
pub mod registry;
pub mod server;

pub use builtin::{ping_interface, PingService};
pub use client::{ClientObserver, ClientSettings, RpcClient};
pub use codec::{RpcCodec, RpcPacket};
pub use context::{ContextPool, RequestContext};
pub use error::{BoxError, InstanceError, RpcError};
pub use filter::{FilterChain, LoggingFilter, RpcFilter, TraceIdFilter};
pub use instance::{
    DeclaredNames, DescriptorFileNames, DispatchTable, InterfaceDescriptor, MethodSignature, ParameterNameResolver,
    ReturnKind, RpcInstanceKey,
};
pub use message::{RpcRequest, RpcResponse, RpcStatus};
pub use proxy::RpcClientProxy;
pub use registry::ClientRegistry;
pub use server::{RpcServerHandler, RpcService, ServiceRegistry};
