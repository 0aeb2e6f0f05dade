//! Client-side entry point: turns a method call into an NRPC request.

use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::load_balancer::{CallMetadata, LoadBalancer};
use crate::observability::metrics;
use crate::rpc::context::{ContextPool, RequestContext};
use crate::rpc::error::RpcError;
use crate::rpc::filter::{sort_filters, FilterChain, RpcFilter};
use crate::rpc::instance::{DeclaredNames, InterfaceDescriptor, ParameterNameResolver};
use crate::rpc::registry::ClientRegistry;

/// Calls the methods of one remote interface.
///
/// Each call picks an address from the balancer, reuses the registry's
/// client for it, runs the filter chain and sends the request. Call state
/// lives in a pooled [`RequestContext`] that is recycled on every exit path.
pub struct RpcClientProxy {
    interface: InterfaceDescriptor,
    mapping_name: String,
    registry: Arc<ClientRegistry>,
    balancer: Arc<dyn LoadBalancer>,
    filters: Vec<Arc<dyn RpcFilter>>,
    resolver: Arc<dyn ParameterNameResolver>,
    pool: ContextPool,
}

impl RpcClientProxy {
    pub fn new(interface: InterfaceDescriptor, registry: Arc<ClientRegistry>, balancer: Arc<dyn LoadBalancer>) -> Self {
        let mapping_name = interface.mapping_name();
        Self {
            interface,
            mapping_name,
            registry,
            balancer,
            filters: Vec::new(),
            resolver: Arc::new(DeclaredNames),
            pool: ContextPool::default(),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn RpcFilter>) -> Self {
        self.filters.push(filter);
        sort_filters(&mut self.filters);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ParameterNameResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn interface(&self) -> &InterfaceDescriptor {
        &self.interface
    }

    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.invoke_inner(method, args, None).await
    }

    /// Invoke with a per-call timeout (`-1` never, `0` remote, else milliseconds).
    pub async fn invoke_with_timeout(&self, method: &str, args: Vec<Value>, timeout_ms: i64) -> Result<Value, RpcError> {
        self.invoke_inner(method, args, Some(timeout_ms)).await
    }

    /// Invoke and deserialize the result.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T, RpcError> {
        let value = self.invoke(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Blocking facade for plain threads; refused inside a tokio runtime.
    pub fn invoke_blocking(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.registry.block_on(self.invoke(method, args))?
    }

    async fn invoke_inner(&self, method: &str, args: Vec<Value>, timeout_ms: Option<i64>) -> Result<Value, RpcError> {
        let start = Instant::now();
        let result = self.execute(method, args, timeout_ms).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::record_rpc_call(method, outcome, start);
        result
    }

    async fn execute(&self, method: &str, args: Vec<Value>, timeout_ms: Option<i64>) -> Result<Value, RpcError> {
        let mut ctx = self.pool.acquire();
        ctx.begin(method, args, timeout_ms)?;

        let call = CallMetadata {
            interface: &self.interface.name,
            request_mapping_name: &self.mapping_name,
            method,
            args: ctx.args(),
        };
        let address = match self.balancer.choose_address(&call) {
            Ok(Some(address)) => address,
            Ok(None) => {
                return Err(RpcError::Connect(format!("no address available for {}", self.interface.name)));
            }
            Err(e) => return Err(RpcError::Connect(format!("load balancer failed: {}", e))),
        };
        ctx.set_address(address);

        let client = self.registry.get_or_create(address)?;
        let instance = client.instance(&self.interface, self.resolver.as_ref())?;
        if instance.method(method).is_none() {
            return Err(RpcError::NoSuchMethod(method.to_string()));
        }
        ctx.set_client(client);
        ctx.set_instance(instance);

        let ctx: &RequestContext = &ctx;
        FilterChain::new(&self.filters).do_filter(ctx).await?;
        if !ctx.is_claimed() {
            return Err(RpcError::Stopped(method.to_string()));
        }
        ctx.response().await
    }
}
