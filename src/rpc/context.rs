//! Per-call working state and its pool.
//!
//! # Call States
//! ```text
//! NEW → ADDRESS_CHOSEN → CLIENT_ACQUIRED → INSTANCE_RESOLVED → FILTERED → SENT
//!     → COMPLETED | TIMED_OUT | FAILED → RECYCLED
//! ```
//!
//! # Design Decisions
//! - A context is passed explicitly through the call; it is never shared
//!   between two calls at once
//! - The response is claimed with an atomic flag: the first reader performs
//!   the send, concurrent readers fail, later readers get the cached outcome
//! - Contexts come from a free list and are reset by a drop guard, so every
//!   exit path (success, error, timeout, cancellation) recycles them

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde_json::{Map, Value};

use crate::resilience::CallTimeout;
use crate::rpc::client::RpcClient;
use crate::rpc::error::RpcError;
use crate::rpc::instance::DispatchTable;
use crate::rpc::message::RpcRequest;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State of one RPC call.
#[derive(Debug, Default)]
pub struct RequestContext {
    active: bool,
    method: String,
    args: Vec<Value>,
    timeout_ms: Mutex<Option<i64>>,
    address: Option<SocketAddr>,
    client: Option<Arc<RpcClient>>,
    instance: Option<Arc<DispatchTable>>,
    attachments: Mutex<HashMap<String, String>>,
    claimed: AtomicBool,
    outcome: OnceLock<Result<Value, RpcError>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a call. Fails if the previous call was not recycled.
    pub fn begin(&mut self, method: &str, args: Vec<Value>, timeout_ms: Option<i64>) -> Result<(), RpcError> {
        if self.active {
            return Err(RpcError::ContextInUse);
        }
        self.active = true;
        self.method.push_str(method);
        self.args = args;
        *self.timeout_ms.get_mut().unwrap_or_else(PoisonError::into_inner) = timeout_ms;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    pub fn client(&self) -> Option<&Arc<RpcClient>> {
        self.client.as_ref()
    }

    pub fn instance(&self) -> Option<&Arc<DispatchTable>> {
        self.instance.as_ref()
    }

    pub(crate) fn set_address(&mut self, address: SocketAddr) {
        self.address = Some(address);
    }

    pub(crate) fn set_client(&mut self, client: Arc<RpcClient>) {
        self.client = Some(client);
    }

    pub(crate) fn set_instance(&mut self, instance: Arc<DispatchTable>) {
        self.instance = Some(instance);
    }

    /// Per-call timeout override; filters may change it before the send.
    pub fn timeout_ms(&self) -> Option<i64> {
        *lock(&self.timeout_ms)
    }

    pub fn set_timeout_ms(&self, timeout_ms: i64) {
        *lock(&self.timeout_ms) = Some(timeout_ms);
    }

    /// Attach a string sent with the request (trace ids, auth tokens).
    pub fn attach(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.attachments).insert(key.into(), value.into());
    }

    pub fn attachment(&self, key: &str) -> Option<String> {
        lock(&self.attachments).get(key).cloned()
    }

    /// The response was claimed, either by a send or by [`complete`](Self::complete).
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// A finished outcome exists.
    pub fn is_done(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// The call's result, sending the request on first use.
    ///
    /// Exactly one reader performs the send. A reader arriving while that
    /// send is in flight gets [`RpcError::ConcurrentConsumption`]; readers
    /// arriving afterwards get the cached value or error.
    pub async fn response(&self) -> Result<Value, RpcError> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let result = self.send().await;
            let _ = self.outcome.set(result.clone());
            return result;
        }
        match self.outcome.get() {
            Some(result) => result.clone(),
            None => Err(RpcError::ConcurrentConsumption),
        }
    }

    /// Settle the call without sending (e.g. a filter answering from a cache).
    ///
    /// Returns `false` if the response was already claimed.
    pub fn complete(&self, result: Result<Value, RpcError>) -> bool {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.outcome.set(result).is_ok()
    }

    async fn send(&self) -> Result<Value, RpcError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| RpcError::Connect("no client acquired for this call".into()))?;
        let instance = self
            .instance
            .as_ref()
            .ok_or_else(|| RpcError::NoSuchMethod(self.method.clone()))?;
        let descriptor = instance
            .method(&self.method)
            .ok_or_else(|| RpcError::NoSuchMethod(self.method.clone()))?;
        if descriptor.parameter_names.len() != self.args.len() {
            return Err(RpcError::Arguments {
                method: self.method.clone(),
                expected: descriptor.parameter_names.len(),
                found: self.args.len(),
            });
        }

        let timeout = CallTimeout::resolve(
            self.timeout_ms(),
            descriptor.timeout_ms,
            instance.interface_timeout_ms,
            client.default_timeout_ms(),
        );
        let args: Map<String, Value> = descriptor
            .parameter_names
            .iter()
            .cloned()
            .zip(self.args.iter().cloned())
            .collect();
        let request = RpcRequest {
            request_mapping_name: instance.key.request_mapping_name.clone(),
            version: instance.key.version.clone(),
            method_name: descriptor.method_name.clone(),
            args,
            timeout_ms: timeout.as_wire_millis(),
            attachments: lock(&self.attachments).clone(),
        };
        client.call(request, timeout, descriptor.return_kind).await
    }

    /// Reset every field so the next call starts from scratch.
    pub fn recycle(&mut self) {
        self.active = false;
        self.method.clear();
        self.args.clear();
        *self.timeout_ms.get_mut().unwrap_or_else(PoisonError::into_inner) = None;
        self.address = None;
        self.client = None;
        self.instance = None;
        self.attachments.get_mut().unwrap_or_else(PoisonError::into_inner).clear();
        self.claimed.store(false, Ordering::Release);
        self.outcome.take();
    }
}

/// Free list of contexts.
#[derive(Debug)]
pub struct ContextPool {
    free: Mutex<Vec<Box<RequestContext>>>,
    max_idle: usize,
}

impl ContextPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    pub fn acquire(&self) -> PooledContext<'_> {
        let ctx = lock(&self.free).pop().unwrap_or_default();
        PooledContext {
            ctx: Some(ctx),
            pool: self,
        }
    }

    pub fn idle(&self) -> usize {
        lock(&self.free).len()
    }

    fn release(&self, ctx: Box<RequestContext>) {
        let mut free = lock(&self.free);
        if free.len() < self.max_idle {
            free.push(ctx);
        }
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(64)
    }
}

/// A borrowed context; recycled and returned to the pool on drop.
#[derive(Debug)]
pub struct PooledContext<'a> {
    ctx: Option<Box<RequestContext>>,
    pool: &'a ContextPool,
}

impl Deref for PooledContext<'_> {
    type Target = RequestContext;

    fn deref(&self) -> &RequestContext {
        // Only `drop` takes the box out.
        self.ctx.as_deref().unwrap_or_else(|| unreachable!("context used after release"))
    }
}

impl DerefMut for PooledContext<'_> {
    fn deref_mut(&mut self) -> &mut RequestContext {
        self.ctx.as_deref_mut().unwrap_or_else(|| unreachable!("context used after release"))
    }
}

impl Drop for PooledContext<'_> {
    fn drop(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            ctx.recycle();
            self.pool.release(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    use crate::rpc::client::ClientSettings;
    use crate::rpc::codec::{PacketKind, RpcCodec, RpcPacket};
    use crate::rpc::instance::{DeclaredNames, InterfaceDescriptor, MethodSignature};
    use crate::rpc::message::RpcResponse;

    #[test]
    fn begin_refuses_an_active_context() {
        let mut ctx = RequestContext::new();
        ctx.begin("echo", vec![json!("hi")], None).unwrap();
        assert_eq!(ctx.begin("echo", vec![], None), Err(RpcError::ContextInUse));
        ctx.recycle();
        assert!(ctx.begin("echo", vec![], None).is_ok());
    }

    #[test]
    fn recycle_clears_every_field() {
        let mut ctx = RequestContext::new();
        ctx.begin("echo", vec![json!("hi")], Some(50)).unwrap();
        ctx.set_address("127.0.0.1:9000".parse().unwrap());
        ctx.attach("trace-id", "abc");
        assert!(ctx.complete(Ok(json!("cached"))));

        ctx.recycle();
        assert!(!ctx.is_active());
        assert_eq!(ctx.method(), "");
        assert!(ctx.args().is_empty());
        assert_eq!(ctx.timeout_ms(), None);
        assert_eq!(ctx.address(), None);
        assert!(ctx.client().is_none());
        assert!(ctx.instance().is_none());
        assert_eq!(ctx.attachment("trace-id"), None);
        assert!(!ctx.is_done());
    }

    #[tokio::test]
    async fn completed_outcome_is_cached_for_every_reader() {
        let mut ctx = RequestContext::new();
        ctx.begin("echo", vec![], None).unwrap();
        assert!(ctx.complete(Err(RpcError::Timeout(std::time::Duration::from_millis(50)))));
        assert!(!ctx.complete(Ok(json!(1))));

        for _ in 0..3 {
            assert!(matches!(ctx.response().await, Err(RpcError::Timeout(_))));
        }
    }

    /// Answers each request with its `message` argument after `delay`.
    async fn delayed_echo_server(delay: Duration) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, RpcCodec::default());
                    while let Some(Ok(packet)) = framed.next().await {
                        let reply = match packet.kind {
                            PacketKind::Ping => RpcPacket::pong(),
                            PacketKind::Request => {
                                seen.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(delay).await;
                                let req: RpcRequest = serde_json::from_slice(&packet.body).unwrap();
                                let data = req.args.get("message").cloned().unwrap_or(Value::Null);
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
        (addr, requests)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_reader_while_in_flight_is_refused() {
        let (addr, requests) = delayed_echo_server(Duration::from_millis(200)).await;
        let settings = ClientSettings {
            connect_timeout: Duration::from_secs(2),
            ..ClientSettings::default()
        };
        let client = RpcClient::connect(addr, settings, Vec::new()).unwrap();
        let interface = InterfaceDescriptor::new("Echo").method(MethodSignature::new("echo").param("message"));
        let instance = client.instance(&interface, &DeclaredNames).unwrap();

        let mut ctx = RequestContext::new();
        ctx.begin("echo", vec![json!("once")], Some(2_000)).unwrap();
        ctx.set_client(client);
        ctx.set_instance(instance);

        let first = ctx.response();
        let second = async {
            // Let the first reader claim the call and reach the server.
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.response().await
        };
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first, Ok(json!("once")));
        assert_eq!(second, Err(RpcError::ConcurrentConsumption));

        for _ in 0..2 {
            assert_eq!(ctx.response().await, Ok(json!("once")));
        }
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_without_client_is_a_connect_error() {
        let mut ctx = RequestContext::new();
        ctx.begin("echo", vec![], None).unwrap();
        assert!(matches!(ctx.response().await, Err(RpcError::Connect(_))));
    }

    #[test]
    fn pool_reuses_recycled_contexts() {
        let pool = ContextPool::new(4);
        {
            let mut ctx = pool.acquire();
            ctx.begin("a", vec![json!(1)], None).unwrap();
        }
        assert_eq!(pool.idle(), 1);

        let mut ctx = pool.acquire();
        assert_eq!(pool.idle(), 0);
        assert!(!ctx.is_active());
        assert!(ctx.args().is_empty());
        ctx.begin("b", vec![], None).unwrap();
    }
}
