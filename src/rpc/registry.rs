//! Address → client map.
//!
//! Lookups are lock-free. Creation takes a registry-wide lock and re-checks,
//! so concurrent first calls to one address construct exactly one client.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use dashmap::DashMap;

use crate::rpc::client::{ClientObserver, ClientSettings, IoRuntime, RpcClient};
use crate::rpc::error::RpcError;

pub struct ClientRegistry {
    clients: DashMap<SocketAddr, Arc<RpcClient>>,
    create_lock: Mutex<()>,
    settings: ClientSettings,
    observers: Vec<Arc<dyn ClientObserver>>,
    constructed: AtomicUsize,
    caller_runtime: OnceLock<IoRuntime>,
}

impl ClientRegistry {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            clients: DashMap::new(),
            create_lock: Mutex::new(()),
            settings,
            observers: Vec::new(),
            constructed: AtomicUsize::new(0),
            caller_runtime: OnceLock::new(),
        }
    }

    /// Observers are notified in insertion order.
    pub fn with_observer(mut self, observer: Arc<dyn ClientObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn get_or_create(&self, address: SocketAddr) -> Result<Arc<RpcClient>, RpcError> {
        if let Some(client) = self.live(address) {
            return Ok(client);
        }

        let _guard = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = self.live(address) {
            return Ok(client);
        }

        let client = RpcClient::connect(address, self.settings.clone(), self.observers.clone())?;
        self.constructed.fetch_add(1, Ordering::Relaxed);
        if let Some(previous) = self.clients.insert(address, Arc::clone(&client)) {
            tracing::info!(address = %address, "Replacing closed RPC client");
            previous.shutdown();
        }
        Ok(client)
    }

    fn live(&self, address: SocketAddr) -> Option<Arc<RpcClient>> {
        self.clients
            .get(&address)
            .filter(|client| !client.is_closed())
            .map(|client| Arc::clone(client.value()))
    }

    pub fn get(&self, address: SocketAddr) -> Option<Arc<RpcClient>> {
        self.clients.get(&address).map(|c| Arc::clone(c.value()))
    }

    /// Number of clients ever constructed by this registry.
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// In-flight calls on the client for `address`; zero if none exists.
    pub fn in_flight(&self, address: SocketAddr) -> usize {
        self.clients.get(&address).map(|c| c.in_flight()).unwrap_or(0)
    }

    pub fn remove(&self, address: SocketAddr) -> Option<Arc<RpcClient>> {
        let (_, client) = self.clients.remove(&address)?;
        client.shutdown();
        Some(client)
    }

    pub fn shutdown_all(&self) {
        for entry in self.clients.iter() {
            entry.value().shutdown();
        }
        self.clients.clear();
        tracing::info!("All RPC clients shut down");
    }

    /// Drive `future` to completion from a plain thread.
    ///
    /// Calling this from inside a tokio runtime would block a worker, so it is
    /// refused with [`RpcError::BlockingInAsyncContext`].
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, RpcError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(RpcError::BlockingInAsyncContext);
        }
        let runtime = match self.caller_runtime.get() {
            Some(runtime) => runtime,
            None => {
                let runtime = IoRuntime::new("nrpc-caller", 1, 100)
                    .map_err(|e| RpcError::Connect(format!("failed to start caller runtime: {}", e)))?;
                // A concurrent initializer may win; its runtime is used instead.
                let _ = self.caller_runtime.set(runtime);
                self.caller_runtime
                    .get()
                    .ok_or_else(|| RpcError::Connect("caller runtime unavailable".into()))?
            }
        };
        runtime
            .block_on(future)
            .ok_or_else(|| RpcError::Connect("caller runtime unavailable".into()))
    }
}

impl Drop for ClientRegistry {
    fn drop(&mut self) {
        for entry in self.clients.iter() {
            entry.value().shutdown();
        }
    }
}
