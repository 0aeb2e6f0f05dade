//! Round-robin address selection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::load_balancer::{CallMetadata, LoadBalancer};
use crate::rpc::error::BoxError;

/// Rotates through an address list that can be replaced at runtime.
#[derive(Debug)]
pub struct RoundRobin {
    addresses: ArcSwap<Vec<SocketAddr>>,
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self {
            addresses: ArcSwap::from_pointee(addresses),
            counter: AtomicUsize::new(0),
        }
    }

    /// Swap in a new address list; in-progress selections keep the old one.
    pub fn update(&self, addresses: Vec<SocketAddr>) {
        tracing::info!(count = addresses.len(), "RPC address list updated");
        self.addresses.store(Arc::new(addresses));
    }

    pub fn addresses(&self) -> Arc<Vec<SocketAddr>> {
        self.addresses.load_full()
    }
}

impl LoadBalancer for RoundRobin {
    fn choose_address(&self, _call: &CallMetadata<'_>) -> Result<Option<SocketAddr>, BoxError> {
        let addresses = self.addresses.load();
        if addresses.is_empty() {
            return Ok(None);
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % addresses.len();
        Ok(Some(addresses[index]))
    }
}
