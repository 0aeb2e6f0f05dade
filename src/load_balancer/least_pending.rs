//! Least-pending-calls address selection.

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::load_balancer::{CallMetadata, LoadBalancer};
use crate::rpc::error::BoxError;
use crate::rpc::registry::ClientRegistry;

/// Picks the address whose client has the fewest calls in flight.
/// Addresses without a client count as idle. Ties go to the earlier address.
pub struct LeastPending {
    addresses: ArcSwap<Vec<SocketAddr>>,
    registry: Arc<ClientRegistry>,
}

impl LeastPending {
    pub fn new(addresses: Vec<SocketAddr>, registry: Arc<ClientRegistry>) -> Self {
        Self {
            addresses: ArcSwap::from_pointee(addresses),
            registry,
        }
    }

    pub fn update(&self, addresses: Vec<SocketAddr>) {
        self.addresses.store(Arc::new(addresses));
    }
}

impl LoadBalancer for LeastPending {
    fn choose_address(&self, _call: &CallMetadata<'_>) -> Result<Option<SocketAddr>, BoxError> {
        Ok(self
            .addresses
            .load()
            .iter()
            .copied()
            .min_by_key(|addr| self.registry.in_flight(*addr)))
    }
}
