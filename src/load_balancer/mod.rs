//! Address selection for RPC calls.
//!
//! # Data Flow
//! ```text
//! RpcClientProxy::invoke
//!     → LoadBalancer::choose_address(call metadata)
//!         - round_robin.rs (rotate through a hot-swappable address list)
//!         - least_pending.rs (fewest in-flight calls per registry client)
//!     → Some(address) → ClientRegistry::get_or_create
//!     → None / Err    → connect error, no network I/O
//! ```
//!
//! # Design Decisions
//! - Balancers see call metadata (interface, method, arguments) so
//!   application balancers can shard by key
//! - Address lists are swapped atomically, never locked on the call path

use std::net::SocketAddr;

use serde_json::Value;

use crate::rpc::error::BoxError;

pub mod least_pending;
pub mod round_robin;

pub use least_pending::LeastPending;
pub use round_robin::RoundRobin;

/// What a balancer may inspect about the call it is routing.
#[derive(Debug, Clone, Copy)]
pub struct CallMetadata<'a> {
    pub interface: &'a str,
    pub request_mapping_name: &'a str,
    pub method: &'a str,
    pub args: &'a [Value],
}

pub trait LoadBalancer: Send + Sync {
    /// `Ok(None)` means no address is available.
    fn choose_address(&self, call: &CallMetadata<'_>) -> Result<Option<SocketAddr>, BoxError>;
}

/// Always the same address.
#[derive(Debug, Clone, Copy)]
pub struct FixedAddress(pub SocketAddr);

impl LoadBalancer for FixedAddress {
    fn choose_address(&self, _call: &CallMetadata<'_>) -> Result<Option<SocketAddr>, BoxError> {
        Ok(Some(self.0))
    }
}

/// Parse configured `host:port` strings, skipping and logging invalid entries.
pub fn parse_addresses(addresses: &[String]) -> Vec<SocketAddr> {
    addresses
        .iter()
        .filter_map(|raw| match raw.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                tracing::warn!(address = %raw, error = %e, "Ignoring invalid RPC address");
                None
            }
        })
        .collect()
}
