//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! RPC call:
//!     → timeouts.rs (resolve the call's deadline policy)
//! Connection lost:
//!     → backoff.rs (fixed reconnect interval, optional jitter)
//! ```
//!
//! # Design Decisions
//! - Every call has a resolved deadline policy before it is sent
//! - Timed-out calls do not close the connection
//! - Reconnects are never retried concurrently for the same client

pub mod backoff;
pub mod timeouts;

pub use backoff::reconnect_delay;
pub use timeouts::{server_deadline, CallTimeout};
