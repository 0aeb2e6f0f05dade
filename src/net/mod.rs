//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (id + lifetime tracking)
//!     → protocol dispatcher (sniffing)
//!     → tls.rs (termination when the prefix is a TLS record)
//!     → rewind.rs (sniffed bytes replayed into the chosen handler)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is optional and detected from the first bytes, not the port

pub mod connection;
pub mod listener;
pub mod rewind;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError};
pub use rewind::Rewind;
