//! HTTP protocol hand-off.
//!
//! # Data Flow
//! ```text
//! dispatcher (http1_1 / https1_1 / h2 / h2c_prior_knowledge)
//!     → server.rs (hyper-util auto builder, h1 or h2 per connection)
//!     → axum Router (/health, status document)
//! ```

pub mod server;

pub use server::HttpHandler;
