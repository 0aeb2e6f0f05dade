//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → shared with the dispatcher, HTTP hand-off and NRPC engine
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → server swaps its dispatch settings atomically
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Only dispatch settings are hot-swappable; listener and NRPC changes need a restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::{
    DispatchConfig, ForwardConfig, HttpConfig, ListenerConfig, NrpcClientConfig, NrpcConfig,
    NrpcServerConfig, ObservabilityConfig, ServerConfig, TlsConfig,
};
