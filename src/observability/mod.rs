//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms via the metrics facade)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! Per-call correlation ids are attached by the RPC trace-id filter, not here.

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::init_metrics;
