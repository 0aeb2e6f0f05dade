//! Polyport server binary.
//!
//! ```text
//!     Client bytes
//!     ─────────────▶ net::Listener ─▶ ProtocolDispatcher ─┬─▶ http (axum)
//!                    (permits)        (sniff, TLS, PROXY) ├─▶ rpc::RpcServerHandler
//!                                                         └─▶ ForwardHandler (mqtt/mysql/dubbo)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;

use polyport::config::loader::load_or_default;
use polyport::config::watcher::ConfigWatcher;
use polyport::lifecycle::{shutdown_on_signal, Shutdown};
use polyport::net::Listener;
use polyport::observability::{logging, metrics};
use polyport::rpc::{DeclaredNames, ServiceRegistry};
use polyport::PolyportServer;

#[derive(Parser)]
#[command(name = "polyport", version, about = "Multi-protocol server on a single port")]
struct Args {
    /// TOML configuration file; defaults apply when omitted.
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_or_default(args.config.as_deref())?;

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "polyport starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;

    let services = ServiceRegistry::from_config(Arc::new(DeclaredNames), &config.nrpc.server);
    let server = PolyportServer::new(&config, services).await?;

    // Keep the watcher alive for the lifetime of the server.
    let (_watcher, reloads) = match &args.config {
        Some(path) => {
            match ConfigWatcher::start(path) {
                Ok((watcher, reloads)) => (Some(watcher), reloads),
                Err(e) => {
                    tracing::warn!(error = %e, "Config hot reload disabled");
                    (None, mpsc::unbounded_channel().1)
                }
            }
        }
        None => (None, mpsc::unbounded_channel().1),
    };

    let shutdown = Shutdown::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    server.run(listener, reloads, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
