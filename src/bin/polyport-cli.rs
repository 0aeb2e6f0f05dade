use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;

use polyport::config::loader::load_config;
use polyport::config::NrpcClientConfig;
use polyport::load_balancer::FixedAddress;
use polyport::protocol::recognizer::{RecognizerOptions, RecognizerSet};
use polyport::protocol::{SniffState, Sniffer};
use polyport::rpc::{
    ping_interface, ClientRegistry, ClientSettings, InterfaceDescriptor, LoggingFilter, MethodSignature,
    RpcClientProxy,
};

#[derive(Parser)]
#[command(name = "polyport-cli")]
#[command(about = "Inspect and exercise a polyport deployment", long_about = None)]
struct Cli {
    /// Server configuration to take NRPC client settings from.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a captured connection prefix
    Classify {
        /// Prefix as hex, e.g. 4e525043
        #[arg(long, conflicts_with = "file")]
        hex: Option<String>,
        /// File holding the raw prefix
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Check that an NRPC server answers the built-in ping service
    Ping { address: SocketAddr },
    /// Call a method on an NRPC server
    Call {
        address: SocketAddr,
        /// Request mapping name of the service
        service: String,
        method: String,
        /// Arguments as name=value; values are parsed as JSON, else taken as strings
        #[arg(short, long = "arg")]
        args: Vec<String>,
        #[arg(long)]
        version: Option<String>,
        /// Timeout in milliseconds (-1 never, 0 let the server decide)
        #[arg(long)]
        timeout: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client_config = match &cli.config {
        Some(path) => load_config(path)?.nrpc.client,
        None => NrpcClientConfig::default(),
    };

    match cli.command {
        Commands::Classify { hex, file } => {
            let prefix = match (hex, file) {
                (Some(hex), _) => decode_hex(&hex)?,
                (None, Some(path)) => std::fs::read(path)?,
                (None, None) => return Err("one of --hex or --file is required".into()),
            };
            println!("{}", classify(&prefix));
        }
        Commands::Ping { address } => {
            let proxy = proxy(ping_interface(), address, &client_config);
            let reply = proxy.invoke("ping", Vec::new()).await?;
            println!("{}", reply);
        }
        Commands::Call {
            address,
            service,
            method,
            args,
            version,
            timeout,
        } => {
            let mut signature = MethodSignature::new(&method);
            let mut values = Vec::with_capacity(args.len());
            for raw in &args {
                let (name, value) = raw
                    .split_once('=')
                    .ok_or_else(|| format!("argument '{}' is not name=value", raw))?;
                signature = signature.param(name);
                values.push(serde_json::from_str(value).unwrap_or_else(|_| Value::from(value)));
            }
            let mut interface = InterfaceDescriptor::new(&service)
                .request_mapping_name(&service)
                .method(signature);
            if let Some(version) = version {
                interface = interface.version(version);
            }

            let proxy = proxy(interface, address, &client_config);
            let reply = match timeout {
                Some(ms) => proxy.invoke_with_timeout(&method, values, ms).await?,
                None => proxy.invoke(&method, values).await?,
            };
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
    }

    Ok(())
}

fn proxy(interface: InterfaceDescriptor, address: SocketAddr, config: &NrpcClientConfig) -> RpcClientProxy {
    let mut config = config.clone();
    // One call, then exit.
    config.reconnect_enabled = false;
    let registry = Arc::new(ClientRegistry::new(ClientSettings::from_config(&config)));
    RpcClientProxy::new(interface, registry, Arc::new(FixedAddress(address))).with_filter(Arc::new(LoggingFilter))
}

fn classify(prefix: &[u8]) -> String {
    let recognizers = RecognizerSet::standard(&RecognizerOptions {
        accept_proxy_protocol: true,
        ..RecognizerOptions::default()
    });
    let mut sniffer = Sniffer::new(&recognizers);
    match sniffer.feed(prefix) {
        SniffState::Matched(protocol) => match sniffer.proxy_source() {
            Some(source) => format!("{} (via PROXY header from {})", protocol, source),
            None => protocol.to_string(),
        },
        SniffState::Accumulating => format!("undecided after {} bytes; more input needed", prefix.len()),
        SniffState::Rejected(reason) => format!("rejected: {}", reason),
    }
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let hex: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    if !hex.is_ascii() || hex.len() % 2 != 0 {
        return Err("hex input must be an even number of hex digits".into());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(Into::into))
        .collect()
}
