//! Patrec server binary.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 0.0.0.0:3000, 100 connections
//! patrec-server
//!
//! # Custom address and capacity
//! patrec-server --bind 127.0.0.1:8080 --max-connections 500
//!
//! # Same through the environment
//! PORT=8080 MAX_CONNECTED_CLIENTS=500 patrec-server
//! ```

use std::time::Duration;

use clap::Parser;
use patrec_server::{RouterConfig, Server, ServerRuntimeConfig, TaskTtls};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Patrec teaching service server
#[derive(Parser, Debug)]
#[command(name = "patrec-server")]
#[command(about = "Pattern recognition teaching service over WebSockets")]
#[command(version)]
struct Args {
    /// Address to bind to; overrides --port
    #[arg(short, long, env = "BIND_ADDRESS")]
    bind: Option<String>,

    /// Port to listen on all interfaces
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Maximum concurrent connections
    #[arg(long, env = "MAX_CONNECTED_CLIENTS", default_value_t = 100)]
    max_connections: usize,

    /// Largest inbound message in bytes
    #[arg(long, env = "MAX_PAYLOAD_BYTES", default_value_t = 16 * 1024)]
    max_payload_bytes: usize,

    /// Connection TTL of the zeroth task, in seconds
    #[arg(long, default_value_t = 60)]
    zeroth_ttl_secs: u64,

    /// Connection TTL of the first task, in seconds
    #[arg(long, default_value_t = 300)]
    first_ttl_secs: u64,

    /// Connection TTL of the second task, in seconds
    #[arg(long, default_value_t = 300)]
    second_ttl_secs: u64,

    /// TTL check period in milliseconds
    #[arg(long, default_value_t = 250, value_parser = clap::value_parser!(u64).range(1..))]
    tick_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let bind_address = args.bind.unwrap_or_else(|| format!("0.0.0.0:{}", args.port));

    tracing::info!("Patrec server starting");
    tracing::info!("Binding to {}", bind_address);

    let config = ServerRuntimeConfig {
        bind_address,
        max_payload_bytes: args.max_payload_bytes,
        tick_interval: Duration::from_millis(args.tick_interval_ms),
        router: RouterConfig {
            max_connections: args.max_connections,
            ttls: TaskTtls {
                zeroth: Duration::from_secs(args.zeroth_ttl_secs),
                first: Duration::from_secs(args.first_ttl_secs),
                second: Duration::from_secs(args.second_ttl_secs),
            },
        },
    };

    let server = Server::bind(config).await?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}
