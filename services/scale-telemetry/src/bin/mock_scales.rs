//! Mock scale backend for development and testing
//!
//! Serves a simulated PENKO-1020 fleet: a metrics stream on `/ws` and the
//! device/auth REST endpoints under `/api`.
//!
//! Usage:
//!   mock_scales [--port PORT] [--interval-ms MS] [--fleet-size N]

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use scale_telemetry::mock::{MockServer, MockServerState};
use scale_telemetry::{load_config, Config};
use tracing::{debug, info, Level};

#[derive(Parser)]
#[command(name = "mock_scales")]
#[command(about = "Simulated weighing-scale telemetry backend")]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port (overrides config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Milliseconds between metric broadcasts (overrides config file)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Number of simulated devices (overrides config file)
    #[arg(long)]
    fleet_size: Option<usize>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    let mut config = if let Some(config_path) = &args.config {
        debug!("Loading configuration from {:?}", config_path);
        load_config(config_path)?
    } else {
        Config::default()
    };

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(interval_ms) = args.interval_ms {
        config.server.stream_interval_ms = interval_ms;
    }
    if let Some(fleet_size) = args.fleet_size {
        config.server.fleet_size = fleet_size;
    }

    let state = MockServerState::new(&config.server);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let server = MockServer::bind(addr, state).await?;
    info!(
        "Streaming {} devices every {} ms on {}",
        config.server.fleet_size,
        config.server.stream_interval_ms,
        server.ws_url()
    );

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    server.wait().await?;
    info!("Mock scale server stopped");
    Ok(())
}
