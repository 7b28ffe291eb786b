use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use scale_telemetry::rest::{Credentials, DeviceApi, HttpDeviceApi};
use scale_telemetry::{
    load_config, AllMetricsPoller, Config, DevicesSubscription, TelemetryContext,
};
use tracing::{debug, info, warn, Level};

#[derive(Parser)]
#[command(name = "scale-telemetry")]
#[command(about = "Live telemetry client for weighing-scale fleets")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Telemetry WebSocket URL (overrides config file)
    #[arg(long)]
    url: Option<String>,

    /// REST API base URL (overrides config file)
    #[arg(long)]
    api_url: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info", value_parser = clap::value_parser!(Level))]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the telemetry stream and log live readings
    Watch {
        /// Device ids to follow (default: from config, else every listed device)
        #[arg(long, value_delimiter = ',')]
        devices: Vec<String>,

        /// Seconds between fleet summaries
        #[arg(long, default_value = "10")]
        summary_interval: u64,
    },

    /// List registered devices
    Devices,

    /// Show historical readings for one device
    History {
        /// Device id, e.g. PENKO-1020-001
        device_id: String,

        /// Number of readings (server default when omitted)
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    debug!(
        "Parsed command line arguments: config={:?}, url={:?}, api_url={:?}, log_level={:?}",
        args.config, args.url, args.api_url, args.log_level
    );

    let mut config = if let Some(config_path) = &args.config {
        debug!("Loading configuration from {:?}", config_path);
        load_config(config_path)?
    } else {
        debug!("Using default configuration");
        Config::default()
    };

    if let Some(url) = args.url {
        config.connection.url = url;
    }
    if let Some(api_url) = args.api_url {
        config.api.base_url = api_url;
    }

    let api = HttpDeviceApi::new(config.api.base_url.clone());
    if let (Some(username), Some(password)) = (&config.api.username, &config.api.password) {
        api.login(&Credentials::new(username.clone(), password.clone()))
            .await?;
    }

    let result = match args.command {
        Commands::Watch {
            devices,
            summary_interval,
        } => run_watch(&config, &api, devices, summary_interval).await,
        Commands::Devices => run_devices(&api).await,
        Commands::History { device_id, limit } => run_history(&api, &device_id, limit).await,
    };

    if let Err(e) = api.logout().await {
        warn!("Logout failed: {}", e);
    }
    result
}

async fn run_watch(
    config: &Config,
    api: &HttpDeviceApi,
    devices: Vec<String>,
    summary_interval: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let device_ids = if !devices.is_empty() {
        devices
    } else if !config.subscriptions.devices.is_empty() {
        config.subscriptions.devices.clone()
    } else {
        match api.list_devices().await {
            Ok(listed) => listed.into_iter().map(|device| device.id).collect(),
            Err(e) => {
                warn!("Could not list devices, following the whole fleet summary only: {}", e);
                Vec::new()
            }
        }
    };

    let context = TelemetryContext::new();
    let client = context.start(config.connection.clone());
    client.on_open(|| info!("Telemetry stream open"));
    client.on_close(|| info!("Telemetry stream closed"));
    client.on_error(|e| warn!("Telemetry stream error: {}", e));

    info!("Following {} devices", device_ids.len());
    let watched = DevicesSubscription::new(context.store(), device_ids);
    let mut changes = watched.watch();
    let poller = AllMetricsPoller::spawn(
        context.store().clone(),
        config.subscriptions.all_metrics_poll_interval(),
    );
    let mut summary = tokio::time::interval(Duration::from_secs(summary_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = changes.borrow_and_update().clone();
                for (device_id, snapshot) in &latest {
                    debug!(
                        "{}: {:.2} kg net ({}, {})",
                        device_id,
                        snapshot.net_weight,
                        snapshot.status,
                        if snapshot.is_stable { "stable" } else { "settling" }
                    );
                }
            }
            _ = summary.tick() => {
                let fleet = poller.latest();
                let stable = fleet.values().filter(|s| s.is_stable).count();
                info!(
                    "{} devices reporting ({} stable), connection {:?}, {} messages, {} reconnect attempts",
                    fleet.len(),
                    stable,
                    client.ready_state(),
                    context.messages_processed(),
                    client.reconnect_attempts()
                );
            }
        }
    }

    poller.stop();
    drop(watched);
    context.shutdown();
    Ok(())
}

async fn run_devices(api: &HttpDeviceApi) -> Result<(), Box<dyn std::error::Error>> {
    let devices = api.list_devices().await?;
    println!(
        "{:<16} {:<10} {:<20} {:<12} {:<13} {:>5}",
        "ID", "NAME", "LOCATION", "STATUS", "CONNECTION", "PCT"
    );
    for device in devices {
        println!(
            "{:<16} {:<10} {:<20} {:<12} {:<13} {:>5}",
            device.id,
            device.name,
            device.location.as_deref().unwrap_or("-"),
            device.status.to_string(),
            format!("{:?}", device.connection_status).to_lowercase(),
            device
                .status_percentage
                .map_or("-".to_string(), |p| format!("{}%", p))
        );
    }
    Ok(())
}

async fn run_history(
    api: &HttpDeviceApi,
    device_id: &str,
    limit: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = api.device_metrics(device_id, limit).await?;
    info!("{} readings for {}", metrics.len(), device_id);
    for snapshot in metrics {
        println!(
            "{}  net {:>8.2} kg  gross {:>8.2} kg  tare {:>6.2} kg  {:<11} {}",
            snapshot.timestamp.to_rfc3339(),
            snapshot.net_weight,
            snapshot.gross_weight,
            snapshot.tare_weight,
            snapshot.status.to_string(),
            if snapshot.is_stable { "stable" } else { "" }
        );
    }
    Ok(())
}
