//! Fleet Gateway Binary
//!
//! Runs the gateway (`serve`) or talks to a running one.
//!
//! # Usage
//!
//! ```bash
//! # Boot the fleet and serve the trigger API
//! fleet-gateway serve --config /etc/camfleet/gateway.toml
//!
//! # Reload the camera list and restart every relay
//! fleet-gateway refresh --url http://127.0.0.1:8090
//!
//! # Smallest instance tier for 12 cameras
//! fleet-gateway plan-tier --cameras 12
//!
//! # Check a fleet document before publishing it
//! fleet-gateway validate cameras.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camfleet_gateway::{
    api::{build_router, AppState},
    config::Settings,
    FleetConfiguration, GatewayRuntime,
};

#[derive(Parser)]
#[command(name = "fleet-gateway")]
#[command(about = "Relay a fleet of RTSP cameras into Kinesis Video Streams")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML)
    #[arg(long, env = "FLEET_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Trigger API of a running gateway
    #[arg(long, env = "FLEET_GATEWAY_URL", default_value = "http://127.0.0.1:8090", global = true)]
    url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the fleet and serve the trigger API
    Serve,

    /// Apply the current configuration on a running gateway
    Apply,

    /// Reload the configuration and restart the fleet on a running gateway
    Refresh,

    /// Show fleet status of a running gateway
    Status,

    /// Pick the smallest capacity tier for a camera count
    PlanTier {
        /// Number of cameras to host
        #[arg(long)]
        cameras: u32,
    },

    /// Parse and validate a fleet document offline
    Validate {
        /// JSON document as published to the configuration store
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => serve(cli.config).await,
        Commands::Apply => trigger(&cli.url, "apply").await,
        Commands::Refresh => trigger(&cli.url, "refresh").await,
        Commands::Status => status(&cli.url).await,
        Commands::PlanTier { cameras } => plan_tier(cli.config, cameras),
        Commands::Validate { file } => validate(cli.config, &file),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    let json = std::env::var("FLEET_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn serve(config: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting Fleet Gateway...");

    let settings = Settings::load(config.as_ref()).context("invalid gateway settings")?;

    tracing::info!(
        "Configuration: HTTP port={}, state dir={}, poll interval={}s",
        settings.server.http_port,
        settings.state.dir.display(),
        settings.poll.interval_seconds
    );

    let runtime = Arc::new(GatewayRuntime::from_settings(&settings)?);

    // Boot failures other than a credential outage are fatal. A signal during
    // boot stops the relays launched so far.
    let Some(status) = runtime
        .boot_or_shutdown(&settings.retry_policy(), shutdown_signal())
        .await
        .context("fleet boot failed")?
    else {
        tracing::info!("Fleet Gateway shutdown complete");
        return Ok(());
    };
    tracing::info!(
        version = ?status.version,
        running = status.running,
        cameras = status.processes.len(),
        "Fleet booted"
    );

    // Create shutdown signal channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let poll_handle = settings.poll_interval().map(|interval| {
        let runtime = runtime.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            runtime.run_poll_loop(interval, shutdown_rx).await;
        })
    });

    let watch_handle = {
        let runtime = runtime.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        let interval = settings.credential_check_interval();
        tokio::spawn(async move {
            runtime.run_credential_watch(interval, shutdown_rx).await;
        })
    };

    let router = build_router(AppState::new(runtime.clone()));

    let bind_addr = format!("{}:{}", settings.server.host, settings.server.http_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", bind_addr))?;
    tracing::info!("HTTP server listening on {}", bind_addr);

    let shutdown_tx_clone = shutdown_tx.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, stopping fleet...");
            let _ = shutdown_tx_clone.send(());
        })
        .await?;

    let _ = shutdown_tx.send(());
    if let Some(handle) = poll_handle {
        let _ = handle.await;
    }
    let _ = watch_handle.await;

    runtime.shutdown().await;

    tracing::info!("Fleet Gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn client() -> Result<reqwest::Client> {
    // Reconfigurations wait out a settle delay per camera
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(600))
        .build()
        .context("failed to build HTTP client")
}

async fn trigger(url: &str, action: &str) -> Result<()> {
    let endpoint = format!("{}/api/fleet/{}", url.trim_end_matches('/'), action);
    let resp = client()?
        .post(&endpoint)
        .send()
        .await
        .with_context(|| format!("gateway unreachable at {}", endpoint))?;
    print_response(resp).await
}

async fn status(url: &str) -> Result<()> {
    let endpoint = format!("{}/api/fleet/status", url.trim_end_matches('/'));
    let resp = client()?
        .get(&endpoint)
        .send()
        .await
        .with_context(|| format!("gateway unreachable at {}", endpoint))?;
    print_response(resp).await
}

async fn print_response(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("malformed gateway response")?;

    if !status.is_success() {
        let kind = body["error"].as_str().unwrap_or("unknown_error");
        let message = body["message"].as_str().unwrap_or_default();
        bail!("gateway returned {} ({}): {}", status, kind, message);
    }

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn plan_tier(config: Option<PathBuf>, cameras: u32) -> Result<()> {
    let settings = Settings::load(config.as_ref())?;
    let table = settings.tier_table()?;
    let selected = table.select(cameras)?;

    for tier in table.tiers() {
        let marker = if tier == selected { "*" } else { " " };
        println!("{} {:<16} up to {} cameras", marker, tier.name, tier.max_camera_capacity);
    }
    println!("{} for {} cameras", selected.name, cameras);
    Ok(())
}

fn validate(config: Option<PathBuf>, file: &Path) -> Result<()> {
    let content = std::fs::read(file).with_context(|| format!("cannot read {}", file.display()))?;
    let fleet = FleetConfiguration::from_document(&content, None)?;
    let enabled = fleet.enabled_cameras().count();

    println!("version:  {}", fleet.version);
    println!("cameras:  {} ({} enabled)", fleet.len(), enabled);
    for camera in &fleet.cameras {
        println!(
            "  {:<24} {}{}",
            camera.sink_stream_id,
            camera.display_name(),
            if camera.enabled { "" } else { " (disabled)" }
        );
    }

    let table = Settings::load(config.as_ref())?.tier_table()?;
    match table.select(enabled as u32) {
        Ok(tier) => println!("tier:     {}", tier.name),
        Err(e) => println!("tier:     none ({})", e),
    }
    Ok(())
}
