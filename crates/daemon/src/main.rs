//! SafeNet Daemon
//!
//! Runs the hub tunnel in the foreground: applies the configured policy,
//! activates the tunnel with every enrolled peer, monitors it, and tears it
//! down on Ctrl-C.

use clap::Parser;
use safenet_daemon::{init_logging, ControlPlane, SafenetConfig, TunnelMonitor};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "safenetd")]
#[command(about = "SafeNet daemon - default-deny WireGuard overlay hub")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "SAFENET_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Policy document applied before activation
    #[arg(short, long)]
    policy: Option<PathBuf>,

    /// Status poll interval in seconds
    #[arg(long, default_value = "15")]
    poll_interval: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    info!("SafeNet daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = cli
        .config
        .unwrap_or_else(safenet_common::default_config_path);
    let mut config = SafenetConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(policy) = cli.policy {
        config.policy_path = Some(policy);
    }

    // Ensure store directory exists
    tokio::fs::create_dir_all(&config.store_path).await?;

    let plane = ControlPlane::open(config)?;

    if let Some(path) = plane.config().policy_path.clone() {
        let policy = plane.apply_policy_file(&path).await?;
        info!(
            "Applied policy {:?}: {} devices, {} rules",
            path,
            policy.devices().len(),
            policy.access_rules().len()
        );
    }

    plane.activate().await?;

    let cancel = CancellationToken::new();
    let monitor = TunnelMonitor::new(plane.driver(), Duration::from_secs(cli.poll_interval.max(1)));
    let monitor_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { monitor.run(cancel).await })
    };

    info!("Tunnel {} up; press Ctrl-C to stop", plane.config().tunnel.name);

    // Wait for shutdown signal
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");

    cancel.cancel();
    if let Err(e) = monitor_handle.await {
        warn!("Monitor task ended abnormally: {}", e);
    }

    plane.deactivate().await?;
    info!("Daemon shutdown complete");
    Ok(())
}
