//! SafeNet CLI - Main Entry Point
//!
//! One-shot operator front end: policy validation, peer enrollment and
//! tunnel lifecycle, all against the local store.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{peer, policy, tunnel};
use output::print_error;
use safenet_daemon::{ControlPlane, SafenetConfig};

/// SafeNet CLI - Default-deny WireGuard overlay control plane
#[derive(Parser)]
#[command(name = "safenet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "SAFENET_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Store directory (overrides the config file)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and apply access policies
    #[command(subcommand)]
    Policy(policy::PolicyCommands),

    /// Enroll and manage peers
    #[command(subcommand)]
    Peer(peer::PeerCommands),

    /// Control the hub tunnel
    #[command(subcommand)]
    Tunnel(tunnel::TunnelCommands),

    /// Show version information
    Version,
}

fn load_config(cli: &Cli) -> anyhow::Result<SafenetConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(safenet_common::default_config_path);
    let mut config = SafenetConfig::load(&path)?;
    if let Some(store) = &cli.store {
        config.store_path = store.clone();
    }
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Version => {
            println!("SafeNet CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Default-deny WireGuard overlay control plane");
            return Ok(());
        }
        // Validation needs no store
        Commands::Policy(policy::PolicyCommands::Validate { ref file }) => {
            return policy::validate(file.clone(), cli.format).await;
        }
        _ => {}
    }

    let plane = ControlPlane::open(load_config(&cli)?)?;

    match cli.command {
        Commands::Policy(cmd) => policy::execute(cmd, &plane, cli.format).await?,
        Commands::Peer(cmd) => peer::execute(cmd, &plane, cli.format).await?,
        Commands::Tunnel(cmd) => tunnel::execute(cmd, &plane, cli.format).await?,
        Commands::Version => {}
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
