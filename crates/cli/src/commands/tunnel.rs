//! Tunnel Commands

use anyhow::{bail, Result};
use clap::Subcommand;
use serde::Serialize;

use crate::output::{print_item, print_success, OutputFormat, TableDisplay};
use safenet_common::TunnelState;
use safenet_daemon::ControlPlane;

#[derive(Subcommand)]
pub enum TunnelCommands {
    /// Render the hub config from the registry and activate the tunnel
    Up,

    /// Deactivate the tunnel and remove its config file
    Down,

    /// Query the tunnel daemon for the current state
    Status,
}

/// Tunnel status display wrapper
#[derive(Serialize)]
pub struct TunnelDisplay {
    pub name: String,
    pub backend: String,
    #[serde(flatten)]
    pub state: TunnelState,
    pub peers: usize,
}

impl TableDisplay for TunnelDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Tunnel", "Backend", "State", "Peers"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.backend.clone(),
            self.state.to_string(),
            self.peers.to_string(),
        ]
    }
}

/// Sync the driver with the daemon, refusing to act on an unreadable state
async fn reconcile(plane: &ControlPlane) -> Result<()> {
    match plane.status().await? {
        TunnelState::Error(reason) if !plane.driver().state().is_error() => {
            bail!("Cannot determine state of tunnel {}: {}", plane.config().tunnel.name, reason)
        }
        _ => Ok(()),
    }
}

pub async fn execute(cmd: TunnelCommands, plane: &ControlPlane, format: OutputFormat) -> Result<()> {
    match cmd {
        TunnelCommands::Up => {
            // Pick up a tunnel left running by an earlier invocation
            reconcile(plane).await?;
            plane.activate().await?;
            print_success(&format!("Tunnel {} is up", plane.config().tunnel.name));
        }

        TunnelCommands::Down => {
            // A fresh process starts out Inactive; ask the daemon first
            reconcile(plane).await?;
            plane.deactivate().await?;
            print_success(&format!("Tunnel {} is down", plane.config().tunnel.name));
        }

        TunnelCommands::Status => {
            let state = plane.status().await?;
            let display = TunnelDisplay {
                name: plane.config().tunnel.name.clone(),
                backend: plane.config().tunnel.backend.to_string(),
                state,
                peers: plane.list_peers().await?.len(),
            };
            print_item(&display, format);
        }
    }

    Ok(())
}
