//! Tunnel daemon backends
//!
//! Each backend maps the three daemon operations (activate by path,
//! deactivate by name, query by name) onto concrete invocations and knows how
//! to read the query result. Both backends derive the interface or service
//! name from the config file stem, so the file is always `<name>.conf`.

use crate::process::{Invocation, ProcessOutput};
use safenet_common::{DeviceName, TunnelState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

const WIREGUARD_WINDOWS_HINT: &str = "Ensure WireGuard for Windows is installed and \
'C:\\Program Files\\WireGuard' is in your system PATH. Download: https://www.wireguard.com/install/";
const SC_HINT: &str = "sc.exe ships with Windows; check that %SystemRoot%\\System32 is in PATH.";
const WG_TOOLS_HINT: &str = "Install wireguard-tools (for example `apt install wireguard-tools`) \
and run as root.";
const IPROUTE_HINT: &str = "Install iproute2 (for example `apt install iproute2`).";

/// Longest Linux interface name (IFNAMSIZ minus the terminator)
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

const WG_NO_DEVICE: &str = "No such device";

/// Windows service name prefix used by wireguard.exe
pub const WINDOWS_SERVICE_PREFIX: &str = "WireGuardTunnel$";

/// How the external tunnel daemon is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// `wireguard.exe /installtunnelservice` and `sc query`
    WindowsService,
    /// `wg-quick up`, `ip link delete` and `wg show`
    WgQuick,
}

impl Backend {
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Backend::WindowsService
        } else {
            Backend::WgQuick
        }
    }

    /// Config file name for a tunnel
    pub fn config_file_name(name: &DeviceName) -> String {
        format!("{}.conf", name)
    }

    /// Install and start the tunnel described by the file at `path`
    pub fn activate(&self, path: &Path) -> Invocation {
        match self {
            Backend::WindowsService => Invocation::new("wireguard.exe", WIREGUARD_WINDOWS_HINT)
                .arg("/installtunnelservice")
                .arg(path),
            Backend::WgQuick => Invocation::new("wg-quick", WG_TOOLS_HINT).arg("up").arg(path),
        }
    }

    /// Stop and remove the tunnel
    pub fn deactivate(&self, name: &DeviceName) -> Invocation {
        match self {
            Backend::WindowsService => Invocation::new("wireguard.exe", WIREGUARD_WINDOWS_HINT)
                .arg("/uninstalltunnelservice")
                .arg(name),
            Backend::WgQuick => Invocation::new("ip", IPROUTE_HINT)
                .arg("link")
                .arg("delete")
                .arg("dev")
                .arg(name),
        }
    }

    /// Ask the daemon for the tunnel state
    pub fn query(&self, name: &DeviceName) -> Invocation {
        match self {
            Backend::WindowsService => Invocation::new("sc", SC_HINT)
                .arg("query")
                .arg(format!("{}{}", WINDOWS_SERVICE_PREFIX, name)),
            Backend::WgQuick => Invocation::new("wg", WG_TOOLS_HINT).arg("show").arg(name),
        }
    }

    /// Map a finished query to a tunnel state
    pub fn parse_state(&self, output: &ProcessOutput) -> TunnelState {
        match self {
            // Non-zero from sc means the service does not exist
            Backend::WindowsService if !output.success() => TunnelState::Inactive,
            Backend::WindowsService => parse_sc_state(&output.stdout),
            Backend::WgQuick if output.success() => TunnelState::Active,
            Backend::WgQuick => parse_wg_failure(output),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::WindowsService => write!(f, "windows-service"),
            Backend::WgQuick => write!(f, "wg-quick"),
        }
    }
}

/// Only a missing interface means down; anything else (EPERM) is unknown
fn parse_wg_failure(output: &ProcessOutput) -> TunnelState {
    let stderr = output.stderr.trim();
    if stderr.contains(WG_NO_DEVICE) {
        TunnelState::Inactive
    } else if stderr.is_empty() {
        TunnelState::Error(format!("wg show exited with {:?}", output.status))
    } else {
        TunnelState::Error(stderr.to_string())
    }
}

/// Read the `STATE : <code> <NAME>` line of `sc query` output
fn parse_sc_state(stdout: &str) -> TunnelState {
    let Some(value) = stdout
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim() == "STATE")
        .map(|(_, value)| value.trim())
    else {
        return TunnelState::Error("no STATE in service query output".to_string());
    };

    match value.split_whitespace().next() {
        Some("1") => TunnelState::Inactive,
        Some("2") => TunnelState::Starting,
        Some("3") => TunnelState::Stopping,
        Some("4") => TunnelState::Active,
        _ => TunnelState::Error(format!("unknown service state {:?}", value)),
    }
}
