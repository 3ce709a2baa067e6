//! Core types for SafeNet

use crate::keys::PublicKey;
use crate::name::DeviceName;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// An enrolled peer as stored by the registry
///
/// There is no private key field; the private half never reaches storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: Uuid,
    pub name: DeviceName,
    pub public_key: PublicKey,
    pub address: Ipv4Addr,
    /// Group memberships from the applied policy
    #[serde(default)]
    pub groups: Vec<String>,
    pub created_at: i64,
}

impl Peer {
    pub fn new(name: DeviceName, public_key: PublicKey, address: Ipv4Addr) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            public_key,
            address,
            groups: Vec::new(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Host-route form used for `AllowedIPs` on the hub
    pub fn host_route(&self) -> String {
        format!("{}/32", self.address)
    }

    /// Peer block for the hub configuration
    pub fn to_entry(&self) -> PeerEntry {
        PeerEntry::new(self.public_key.as_str(), self.host_route())
    }
}

/// One `[Peer]` block of a tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub public_key: String,
    pub allowed_ips: String,
    pub endpoint: Option<String>,
    pub keepalive: Option<u16>,
}

impl PeerEntry {
    pub fn new(public_key: impl Into<String>, allowed_ips: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            allowed_ips: allowed_ips.into(),
            endpoint: None,
            keepalive: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_keepalive(mut self, seconds: u16) -> Self {
        self.keepalive = Some(seconds);
        self
    }
}

/// Tunnel lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TunnelState {
    Inactive,
    Starting,
    Active,
    Stopping,
    Error(String),
}

impl TunnelState {
    /// A start or stop is outstanding
    pub fn is_transitioning(&self) -> bool {
        matches!(self, TunnelState::Starting | TunnelState::Stopping)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, TunnelState::Error(_))
    }
}

impl Default for TunnelState {
    fn default() -> Self {
        Self::Inactive
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelState::Inactive => write!(f, "inactive"),
            TunnelState::Starting => write!(f, "starting"),
            TunnelState::Active => write!(f, "active"),
            TunnelState::Stopping => write!(f, "stopping"),
            TunnelState::Error(reason) => write!(f, "error ({})", reason),
        }
    }
}
