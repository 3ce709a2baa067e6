//! Daemon configuration

use crate::backend::{Backend, MAX_INTERFACE_NAME_LEN};
use safenet_common::{validate_name, AddressPool, DeviceName, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// SafeNet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafenetConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Policy document applied at startup
    pub policy_path: Option<PathBuf>,

    /// Tunnel configuration
    pub tunnel: TunnelConfig,

    /// Network configuration
    pub network: NetworkConfig,
}

impl Default for SafenetConfig {
    fn default() -> Self {
        Self {
            store_path: safenet_common::default_store_path(),
            policy_path: None,
            tunnel: TunnelConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

/// Tunnel driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Logical tunnel name; also the interface and service name
    pub name: String,

    /// How the tunnel daemon is driven
    pub backend: Backend,

    /// Directory for the rendered config file
    pub config_dir: Option<PathBuf>,

    /// Upper bound for activate and deactivate calls
    pub command_timeout_secs: u64,

    /// Upper bound for state queries
    pub status_timeout_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: "safenet".to_string(),
            backend: Backend::platform_default(),
            config_dir: None,
            command_timeout_secs: 30,
            status_timeout_secs: 10,
        }
    }
}

/// Overlay network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address block peers are drawn from
    pub subnet: String,

    /// Hub listen port, also written to client configs
    pub listen_port: u16,

    /// `host:port` clients dial to reach the hub
    pub endpoint: Option<String>,

    /// PersistentKeepalive for the hub peer in client configs (0 disables)
    pub keepalive_secs: u16,

    /// Hub private key file
    pub hub_key_path: Option<PathBuf>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnet: "10.8.0.0/24".to_string(),
            listen_port: 51820,
            endpoint: None,
            keepalive_secs: 25,
            hub_key_path: None,
        }
    }
}

impl SafenetConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check the values that reach the tunnel daemon or the allocator
    pub fn validate(&self) -> Result<()> {
        let name = self.tunnel_name()?;
        if self.tunnel.backend == Backend::WgQuick && name.as_str().len() > MAX_INTERFACE_NAME_LEN {
            return Err(Error::InvalidConfig(format!(
                "Tunnel name '{}' is longer than the {} characters wg-quick allows for an interface",
                name, MAX_INTERFACE_NAME_LEN
            )));
        }
        self.pool()?;
        if self.tunnel.command_timeout_secs == 0 || self.tunnel.status_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "Tunnel timeouts must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the validated tunnel name
    pub fn tunnel_name(&self) -> Result<DeviceName> {
        Ok(validate_name(&self.tunnel.name)?)
    }

    /// Get the address pool
    pub fn pool(&self) -> Result<AddressPool> {
        AddressPool::parse(&self.network.subnet)
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Get the rendered tunnel config directory
    pub fn tunnel_config_dir(&self) -> PathBuf {
        self.tunnel
            .config_dir
            .clone()
            .unwrap_or_else(|| self.store_path.join("tunnels"))
    }

    /// Get the hub key path
    pub fn hub_key_path(&self) -> PathBuf {
        self.network
            .hub_key_path
            .clone()
            .unwrap_or_else(|| self.store_path.join("hub.key"))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel.command_timeout_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel.status_timeout_secs)
    }

    /// Keepalive for client configs, if enabled
    pub fn keepalive(&self) -> Option<u16> {
        (self.network.keepalive_secs > 0).then_some(self.network.keepalive_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SafenetConfig::default();
        assert_eq!(config.tunnel.name, "safenet");
        assert_eq!(config.network.listen_port, 51820);
        assert_eq!(config.keepalive(), Some(25));
        assert!(config.validate().is_ok());
        assert_eq!(config.db_path(), config.store_path.join("state.db"));
        assert_eq!(config.hub_key_path(), config.store_path.join("hub.key"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: SafenetConfig = toml::from_str(
            r#"
store_path = "/var/lib/safenet"

[network]
subnet = "10.20.0.0/24"
endpoint = "vpn.example.com:51820"

[tunnel]
backend = "wg-quick"
"#,
        )
        .unwrap();

        assert_eq!(config.tunnel.backend, Backend::WgQuick);
        assert_eq!(config.tunnel.name, "safenet");
        assert_eq!(config.network.listen_port, 51820);
        assert_eq!(
            config.tunnel_config_dir(),
            PathBuf::from("/var/lib/safenet/tunnels")
        );
        assert_eq!(config.pool().unwrap().gateway_cidr(), "10.20.0.1/24");
    }

    #[test]
    fn test_unsafe_tunnel_name_rejected() {
        let mut config = SafenetConfig::default();
        config.tunnel.name = "safenet & calc".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_interface_name_limit_for_wg_quick() {
        let mut config = SafenetConfig::default();
        config.tunnel.name = "corp-overlay-net1".to_string();

        config.tunnel.backend = Backend::WgQuick;
        match config.validate().unwrap_err() {
            Error::InvalidConfig(msg) => assert!(msg.contains("corp-overlay-net1")),
            other => panic!("unexpected error: {:?}", other),
        }

        config.tunnel.name = "corp-overlay-15".to_string();
        assert!(config.validate().is_ok());

        // Service names are not bound by the interface limit
        config.tunnel.name = "corp-overlay-net1".to_string();
        config.tunnel.backend = Backend::WindowsService;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = SafenetConfig::default();
        config.network.keepalive_secs = 0;
        config.policy_path = Some(dir.path().join("policy.yaml"));
        config.save(&path).unwrap();

        let loaded = SafenetConfig::load(&path).unwrap();
        assert_eq!(loaded.keepalive(), None);
        assert_eq!(loaded.policy_path, config.policy_path);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = SafenetConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.network.subnet, "10.8.0.0/24");
    }
}
