//! SafeNet Common Library
//!
//! Policy validation, peer registry, address allocation, key material and
//! WireGuard config rendering shared by the SafeNet daemon and CLI.

pub mod allocator;
pub mod db;
pub mod error;
pub mod keys;
pub mod name;
pub mod policy;
pub mod registry;
pub mod types;
pub mod wgconf;

// Re-export commonly used types
pub use allocator::AddressPool;
pub use db::Database;
pub use error::{Error, Result};
pub use keys::{KeyPair, KeyProvider, PrivateKey, PublicKey, X25519KeyProvider};
pub use name::{validate_name, DeviceName, NameError};
pub use policy::{AccessRule, Action, DeviceNode, SafeNetPolicy, ValidationError};
pub use registry::PeerRegistry;
pub use types::*;

/// SafeNet version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".safenet")
}

/// Default config file path
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.toml")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(std::path::PathBuf::from)
    }
}
