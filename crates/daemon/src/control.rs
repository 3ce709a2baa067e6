//! Control plane
//!
//! Ties the registry, key provider, config renderer and tunnel driver
//! together. Enrollment: name check, ephemeral key pair, atomic
//! allocate-and-insert, client config render. Activation: registry read, hub
//! config render, tunnel start.
//!
//! Registry calls are blocking SQLite work and run on the blocking pool so
//! they never stall the runtime while an external process is awaited.

use crate::config::SafenetConfig;
use crate::process::{ProcessRunner, TokioRunner};
use crate::tunnel::TunnelDriver;
use safenet_common::keys::{get_or_create_key_file, load_key_file};
use safenet_common::policy::load_policy;
use safenet_common::{
    validate_name, wgconf, AddressPool, Database, Error, KeyPair, KeyProvider, Peer, PeerEntry,
    PeerRegistry, PrivateKey, PublicKey, Result, SafeNetPolicy, TunnelState, ValidationError,
    X25519KeyProvider,
};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

/// Result of a successful enrollment
///
/// Holds the only copy of the peer's private key. It is consumed by
/// `into_response`, and wiped if dropped instead.
pub struct Enrollment {
    pub peer: Peer,
    private_key: PrivateKey,
    rendered_config: Zeroizing<String>,
}

impl Enrollment {
    /// Client configuration, including the private key
    pub fn rendered_config(&self) -> &str {
        &self.rendered_config
    }

    /// Hand the secret material to the caller
    pub fn into_response(self) -> EnrollmentResponse {
        EnrollmentResponse {
            name: self.peer.name.to_string(),
            assigned_address: self.peer.address.to_string(),
            public_key: self.peer.public_key.to_string(),
            private_key: self.private_key.into_exposed(),
            rendered_config: self.rendered_config.as_str().to_string(),
        }
    }
}

impl fmt::Debug for Enrollment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enrollment")
            .field("peer", &self.peer)
            .field("private_key", &self.private_key)
            .field("rendered_config", &"[REDACTED]")
            .finish()
    }
}

/// One-time enrollment response
#[derive(Clone, Serialize)]
pub struct EnrollmentResponse {
    pub name: String,
    pub assigned_address: String,
    pub public_key: String,
    pub private_key: String,
    pub rendered_config: String,
}

impl fmt::Debug for EnrollmentResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrollmentResponse")
            .field("name", &self.name)
            .field("assigned_address", &self.assigned_address)
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .field("rendered_config", &"[REDACTED]")
            .finish()
    }
}

impl Drop for EnrollmentResponse {
    fn drop(&mut self) {
        self.private_key.zeroize();
        self.rendered_config.zeroize();
    }
}

/// SafeNet control plane
pub struct ControlPlane {
    config: SafenetConfig,
    pool: AddressPool,
    registry: PeerRegistry,
    keys: Arc<dyn KeyProvider>,
    driver: Arc<TunnelDriver>,
}

impl ControlPlane {
    /// Open the store described by `config` with the real process runner
    pub fn open(config: SafenetConfig) -> Result<Self> {
        let db = Database::open(config.db_path())?;
        Self::with_parts(config, db, Arc::new(X25519KeyProvider), Arc::new(TokioRunner))
    }

    /// Assemble from explicit parts
    pub fn with_parts(
        config: SafenetConfig,
        db: Database,
        keys: Arc<dyn KeyProvider>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = config.pool()?;
        let driver = TunnelDriver::new(
            config.tunnel_name()?,
            config.tunnel.backend,
            config.tunnel_config_dir(),
            runner,
        )
        .with_timeouts(config.command_timeout(), config.status_timeout());

        info!(
            "Control plane ready: tunnel {} via {}, pool {} ({} assignable)",
            config.tunnel.name,
            config.tunnel.backend,
            pool,
            pool.capacity()
        );
        Ok(Self {
            registry: PeerRegistry::new(db, pool),
            pool,
            config,
            keys,
            driver: Arc::new(driver),
        })
    }

    pub fn config(&self) -> &SafenetConfig {
        &self.config
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Shared handle to the tunnel driver
    pub fn driver(&self) -> Arc<TunnelDriver> {
        self.driver.clone()
    }

    /// Record a validated policy's groups and memberships
    pub async fn apply_policy(&self, policy: &SafeNetPolicy) -> Result<()> {
        let policy = policy.clone();
        self.with_registry(move |registry| registry.apply_policy(&policy))
            .await
    }

    /// Load, validate and apply a policy file
    pub async fn apply_policy_file(&self, path: impl AsRef<Path>) -> Result<SafeNetPolicy> {
        let policy = load_policy(path).await?;
        self.apply_policy(&policy).await?;
        Ok(policy)
    }

    /// Groups declared by the last applied policy
    pub async fn declared_groups(&self) -> Result<Vec<String>> {
        self.with_registry(|registry| registry.declared_groups()).await
    }

    /// Replace one device's memberships; each group must be declared
    pub async fn assign_groups(&self, raw_name: &str, groups: Vec<String>) -> Result<()> {
        let name = validate_name(raw_name)
            .map_err(|e| ValidationError::new("name", raw_name, e.to_string()))?;
        self.with_registry(move |registry| registry.assign_groups(&name, &groups))
            .await
    }

    /// Enroll a new peer under `raw_name`
    pub async fn enroll(&self, raw_name: &str) -> Result<Enrollment> {
        let name = validate_name(raw_name)
            .map_err(|e| ValidationError::new("name", raw_name, e.to_string()))?;
        let KeyPair {
            private_key,
            public_key,
        } = self.keys.generate_pair()?;

        let peer = {
            let name = name.clone();
            self.with_registry(move |registry| registry.enroll(&name, &public_key))
                .await?
        };

        let rendered_config = self.client_config(&peer, &private_key).await?;
        info!("Enrolled {} at {}", peer.name, peer.address);

        Ok(Enrollment {
            peer,
            private_key,
            rendered_config,
        })
    }

    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        self.with_registry(|registry| registry.list_peers()).await
    }

    pub async fn get_peer(&self, name: &str) -> Result<Peer> {
        let name = name.to_string();
        self.with_registry(move |registry| registry.get_peer(&name))
            .await
    }

    /// Delete a peer; takes effect on the hub at the next activation
    pub async fn remove_peer(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.with_registry(move |registry| registry.delete_peer(&name))
            .await?;
        if self.driver.state() == TunnelState::Active {
            info!("Tunnel is active; restart it to drop the removed peer");
        }
        Ok(())
    }

    /// Render the hub configuration from current registry contents
    pub async fn hub_config(&self) -> Result<Zeroizing<String>> {
        let hub = get_or_create_key_file(self.config.hub_key_path()).await?;
        let peers = self.list_peers().await?;
        let entries: Vec<PeerEntry> = peers.iter().map(Peer::to_entry).collect();
        debug!("Rendering hub config with {} peers", entries.len());

        Ok(wgconf::render(
            &self.pool.gateway_cidr(),
            self.config.network.listen_port,
            &hub.private_key,
            &entries,
        ))
    }

    /// Bring the hub tunnel up with every enrolled peer
    pub async fn activate(&self) -> Result<()> {
        let text = self.hub_config().await?;
        self.driver.start(&text).await
    }

    pub async fn deactivate(&self) -> Result<()> {
        self.driver.stop().await
    }

    pub async fn status(&self) -> Result<TunnelState> {
        self.driver.status().await
    }

    /// Hub public key, if the hub identity has been created
    pub async fn hub_public_key(&self) -> Result<Option<PublicKey>> {
        let path = self.config.hub_key_path();
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Ok(Some(load_key_file(&path).await?.public_key))
    }

    async fn client_config(
        &self,
        peer: &Peer,
        private_key: &PrivateKey,
    ) -> Result<Zeroizing<String>> {
        let mut entries = Vec::new();
        if let Some(hub) = self.hub_public_key().await? {
            let mut entry = PeerEntry::new(hub.as_str(), self.pool.network().to_string());
            if let Some(endpoint) = &self.config.network.endpoint {
                entry = entry.with_endpoint(endpoint.as_str());
            }
            if let Some(keepalive) = self.config.keepalive() {
                entry = entry.with_keepalive(keepalive);
            }
            entries.push(entry);
        }

        Ok(wgconf::render(
            &self.pool.with_prefix(peer.address),
            self.config.network.listen_port,
            private_key,
            &entries,
        ))
    }

    async fn with_registry<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(PeerRegistry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || f(registry))
            .await
            .map_err(|e| Error::Internal(format!("Registry task failed: {}", e)))?
    }
}
