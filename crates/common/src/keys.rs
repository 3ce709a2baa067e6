//! WireGuard key material
//!
//! `PrivateKey` is deliberately awkward to leak: it is not `Clone`,
//! `Serialize` or `Display`, its `Debug` output is redacted and its buffer is
//! zeroed on drop. The only ways out are `expose_secret` (borrowed, for the
//! config renderer) and `into_exposed` (consumes the key, for the single
//! enrollment response).

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

/// Length of a base64-encoded 32-byte key
pub const ENCODED_KEY_LEN: usize = 44;

/// Private half of a WireGuard key pair (base64)
pub struct PrivateKey {
    encoded: Zeroizing<String>,
}

impl PrivateKey {
    /// Parse a base64 private key
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let mut bytes = decode_key(encoded)?;
        bytes.zeroize();
        Ok(Self {
            encoded: Zeroizing::new(encoded.to_string()),
        })
    }

    fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            encoded: Zeroizing::new(STANDARD.encode(bytes)),
        }
    }

    /// Borrow the encoded secret
    pub fn expose_secret(&self) -> &str {
        &self.encoded
    }

    /// Hand the encoded secret to its final owner
    pub fn into_exposed(self) -> String {
        self.encoded.as_str().to_string()
    }

    /// Derive the matching public key
    pub fn public_key(&self) -> Result<PublicKey> {
        let mut bytes = decode_key(&self.encoded)?;
        let secret = StaticSecret::from(bytes);
        bytes.zeroize();
        let public = X25519Public::from(&secret);
        Ok(PublicKey(STANDARD.encode(public.as_bytes())))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

/// Public half of a WireGuard key pair (base64, 44 chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(String);

impl PublicKey {
    pub fn parse(encoded: &str) -> Result<Self> {
        decode_key(encoded)?;
        Ok(Self(encoded.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PublicKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.0
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    if encoded.len() != ENCODED_KEY_LEN {
        return Err(Error::Crypto(format!(
            "Key must be {} base64 characters (got {})",
            ENCODED_KEY_LEN,
            encoded.len()
        )));
    }
    let decoded = Zeroizing::new(
        STANDARD
            .decode(encoded)
            .map_err(|e| Error::Crypto(format!("Invalid base64 key: {}", e)))?,
    );
    let bytes: [u8; 32] = decoded
        .as_slice()
        .try_into()
        .map_err(|_| Error::Crypto("Key must decode to 32 bytes".to_string()))?;
    Ok(bytes)
}

/// WireGuard key pair
#[derive(Debug)]
pub struct KeyPair {
    pub private_key: PrivateKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    pub fn from_private_key(private_key: PrivateKey) -> Result<Self> {
        let public_key = private_key.public_key()?;
        Ok(Self { private_key, public_key })
    }
}

/// Source of ephemeral key pairs
pub trait KeyProvider: Send + Sync {
    fn generate_pair(&self) -> Result<KeyPair>;
}

/// In-process x25519 key generation
#[derive(Debug, Default, Clone, Copy)]
pub struct X25519KeyProvider;

impl KeyProvider for X25519KeyProvider {
    fn generate_pair(&self) -> Result<KeyPair> {
        Ok(generate_wireguard_keypair())
    }
}

/// Generate a WireGuard keypair using x25519
pub fn generate_wireguard_keypair() -> KeyPair {
    let mut private_key_bytes = Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill_bytes(private_key_bytes.as_mut());

    // WireGuard key clamping
    private_key_bytes[0] &= 248;
    private_key_bytes[31] &= 127;
    private_key_bytes[31] |= 64;

    let secret = StaticSecret::from(*private_key_bytes);
    let public = X25519Public::from(&secret);

    KeyPair {
        private_key: PrivateKey::from_bytes(&private_key_bytes),
        public_key: PublicKey(STANDARD.encode(public.as_bytes())),
    }
}

/// Load a key pair from a file holding the base64 private key
pub async fn load_key_file(path: impl AsRef<Path>) -> Result<KeyPair> {
    let content = Zeroizing::new(fs::read_to_string(path.as_ref()).await?);
    let private_key = PrivateKey::from_base64(content.trim())?;
    KeyPair::from_private_key(private_key)
}

/// Write a private key file readable only by the owner
pub async fn save_key_file(key: &PrivateKey, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let content = Zeroizing::new(format!("{}\n", key.expose_secret()));
    write_private_file(path, content.as_bytes()).await
}

/// Load the key at `path`, generating and saving one if it does not exist
pub async fn get_or_create_key_file(path: impl AsRef<Path>) -> Result<KeyPair> {
    let path = path.as_ref();
    if fs::try_exists(path).await? {
        debug!("Loading key from {:?}", path);
        return load_key_file(path).await;
    }

    let keypair = generate_wireguard_keypair();
    save_key_file(&keypair.private_key, path).await?;
    info!("Generated new key at {:?} (public {})", path, keypair.public_key);
    Ok(keypair)
}

/// Write secret material with mode 0600 on unix
pub async fn write_private_file(path: &Path, content: &[u8]) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .await?;
        file.write_all(content).await?;
        file.flush().await?;
    }

    #[cfg(not(unix))]
    {
        fs::write(path, content).await?;
    }

    Ok(())
}
