//! Configuration and key management
//!
//! Handles the CLI configuration and the renter's RSA keypair.
//! Config directory: ~/.skerry/
//!
//! Config file format (~/.skerry/config.toml):
//! ```toml
//! [metaserver]
//! url = "http://localhost:8001"
//!
//! [renter]
//! id = "<hex fingerprint>"
//! alias = "alice"
//! data_blocks = 8
//! parity_blocks = 4
//! ```

use anyhow::{Context, Result};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use skerry_core::{DEFAULT_DATA_BLOCKS, DEFAULT_PARITY_BLOCKS};
use std::fs;
use std::path::PathBuf;

/// CLI configuration, the structure of ~/.skerry/config.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CliConfig {
    #[serde(default)]
    pub metaserver: MetaserverConfig,

    #[serde(default)]
    pub renter: RenterSettings,
}

/// Metaserver connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaserverConfig {
    #[serde(default = "default_metaserver_url")]
    pub url: String,
}

impl Default for MetaserverConfig {
    fn default() -> Self {
        Self {
            url: default_metaserver_url(),
        }
    }
}

fn default_metaserver_url() -> String {
    std::env::var("SKERRY_METASERVER_URL").unwrap_or_else(|_| "http://localhost:8001".to_string())
}

/// Renter identity and coding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenterSettings {
    /// Assigned on registration: the public key fingerprint.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub alias: Option<String>,

    #[serde(default = "default_data_blocks")]
    pub data_blocks: usize,

    #[serde(default = "default_parity_blocks")]
    pub parity_blocks: usize,
}

impl Default for RenterSettings {
    fn default() -> Self {
        Self {
            id: None,
            alias: None,
            data_blocks: default_data_blocks(),
            parity_blocks: default_parity_blocks(),
        }
    }
}

fn default_data_blocks() -> usize {
    DEFAULT_DATA_BLOCKS
}

fn default_parity_blocks() -> usize {
    DEFAULT_PARITY_BLOCKS
}

/// Get the config directory path (~/.skerry/), creating it if needed.
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    let dir = home.join(".skerry");
    if !dir.exists() {
        fs::create_dir_all(&dir).context("failed to create config directory ~/.skerry/")?;
    }
    Ok(dir)
}

pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn key_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("renter_key.pem"))
}

/// Load configuration, falling back to defaults if no file exists.
pub fn load_config() -> Result<CliConfig> {
    let path = config_file_path()?;
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let content = fs::read_to_string(&path).context("failed to read config file")?;
    toml::from_str(&content).context("failed to parse config file")
}

pub fn save_config(config: &CliConfig) -> Result<()> {
    let path = config_file_path()?;
    let content = toml::to_string_pretty(config).context("failed to serialize config")?;
    fs::write(&path, content).context("failed to write config file")?;
    Ok(())
}

/// Persist the renter's private key with owner-only permissions.
pub fn save_private_key(key: &RsaPrivateKey) -> Result<()> {
    let path = key_file_path()?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .context("failed to encode private key")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::write(&path, pem.as_bytes())?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }

    #[cfg(not(unix))]
    {
        fs::write(&path, pem.as_bytes())?;
    }

    Ok(())
}

pub fn load_private_key() -> Result<RsaPrivateKey> {
    let path = key_file_path()?;
    let pem = fs::read_to_string(&path)
        .with_context(|| format!("no renter key at {}; run `skerry register` first", path.display()))?;
    RsaPrivateKey::from_pkcs8_pem(&pem).context("failed to parse renter key")
}
