//! Configuration resolution for devauth.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. JSON config file (`--config`)
//! 3. Environment variables (`DEVAUTH_*`)
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete devauth configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Token agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Path to the PEM-encoded PKCS#1 RSA private key used for signing.
    pub private_key_path: PathBuf,
    /// Token lifetime in seconds. Negative values issue already-expired tokens.
    pub expiration_timeout_secs: i64,
    /// Value of the `iss` claim.
    pub issuer: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            private_key_path: PathBuf::from("/etc/devauth/rsa/private.pem"),
            expiration_timeout_secs: 7 * 24 * 60 * 60, // 7 days
            issuer: "devauth".to_string(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one `SQLite` file per tenant.
    pub data_dir: Option<PathBuf>,
    /// Run pending data migrations when a tenant database is first opened.
    pub automigrate: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            automigrate: true,
        }
    }
}

impl StorageConfig {
    /// Configured data directory, falling back to `~/.devauth`.
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir()
                .ok_or_else(|| Error::Config("Cannot determine home directory".to_string())),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution from the process
/// environment.
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    load_config_with_env(config_path, |key| std::env::var(key).ok())
}

/// Load configuration, reading environment overrides through `env`.
pub fn load_config_with_env<F>(config_path: Option<&Path>, env: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match config_path {
        Some(path) => load_config_file(path)?,
        None => Config::default(),
    };

    apply_env_overrides(&mut config, env)?;

    Ok(config)
}

/// Default data directory (`~/.devauth`).
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".devauth"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides<F>(config: &mut Config, env: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = env("DEVAUTH_PRIVATE_KEY_PATH") {
        config.token.private_key_path = PathBuf::from(val);
    }
    if let Some(val) = env("DEVAUTH_JWT_EXPIRATION_TIMEOUT") {
        config.token.expiration_timeout_secs = val.parse().map_err(|_| {
            Error::Config(format!("DEVAUTH_JWT_EXPIRATION_TIMEOUT is not an integer: {val}"))
        })?;
    }
    if let Some(val) = env("DEVAUTH_JWT_ISSUER") {
        config.token.issuer = val;
    }
    if let Some(val) = env("DEVAUTH_DATA_DIR") {
        config.storage.data_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = env("DEVAUTH_AUTOMIGRATE") {
        config.storage.automigrate = matches!(val.as_str(), "1" | "true" | "yes");
    }
    if let Some(val) = env("DEVAUTH_LOG_LEVEL") {
        config.log.level = val;
    }
    Ok(())
}
