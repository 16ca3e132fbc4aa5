//! Node configuration for meshvault
//!
//! Configuration comes from a YAML file, from `MESHVAULT_*` environment
//! variables, or from CLI flags layered on top by the binary. The shared
//! secret is validated here: a wrong-length secret is a fatal startup
//! error, never a runtime surprise.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use meshvault_crypto::{Secret, SECRET_LEN};

/// Errors that can occur in configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid value for {name}: {value}")]
    InvalidEnvVar { name: String, value: String },

    #[error("shared secret must be {expected} bytes, got {actual}")]
    SecretLength { expected: usize, actual: usize },

    #[error("shared secret is not valid hex: {0}")]
    SecretFormat(#[from] hex::FromHexError),

    #[error("no shared secret configured; set secret_hex or secret_file")]
    SecretMissing,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Peers to dial at startup.
    #[serde(default)]
    pub bootstrap_peers: Vec<SocketAddr>,
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    /// The 32-byte shared secret as a hex string.
    #[serde(default)]
    pub secret_hex: Option<String>,
    /// A file holding the secret, either raw 32 bytes or hex text.
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
    /// How long a network fetch waits for the first responding peer.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:4000".parse().expect("static default address")
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("meshvault_data")
}

fn default_fetch_timeout_ms() -> u64 {
    4000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bootstrap_peers: Vec::new(),
            storage_root: default_storage_root(),
            secret_hex: None,
            secret_file: None,
            fetch_timeout_ms: default_fetch_timeout_ms(),
            log_level: default_log_level(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let contents = fs::read_to_string(path)?;
        let config: NodeConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from environment variables, starting from the
    /// defaults. `MESHVAULT_CONFIG_FILE` redirects to a YAML file when
    /// set and present.
    pub fn from_env() -> ConfigResult<Self> {
        if let Ok(config_path) = env::var("MESHVAULT_CONFIG_FILE") {
            let path = PathBuf::from(&config_path);
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        let mut config = Self::default();

        if let Ok(value) = env::var("MESHVAULT_LISTEN_ADDR") {
            config.listen_addr = parse_addr("MESHVAULT_LISTEN_ADDR", &value)?;
        }
        if let Ok(value) = env::var("MESHVAULT_PEERS") {
            config.bootstrap_peers = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_addr("MESHVAULT_PEERS", s))
                .collect::<ConfigResult<Vec<_>>>()?;
        }
        if let Ok(value) = env::var("MESHVAULT_DATA_DIR") {
            config.storage_root = PathBuf::from(value);
        }
        if let Ok(value) = env::var("MESHVAULT_SECRET") {
            config.secret_hex = Some(value);
        }
        if let Ok(value) = env::var("MESHVAULT_SECRET_FILE") {
            config.secret_file = Some(PathBuf::from(value));
        }
        if let Ok(value) = env::var("MESHVAULT_FETCH_TIMEOUT_MS") {
            config.fetch_timeout_ms =
                value
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnvVar {
                        name: "MESHVAULT_FETCH_TIMEOUT_MS".to_string(),
                        value,
                    })?;
        }
        if let Ok(value) = env::var("MESHVAULT_LOG_LEVEL") {
            config.log_level = value;
        }

        Ok(config)
    }

    /// Resolve and validate the shared secret. Exactly [`SECRET_LEN`]
    /// bytes or the node refuses to start.
    pub fn secret(&self) -> ConfigResult<Secret> {
        if let Some(hex_str) = &self.secret_hex {
            return secret_from_hex(hex_str);
        }
        if let Some(path) = &self.secret_file {
            let raw = fs::read(path)?;
            if raw.len() == SECRET_LEN {
                let mut key = [0u8; SECRET_LEN];
                key.copy_from_slice(&raw);
                return Ok(Secret::from(key));
            }
            let text = String::from_utf8_lossy(&raw);
            return secret_from_hex(text.trim());
        }
        Err(ConfigError::SecretMissing)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

fn parse_addr(name: &str, value: &str) -> ConfigResult<SocketAddr> {
    value.parse().map_err(|_| ConfigError::InvalidEnvVar {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn secret_from_hex(hex_str: &str) -> ConfigResult<Secret> {
    let bytes = hex::decode(hex_str.trim())?;
    if bytes.len() != SECRET_LEN {
        return Err(ConfigError::SecretLength {
            expected: SECRET_LEN,
            actual: bytes.len(),
        });
    }
    let mut key = [0u8; SECRET_LEN];
    key.copy_from_slice(&bytes);
    Ok(Secret::from(key))
}
