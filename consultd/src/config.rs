//! Service configuration.
//!
//! Loaded from TOML (`--config`, else `~/.consultd/config.toml` when it
//! exists, else built-in defaults). Every field has a default so partial
//! files are valid.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Directory under the home directory for PID/port files and data.
pub const HOME_DIR: &str = ".consultd";
const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP/WebSocket listening port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Outbound queue depth per connected endpoint.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Currency for wallets opened implicitly by a first recharge.
    #[serde(default = "default_currency")]
    pub default_currency: String,
    /// Caller identities allowed to post recharges and refunds and to read
    /// any wallet.
    #[serde(default = "default_gateway_ids")]
    pub gateway_ids: Vec<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_currency: default_currency(),
            gateway_ids: default_gateway_ids(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a consultant has to accept a pending session.
    #[serde(default = "default_accept_timeout_secs")]
    pub accept_timeout_secs: u64,
    /// Cap on the length of any one session.
    #[serde(default = "default_max_session_minutes")]
    pub max_session_minutes: u32,
    /// How long a disconnected participant may take to rejoin.
    #[serde(default = "default_reconnect_grace_secs")]
    pub reconnect_grace_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            accept_timeout_secs: default_accept_timeout_secs(),
            max_session_minutes: default_max_session_minutes(),
            reconnect_grace_secs: default_reconnect_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Length of one billing increment.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Keep billing while a participant is disconnected.
    /// When false, billing pauses until they rejoin.
    #[serde(default = "default_true")]
    pub bill_while_disconnected: bool,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            bill_while_disconnected: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Where journals live. Defaults to `~/.consultd/data`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Keep everything in memory; nothing survives a restart.
    #[serde(default)]
    pub in_memory: bool,
}

const fn default_port() -> u16 {
    58232
}

const fn default_channel_capacity() -> usize {
    256
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_gateway_ids() -> Vec<String> {
    vec!["gateway".to_string()]
}

const fn default_accept_timeout_secs() -> u64 {
    30
}

const fn default_max_session_minutes() -> u32 {
    60
}

const fn default_reconnect_grace_secs() -> u64 {
    30
}

const fn default_interval_secs() -> u64 {
    60
}

const fn default_true() -> bool {
    true
}

/// `~/.consultd`.
pub fn home_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(HOME_DIR))
}

impl Config {
    /// Load from an explicit path, the default location, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from(path);
        }
        let default_path = home_dir()?.join(CONFIG_FILE);
        if default_path.is_file() {
            Self::load_from(&default_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse a TOML config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(home_dir()?.join("data")),
        }
    }
}
