//! CLI configuration management
//!
//! Default socket settings and timeouts live in ~/.localpipe/config.json.
//! Command-line flags override whatever the file sets.

use anyhow::{Context, Result};
use localpipe_connection::{IpPreference, SocketSettings, DEFAULT_CONNECT_TIMEOUT};
use localpipe_server_tcp::AcceptorConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Defaults for generated relay socket paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayDefaults {
    /// Directory for generated socket paths; the system temp dir when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    pub prefix: String,
    pub suffix: String,
}

impl Default for RelayDefaults {
    fn default() -> Self {
        Self {
            temp_dir: None,
            prefix: "localpipe-".to_string(),
            suffix: ".sock".to_string(),
        }
    }
}

/// Global CLI configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalpipeConfig {
    /// Outbound connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    pub ip_preference: IpPreference,

    /// Options applied to outbound sockets
    pub socket: SocketSettings,

    pub acceptor: AcceptorConfig,

    pub relay: RelayDefaults,
}

impl Default for LocalpipeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            ip_preference: IpPreference::default(),
            socket: SocketSettings::default(),
            acceptor: AcceptorConfig::default(),
            relay: RelayDefaults::default(),
        }
    }
}

impl LocalpipeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Configuration manager
pub struct ConfigManager;

impl ConfigManager {
    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".localpipe").join("config.json"))
    }

    /// Load the configuration from `path`, or from the default location
    pub fn load(path: Option<&Path>) -> Result<LocalpipeConfig> {
        match path {
            Some(path) => Self::load_from(path),
            None => Self::load_from(&Self::default_path()?),
        }
    }

    /// Load the configuration from a specific file
    pub fn load_from(path: &Path) -> Result<LocalpipeConfig> {
        // Return default config if file doesn't exist
        if !path.exists() {
            return Ok(LocalpipeConfig::default());
        }

        let json =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        let config: LocalpipeConfig = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Write the default configuration to `path`, refusing to replace an
    /// existing file unless `force` is set
    pub fn init(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            anyhow::bail!(
                "Config file already exists: {:?} (use --force to overwrite)",
                path
            );
        }
        Self::save_to(path, &LocalpipeConfig::default())
    }

    /// Save the configuration to a specific file
    pub fn save_to(path: &Path, config: &LocalpipeConfig) -> Result<()> {
        // Ensure directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(path, json).context(format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }
}
