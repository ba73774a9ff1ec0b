//! Configuration management
//!
//! Handles loading configuration from files and environment variables.

use anyhow::{Context, Result};
use bridgenet_cni::config::DEFAULT_SUBNET_FILE;
use bridgenet_cni::store::DEFAULT_STORE_DIR;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Network name used when none is configured
const DEFAULT_NETWORK: &str = "bridgenet";

/// Configuration for bridgenetctl
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Allocation store location
    #[serde(default)]
    pub store: StoreConfig,

    /// Display settings
    #[serde(default)]
    pub display: DisplayConfig,
}

/// Where the plugin keeps its state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the lock file and one `<network>.json` per network
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Network name, as in the `name` field of the CNI config
    #[serde(default = "default_network")]
    pub network: String,

    #[serde(default = "default_subnet_file")]
    pub subnet_file: PathBuf,

    /// Subnet in CIDR notation, for nodes that pin it in the network config
    /// instead of using a subnet file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_DIR)
}

fn default_network() -> String {
    DEFAULT_NETWORK.to_string()
}

fn default_subnet_file() -> PathBuf {
    PathBuf::from(DEFAULT_SUBNET_FILE)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            network: default_network(),
            subnet_file: default_subnet_file(),
            subnet: None,
        }
    }
}

/// Display configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Enable colored output
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_color() -> bool {
    true
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            color: default_color(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (BRIDGENET_DATA_DIR, BRIDGENET_NETWORK, ...)
    /// 2. Configuration file (~/.config/bridgenet/config.toml)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };

        config.apply_overrides(|key| env::var(key).ok());

        Ok(config)
    }

    /// Load configuration from a file; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply overrides from a variable source (the process environment in `load`)
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("BRIDGENET_DATA_DIR") {
            self.store.data_dir = PathBuf::from(dir);
        }

        if let Some(network) = lookup("BRIDGENET_NETWORK") {
            self.store.network = network;
        }

        if let Some(path) = lookup("BRIDGENET_SUBNET_FILE") {
            self.store.subnet_file = PathBuf::from(path);
        }

        if let Some(subnet) = lookup("BRIDGENET_SUBNET").filter(|s| !s.is_empty()) {
            self.store.subnet = Some(subnet);
        }

        // NO_COLOR standard takes precedence (https://no-color.org/)
        if lookup("NO_COLOR").is_some() {
            self.display.color = false;
        } else if let Some(color) = lookup("BRIDGENET_COLOR") {
            self.display.color = color != "0" && color.to_lowercase() != "false";
        }
    }

    /// Get the configuration file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("bridgenet").join("config.toml"))
    }

    /// Check if color output is enabled
    pub fn color_enabled(&self) -> bool {
        self.display.color
    }
}
