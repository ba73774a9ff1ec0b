//! CNI Network Configuration parsing
//!
//! The network configuration arrives on stdin. The subnet and bridge for this
//! node normally come from a small subnet file maintained by the node daemon
//! (or `bridgenetctl subnet set`), but either can be pinned in the network
//! configuration instead.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CniError, CniErrorCode};
use crate::store::DEFAULT_STORE_DIR;

/// Default location of the node subnet file
pub const DEFAULT_SUBNET_FILE: &str = "/var/lib/bridgenet/subnets.json";

/// Default bridge name
pub const DEFAULT_BRIDGE_NAME: &str = "bridgenet0";

/// Default MTU for bridge and veth interfaces
pub const DEFAULT_MTU: u32 = 1500;

/// Network configuration passed to the CNI plugin
///
/// See: https://github.com/containernetworking/cni/blob/spec-v1.0.0/SPEC.md#network-configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// CNI specification version
    pub cni_version: String,

    /// Network name (must be unique on the host); also names the allocation store
    pub name: String,

    /// CNI plugin type (matches binary name)
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// Previous result from chain (for CHECK/DEL)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<serde_json::Value>,

    // Bridgenet-specific configuration

    /// Bridge name, overriding the subnet file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,

    /// MTU for the interface
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    /// Root directory for allocation stores
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Subnet in CIDR notation, overriding the subnet file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,

    /// Alternative location of the subnet file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet_file: Option<PathBuf>,

    /// IPAM configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamConfig>,
}

/// IPAM section of the network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConfig {
    /// IPAM plugin type; informational, allocation is always built in
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub plugin_type: Option<String>,

    /// Subnet in CIDR notation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,

    /// Root directory for allocation stores
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

/// Per-node subnet assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetConfig {
    /// Subnet in CIDR notation, e.g. "10.244.1.0/24"
    pub subnet: String,

    /// Bridge interface name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bridge: String,
}

impl SubnetConfig {
    pub fn load(path: &Path) -> Result<Self, CniError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            CniError::io_error(&format!("failed to read subnet file {}", path.display()))
                .with_details(&e.to_string())
        })?;

        serde_json::from_str(&raw).map_err(|e| {
            CniError::decode_error(&format!("failed to parse subnet file {}", path.display()))
                .with_details(&e.to_string())
        })
    }

    /// Write the subnet file, creating its directory if needed
    pub fn store(&self, path: &Path) -> Result<(), CniError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CniError::io_error(&format!("failed to create {}", parent.display()))
                    .with_details(&e.to_string())
            })?;
        }

        let json = serde_json::to_string(self).map_err(|e| {
            CniError::io_error("failed to serialize subnet file").with_details(&e.to_string())
        })?;

        fs::write(path, json).map_err(|e| {
            CniError::io_error(&format!("failed to write subnet file {}", path.display()))
                .with_details(&e.to_string())
        })
    }
}

/// Everything a command needs, with defaults and the subnet file applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub cni_version: String,
    pub network: String,
    pub subnet: String,
    pub bridge: String,
    pub mtu: u32,
    pub data_dir: PathBuf,
}

impl NetworkConfig {
    pub fn parse(input: &str) -> Result<Self, CniError> {
        let config: NetworkConfig = serde_json::from_str(input).map_err(|e| {
            CniError::new(CniErrorCode::DecodingFailure, "failed to parse network config")
                .with_details(&e.to_string())
        })?;

        if config.name.trim().is_empty() {
            return Err(CniError::config_error("network name must not be empty"));
        }
        // The name becomes a directory under the data dir
        if config.name.contains('/') || config.name == "." || config.name == ".." {
            return Err(CniError::config_error(&format!(
                "invalid network name: {}",
                config.name
            )));
        }

        Ok(config)
    }

    /// Get the MTU value for network interfaces
    pub fn mtu_value(&self) -> u32 {
        self.mtu.unwrap_or(DEFAULT_MTU)
    }

    pub fn subnet_file_path(&self) -> &Path {
        self.subnet_file
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_SUBNET_FILE))
    }

    /// Storage root: `ipam.dataDir`, then `dataDir`, then the default
    pub fn data_dir_path(&self) -> PathBuf {
        self.ipam
            .as_ref()
            .and_then(|ipam| ipam.data_dir.clone())
            .or_else(|| self.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR))
    }

    fn pinned_subnet(&self) -> Option<&str> {
        self.ipam
            .as_ref()
            .and_then(|ipam| ipam.subnet.as_deref())
            .or(self.subnet.as_deref())
    }

    /// Fill in subnet, bridge and storage settings
    ///
    /// The subnet file is only read when the subnet or bridge is not pinned
    /// in the network configuration.
    pub fn resolve(&self) -> Result<ResolvedConfig, CniError> {
        let path = self.subnet_file_path();
        let file = match (self.pinned_subnet(), self.bridge.as_deref()) {
            (Some(_), Some(_)) => None,
            // Only needed for the bridge name; a missing file means the default
            (Some(_), None) if !path.exists() => None,
            _ => Some(SubnetConfig::load(path)?),
        };

        let subnet = match self.pinned_subnet() {
            Some(subnet) => subnet.to_string(),
            None => file
                .as_ref()
                .map(|f| f.subnet.clone())
                .ok_or_else(|| CniError::config_error("no subnet configured"))?,
        };

        let bridge = self
            .bridge
            .clone()
            .or_else(|| {
                file.as_ref()
                    .map(|f| f.bridge.clone())
                    .filter(|b| !b.is_empty())
            })
            .unwrap_or_else(|| DEFAULT_BRIDGE_NAME.to_string());

        Ok(ResolvedConfig {
            cni_version: self.cni_version.clone(),
            network: self.name.clone(),
            subnet,
            bridge,
            mtu: self.mtu_value(),
            data_dir: self.data_dir_path(),
        })
    }
}
