//! Command implementations
//!
//! This module contains the implementation of all CLI commands.

pub mod check;
pub mod release;
pub mod status;
pub mod subnet;

use anyhow::{Context, Result};
use bridgenet_cni::config::SubnetConfig;
use bridgenet_cni::{FileStore, Ipam};

use crate::config::Config;

/// Subnet for the configured network: `[store] subnet` first, then the subnet file
///
/// `None` when neither is present, as on nodes that pin the subnet in the
/// network config only.
fn configured_subnet(config: &Config) -> Result<Option<String>> {
    if let Some(subnet) = &config.store.subnet {
        return Ok(Some(subnet.clone()));
    }

    let path = &config.store.subnet_file;
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(SubnetConfig::load(path)?.subnet))
}

/// Open the allocation store of the configured network
fn open_store(config: &Config) -> Result<FileStore> {
    FileStore::open(&config.store.data_dir, &config.store.network)
        .with_context(|| format!("Failed to open store in {}", config.store.data_dir.display()))
}

/// Open the allocator for the configured network; needs a known subnet
fn open_ipam(config: &Config) -> Result<Ipam<FileStore>> {
    let subnet = configured_subnet(config)?.with_context(|| {
        format!(
            "No subnet configured: set [store] subnet or BRIDGENET_SUBNET, or write {}",
            config.store.subnet_file.display()
        )
    })?;

    Ipam::new(&subnet, open_store(config)?)
        .with_context(|| format!("Invalid subnet {}", subnet))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_subnet_precedence() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.store.subnet_file = tmp.path().join("subnets.json");

        assert_eq!(configured_subnet(&config).unwrap(), None);

        SubnetConfig {
            subnet: "10.244.1.0/24".to_string(),
            bridge: String::new(),
        }
        .store(&config.store.subnet_file)
        .unwrap();
        assert_eq!(configured_subnet(&config).unwrap().as_deref(), Some("10.244.1.0/24"));

        config.store.subnet = Some("10.50.0.0/16".to_string());
        assert_eq!(configured_subnet(&config).unwrap().as_deref(), Some("10.50.0.0/16"));
    }

    #[test]
    fn test_open_ipam_without_subnet() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.store.data_dir = tmp.path().to_path_buf();
        config.store.subnet_file = tmp.path().join("missing.json");

        let err = open_ipam(&config).err().unwrap();
        assert!(err.to_string().contains("No subnet configured"));
    }
}
