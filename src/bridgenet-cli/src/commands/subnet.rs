//! Subnet command implementation
//!
//! Reads and writes the node subnet file the plugin falls back to when the
//! network config carries no subnet.

use anyhow::{bail, Context, Result};
use bridgenet_cni::config::{SubnetConfig, DEFAULT_BRIDGE_NAME};
use colored::Colorize;
use ipnet::Ipv4Net;

use crate::cli::SubnetSetArgs;
use crate::config::Config;

/// Largest prefix that still leaves an address beside the gateway
const MAX_PREFIX_LEN: u8 = 30;

pub fn show(config: &Config) -> Result<()> {
    let path = &config.store.subnet_file;
    let subnet = SubnetConfig::load(path)?;

    let bridge = if subnet.bridge.is_empty() {
        format!("{} (default)", DEFAULT_BRIDGE_NAME)
    } else {
        subnet.bridge.clone()
    };

    if config.color_enabled() {
        println!("{}  {}", "Subnet:".bold(), subnet.subnet);
        println!("{}  {}", "Bridge:".bold(), bridge);
        println!("{}", path.display().to_string().dimmed());
    } else {
        println!("Subnet:  {}", subnet.subnet);
        println!("Bridge:  {}", bridge);
        println!("{}", path.display());
    }
    Ok(())
}

pub fn set(config: &Config, args: SubnetSetArgs) -> Result<()> {
    let subnet = build(&args.subnet, args.bridge)?;
    let path = &config.store.subnet_file;

    subnet.store(path)?;
    tracing::info!(subnet = %subnet.subnet, path = %path.display(), "subnet file written");

    println!("Wrote {} to {}", subnet.subnet, path.display());
    Ok(())
}

/// Validate the CIDR and normalize it to its network address
fn build(cidr: &str, bridge: Option<String>) -> Result<SubnetConfig> {
    let net: Ipv4Net = cidr
        .trim()
        .parse()
        .with_context(|| format!("Invalid subnet: {}", cidr))?;

    if net.prefix_len() > MAX_PREFIX_LEN {
        bail!(
            "Subnet {} is too small, the prefix must be /{} or shorter",
            net,
            MAX_PREFIX_LEN
        );
    }

    Ok(SubnetConfig {
        subnet: net.trunc().to_string(),
        bridge: bridge.unwrap_or_default(),
    })
}
