//! Check command implementation
//!
//! Prints the address a container holds. Works without a known subnet; the
//! prefix is only shown when one is configured.

use anyhow::{anyhow, Result};
use bridgenet_cni::store::{with_lock, AllocationStore};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

use crate::cli::ContainerArgs;
use crate::config::Config;

pub fn run(config: &Config, args: ContainerArgs) -> Result<()> {
    let subnet = super::configured_subnet(config).ok().flatten();
    let mut store = super::open_store(config)?;

    let ip = lookup(&mut store, &args.container_id)?;
    println!("{}", format_address(ip, subnet.as_deref()));
    Ok(())
}

fn lookup<S: AllocationStore>(store: &mut S, container_id: &str) -> Result<Ipv4Addr> {
    with_lock(store, |s| Ok(s.find_by_container(container_id)))?
        .ok_or_else(|| anyhow!("no address allocated to container {}", container_id))
}

/// `ip/prefix` when the subnet is known, the bare address otherwise
fn format_address(ip: Ipv4Addr, subnet: Option<&str>) -> String {
    match subnet.and_then(|s| s.trim().parse::<Ipv4Net>().ok()) {
        Some(net) => format!("{}/{}", ip, net.prefix_len()),
        None => ip.to_string(),
    }
}
