//! Veth pair management
//!
//! The pair is created in the host namespace with a temporary peer name, the
//! peer is moved into the container and renamed there. Creating it directly
//! under the requested name (usually "eth0") would collide with host links.

use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;

use ipnet::Ipv4Net;
use rtnetlink::Handle;
use tracing::{info, warn};

use crate::bridge;
use crate::error::{CniError, CniErrorCode};
use crate::netlink::{self, NetlinkSession};
use crate::netns;

/// Maximum length for interface names (Linux limit is 15 + null terminator)
const MAX_IFNAME_LEN: usize = 15;

/// Prefix for host-side veth names
const HOST_VETH_PREFIX: &str = "bn-";

/// Prefix for the container-side veth before it is renamed
const PEER_VETH_PREFIX: &str = "bnp-";

/// What the container side should look like
#[derive(Debug, Clone)]
pub struct VethRequest<'a> {
    pub container_id: &'a str,
    pub netns: &'a str,
    pub ifname: &'a str,
    pub mtu: u32,
    pub address: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub bridge_index: u32,
}

/// Result of veth pair setup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    pub host_ifname: String,
    pub container_ifname: String,
    /// MAC address of the container interface
    pub mac_address: String,
}

/// Create the pair, wire the host side into the bridge and configure the
/// container side with its address and default route
pub fn setup_veth(req: &VethRequest<'_>) -> Result<VethPair, CniError> {
    let host_ifname = generate_ifname(HOST_VETH_PREFIX, req.container_id);
    let peer_ifname = generate_ifname(PEER_VETH_PREFIX, req.container_id);

    let session = NetlinkSession::open()?;
    session.block_on(create_host_side(
        session.handle(),
        req,
        &host_ifname,
        &peer_ifname,
    ))?;
    drop(session);

    let mac_address = netns::with_netns(req.netns, || {
        let session = NetlinkSession::open()?;
        session.block_on(configure_container_side(session.handle(), req, &peer_ifname))
    })?;

    info!(
        host = %host_ifname,
        container = req.ifname,
        address = %req.address,
        "veth pair configured"
    );

    Ok(VethPair {
        host_ifname,
        container_ifname: req.ifname.to_string(),
        mac_address,
    })
}

async fn create_host_side(
    handle: &Handle,
    req: &VethRequest<'_>,
    host_ifname: &str,
    peer_ifname: &str,
) -> Result<(), CniError> {
    // A repeated ADD finds the host side already in place
    if let Some(index) = netlink::link_index(handle, host_ifname).await? {
        info!(host = host_ifname, index, "veth already exists, reusing");
        return bridge::attach_to_bridge(handle, req.bridge_index, index).await;
    }

    match handle
        .link()
        .add()
        .veth(host_ifname.to_string(), peer_ifname.to_string())
        .execute()
        .await
    {
        Ok(()) => {}
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {
            warn!(host = host_ifname, "veth created by another process, reusing");
        }
        Err(e) => {
            return Err(CniError::veth_error("failed to create veth pair").with_details(&e.to_string()))
        }
    }

    let host_index = netlink::link_index(handle, host_ifname)
        .await?
        .ok_or_else(|| CniError::veth_error("veth was created but host side not found"))?;
    let peer_index = netlink::link_index(handle, peer_ifname)
        .await?
        .ok_or_else(|| CniError::veth_error("veth was created but container side not found"))?;

    netlink::set_mtu(handle, host_index, req.mtu, CniErrorCode::VethCreationFailed).await?;
    netlink::set_mtu(handle, peer_index, req.mtu, CniErrorCode::VethCreationFailed).await?;

    let netns_file = netns::open_netns(req.netns)?;
    handle
        .link()
        .set(peer_index)
        .setns_by_fd(netns_file.as_raw_fd())
        .execute()
        .await
        .map_err(|e| {
            CniError::veth_error("failed to move veth to container namespace")
                .with_details(&e.to_string())
        })?;

    bridge::attach_to_bridge(handle, req.bridge_index, host_index).await
}

/// Runs inside the container namespace; returns the interface MAC
async fn configure_container_side(
    handle: &Handle,
    req: &VethRequest<'_>,
    peer_ifname: &str,
) -> Result<String, CniError> {
    let index = match netlink::link_index(handle, req.ifname).await? {
        Some(index) => index,
        None => {
            let index = netlink::link_index(handle, peer_ifname).await?.ok_or_else(|| {
                CniError::veth_error(&format!("interface {} not found in container", peer_ifname))
            })?;
            handle
                .link()
                .set(index)
                .name(req.ifname.to_string())
                .execute()
                .await
                .map_err(|e| {
                    CniError::veth_error(&format!("failed to rename {} to {}", peer_ifname, req.ifname))
                        .with_details(&e.to_string())
                })?;
            index
        }
    };

    if let Some(lo_index) = netlink::link_index(handle, "lo").await? {
        if let Err(e) = netlink::set_link_up(handle, lo_index, CniErrorCode::VethCreationFailed).await {
            warn!(error = %e, "failed to bring loopback up");
        }
    }

    netlink::ensure_address(
        handle,
        index,
        req.address.addr(),
        req.address.prefix_len(),
        CniErrorCode::VethCreationFailed,
    )
    .await?;
    netlink::set_link_up(handle, index, CniErrorCode::VethCreationFailed).await?;

    match handle
        .route()
        .add()
        .v4()
        .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
        .gateway(req.gateway)
        .execute()
        .await
    {
        Ok(()) => {}
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {}
        Err(e) => {
            return Err(
                CniError::route_error(&format!("failed to add default route via {}", req.gateway))
                    .with_details(&e.to_string()),
            )
        }
    }

    Ok(netlink::link_mac(handle, index).await?.unwrap_or_default())
}

/// Delete the container interface; the kernel removes the host peer with it
///
/// A missing namespace or interface counts as already deleted.
pub fn teardown_veth(netns_path: &str, ifname: &str) -> Result<(), CniError> {
    if !netns::netns_exists(netns_path) {
        info!(netns = netns_path, "namespace gone, nothing to tear down");
        return Ok(());
    }

    netns::with_netns(netns_path, || {
        let session = NetlinkSession::open()?;
        session.block_on(async {
            let handle = session.handle();
            match netlink::link_index(handle, ifname).await? {
                Some(index) => {
                    handle.link().del(index).execute().await.map_err(|e| {
                        CniError::veth_error(&format!("failed to delete {}", ifname))
                            .with_details(&e.to_string())
                    })?;
                    info!(ifname, "deleted container interface");
                }
                None => info!(ifname, "interface already deleted or never existed"),
            }
            Ok::<(), CniError>(())
        })
    })
}

/// Fail unless `ifname` in the namespace carries `ip`
pub fn verify_veth(netns_path: &str, ifname: &str, ip: Ipv4Addr) -> Result<(), CniError> {
    netns::with_netns(netns_path, || {
        let session = NetlinkSession::open()?;
        session.block_on(async {
            let handle = session.handle();
            let index = netlink::link_index(handle, ifname).await?.ok_or_else(|| {
                CniError::veth_error(&format!("interface {} not found in container", ifname))
            })?;

            if netlink::link_addresses(handle, index).await?.contains(&ip) {
                Ok(())
            } else {
                Err(CniError::new(
                    CniErrorCode::IpamFailure,
                    &format!("failed to find ip {} on {}", ip, ifname),
                ))
            }
        })
    })
}

/// Derive an interface name from the hex characters of the container ID
pub fn generate_ifname(prefix: &str, container_id: &str) -> String {
    let id_part: String = container_id
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(MAX_IFNAME_LEN - prefix.len())
        .collect();

    format!("{}{}", prefix, id_part)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_host_ifname() {
        let name = generate_ifname(HOST_VETH_PREFIX, "abc123def456");
        assert_eq!(name, "bn-abc123def456");

        let name = generate_ifname(HOST_VETH_PREFIX, "0123456789abcdef0123456789abcdef");
        assert_eq!(name.len(), MAX_IFNAME_LEN);
        assert_eq!(name, "bn-0123456789ab");

        // Only hex chars survive: c, a, e, 1, 2, 3
        let name = generate_ifname(HOST_VETH_PREFIX, "container-xyz-123");
        assert_eq!(name, "bn-cae123");
    }

    #[test]
    fn test_peer_name_fits_limit() {
        let name = generate_ifname(PEER_VETH_PREFIX, "0123456789abcdef0123456789abcdef");
        assert_eq!(name.len(), MAX_IFNAME_LEN);
        assert!(name.starts_with(PEER_VETH_PREFIX));
        assert_ne!(name, generate_ifname(HOST_VETH_PREFIX, "0123456789abcdef0123456789abcdef"));
    }
}
