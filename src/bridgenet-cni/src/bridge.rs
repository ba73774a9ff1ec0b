//! Bridge management
//!
//! The bridge carries the subnet gateway address and every host-side veth.

use ipnet::Ipv4Net;
use rtnetlink::Handle;
use tracing::info;

use crate::error::{CniError, CniErrorCode};
use crate::netlink::{self, NetlinkSession};

/// Create the bridge if it doesn't exist and make sure it carries the gateway
///
/// Returns the bridge interface index.
pub fn ensure_bridge(bridge_name: &str, mtu: u32, gateway: Ipv4Net) -> Result<u32, CniError> {
    let session = NetlinkSession::open()?;
    session.block_on(ensure_bridge_async(session.handle(), bridge_name, mtu, gateway))
}

async fn ensure_bridge_async(
    handle: &Handle,
    bridge_name: &str,
    mtu: u32,
    gateway: Ipv4Net,
) -> Result<u32, CniError> {
    let index = match netlink::link_index(handle, bridge_name).await? {
        Some(index) => index,
        None => {
            info!(bridge = bridge_name, "creating bridge");
            create_bridge(handle, bridge_name).await?;
            netlink::link_index(handle, bridge_name)
                .await?
                .ok_or_else(|| CniError::bridge_error("bridge was created but not found"))?
        }
    };

    netlink::set_mtu(handle, index, mtu, CniErrorCode::BridgeCreationFailed).await?;
    netlink::ensure_address(
        handle,
        index,
        gateway.addr(),
        gateway.prefix_len(),
        CniErrorCode::BridgeCreationFailed,
    )
    .await?;
    netlink::set_link_up(handle, index, CniErrorCode::BridgeCreationFailed).await?;

    info!(bridge = bridge_name, index, %gateway, "bridge ready");
    Ok(index)
}

async fn create_bridge(handle: &Handle, name: &str) -> Result<(), CniError> {
    match handle.link().add().bridge(name.to_string()).execute().await {
        Ok(()) => Ok(()),
        // Another plugin process won the race
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => Ok(()),
        Err(e) => Err(CniError::bridge_error(&format!("failed to create bridge {}", name))
            .with_details(&e.to_string())),
    }
}

/// Enslave a link to the bridge and bring it up
pub async fn attach_to_bridge(handle: &Handle, bridge_index: u32, index: u32) -> Result<(), CniError> {
    handle
        .link()
        .set(index)
        .controller(bridge_index)
        .execute()
        .await
        .map_err(|e| {
            CniError::veth_error("failed to attach veth to bridge").with_details(&e.to_string())
        })?;

    netlink::set_link_up(handle, index, CniErrorCode::VethCreationFailed).await
}
