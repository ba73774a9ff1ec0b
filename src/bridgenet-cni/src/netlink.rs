//! rtnetlink session and shared link/address helpers
//!
//! A session pins a single-threaded tokio runtime to the calling thread, so a
//! session opened inside a [`NetnsGuard`](crate::netns::NetnsGuard) talks to
//! that namespace.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::LinkAttribute;
use rtnetlink::{new_connection, Handle};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::error::{CniError, CniErrorCode};

pub struct NetlinkSession {
    rt: Runtime,
    handle: Handle,
}

impl NetlinkSession {
    pub fn open() -> Result<Self, CniError> {
        let rt = Builder::new_current_thread().enable_all().build().map_err(|e| {
            CniError::io_error("failed to create tokio runtime").with_details(&e.to_string())
        })?;

        let handle = rt.block_on(async {
            let (connection, handle, _) = new_connection().map_err(|e| {
                CniError::io_error("failed to create netlink connection")
                    .with_details(&e.to_string())
            })?;
            tokio::spawn(connection);
            Ok::<_, CniError>(handle)
        })?;

        Ok(Self { rt, handle })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.rt.block_on(f)
    }
}

/// Get the index of a network link by name
pub async fn link_index(handle: &Handle, name: &str) -> Result<Option<u32>, CniError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();

    match links.try_next().await {
        Ok(Some(link)) => Ok(Some(link.header.index)),
        Ok(None) => Ok(None),
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => Ok(None),
        Err(e) => Err(CniError::io_error(&format!("failed to get link {}", name))
            .with_details(&e.to_string())),
    }
}

/// MAC address of a link, formatted as `aa:bb:cc:dd:ee:ff`
pub async fn link_mac(handle: &Handle, index: u32) -> Result<Option<String>, CniError> {
    let mut links = handle.link().get().match_index(index).execute();

    let link = links.try_next().await.map_err(|e| {
        CniError::io_error(&format!("failed to get link {}", index)).with_details(&e.to_string())
    })?;

    Ok(link.and_then(|link| {
        link.attributes.into_iter().find_map(|attr| match attr {
            LinkAttribute::Address(bytes) => Some(format_mac(&bytes)),
            _ => None,
        })
    }))
}

pub fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

pub async fn set_link_up(handle: &Handle, index: u32, code: CniErrorCode) -> Result<(), CniError> {
    handle.link().set(index).up().execute().await.map_err(|e| {
        CniError::new(code, &format!("failed to bring link {} up", index))
            .with_details(&e.to_string())
    })
}

pub async fn set_mtu(handle: &Handle, index: u32, mtu: u32, code: CniErrorCode) -> Result<(), CniError> {
    handle
        .link()
        .set(index)
        .mtu(mtu)
        .execute()
        .await
        .map_err(|e| CniError::new(code, "failed to set MTU").with_details(&e.to_string()))
}

/// IPv4 addresses configured on a link
pub async fn link_addresses(handle: &Handle, index: u32) -> Result<Vec<Ipv4Addr>, CniError> {
    let mut found = Vec::new();
    let mut addresses = handle.address().get().set_link_index_filter(index).execute();

    while let Some(msg) = addresses.try_next().await.map_err(|e| {
        CniError::io_error("failed to get addresses").with_details(&e.to_string())
    })? {
        for attr in msg.attributes {
            if let AddressAttribute::Address(IpAddr::V4(ip)) = attr {
                found.push(ip);
            }
        }
    }

    Ok(found)
}

/// Add an address unless the link already carries it
pub async fn ensure_address(
    handle: &Handle,
    index: u32,
    ip: Ipv4Addr,
    prefix_len: u8,
    code: CniErrorCode,
) -> Result<(), CniError> {
    if link_addresses(handle, index).await?.contains(&ip) {
        debug!(%ip, prefix_len, index, "address already present");
        return Ok(());
    }

    match handle
        .address()
        .add(index, IpAddr::V4(ip), prefix_len)
        .execute()
        .await
    {
        Ok(()) => Ok(()),
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => Ok(()),
        Err(e) => Err(CniError::new(
            code,
            &format!("failed to add address {}/{} to link {}", ip, prefix_len, index),
        )
        .with_details(&e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac(&[0x02, 0x42, 0xac, 0x11, 0x00, 0x02]), "02:42:ac:11:00:02");
        assert_eq!(format_mac(&[]), "");
    }
}
