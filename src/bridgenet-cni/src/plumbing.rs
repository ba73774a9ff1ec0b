//! Kernel plumbing seen from the command handlers
//!
//! The handlers only talk to [`NetworkPlumbing`], so they can run against a
//! fake in tests; [`KernelPlumbing`] is the rtnetlink implementation.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::bridge;
use crate::error::CniError;
use crate::veth::{self, VethPair, VethRequest};

pub trait NetworkPlumbing {
    /// Make sure the bridge exists, is up, and carries `gateway`; returns its index
    fn ensure_bridge(&self, name: &str, mtu: u32, gateway: Ipv4Net) -> Result<u32, CniError>;

    fn setup_veth(&self, req: &VethRequest<'_>) -> Result<VethPair, CniError>;

    /// Remove the container interface; already gone is success
    fn teardown_veth(&self, netns: &str, ifname: &str) -> Result<(), CniError>;

    /// Fail unless the container interface carries `ip`
    fn verify_veth(&self, netns: &str, ifname: &str, ip: Ipv4Addr) -> Result<(), CniError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KernelPlumbing;

impl NetworkPlumbing for KernelPlumbing {
    fn ensure_bridge(&self, name: &str, mtu: u32, gateway: Ipv4Net) -> Result<u32, CniError> {
        bridge::ensure_bridge(name, mtu, gateway)
    }

    fn setup_veth(&self, req: &VethRequest<'_>) -> Result<VethPair, CniError> {
        veth::setup_veth(req)
    }

    fn teardown_veth(&self, netns: &str, ifname: &str) -> Result<(), CniError> {
        veth::teardown_veth(netns, ifname)
    }

    fn verify_veth(&self, netns: &str, ifname: &str, ip: Ipv4Addr) -> Result<(), CniError> {
        veth::verify_veth(netns, ifname, ip)
    }
}
