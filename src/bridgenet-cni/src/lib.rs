//! Bridgenet CNI plugin
//!
//! Attaches containers to a host bridge and hands out IPv4 addresses from
//! a per-network store shared by every plugin process on the node.
//! Implements CNI Spec 1.0.0.

pub mod bridge;
pub mod cmd;
pub mod config;
pub mod error;
pub mod ipam;
pub mod logging;
pub mod netlink;
pub mod netns;
pub mod plumbing;
pub mod result;
pub mod store;
pub mod veth;

pub use error::{CniError, CniErrorCode, IpamError};
pub use ipam::Ipam;
pub use store::{AllocationStore, FileStore, MemoryStore};
