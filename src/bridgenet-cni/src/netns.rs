//! Network Namespace operations
//!
//! `setns` switches only the calling thread, so everything that must run in the
//! container namespace (including netlink socket creation) happens on the
//! thread that holds the guard.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::sched::{setns, CloneFlags};
use tracing::warn;

use crate::error::CniError;

/// Guard that saves the current network namespace and restores it on drop
pub struct NetnsGuard {
    /// `None` once restored explicitly
    original_ns: Option<File>,
}

impl NetnsGuard {
    /// Enter the namespace at `netns_path` (e.g. "/var/run/netns/ctr")
    pub fn enter(netns_path: &str) -> Result<Self, CniError> {
        let original_ns = File::open("/proc/self/ns/net").map_err(|e| {
            CniError::namespace_error("failed to open current network namespace")
                .with_details(&e.to_string())
        })?;

        let target_ns = open_netns(netns_path)?;

        setns(target_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
            CniError::namespace_error(&format!("failed to enter network namespace {}", netns_path))
                .with_details(&e.to_string())
        })?;

        Ok(Self {
            original_ns: Some(original_ns),
        })
    }

    /// Restore the original namespace, reporting failure instead of ignoring it
    pub fn restore(mut self) -> Result<(), CniError> {
        match self.original_ns.take() {
            Some(ns) => setns(ns.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
                CniError::namespace_error("failed to restore original network namespace")
                    .with_details(&e.to_string())
            }),
            None => Ok(()),
        }
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Some(ns) = &self.original_ns {
            if let Err(e) = setns(ns.as_raw_fd(), CloneFlags::CLONE_NEWNET) {
                warn!(error = %e, "failed to restore original network namespace");
            }
        }
    }
}

/// Execute a closure within a different network namespace
pub fn with_netns<T, F>(netns_path: &str, f: F) -> Result<T, CniError>
where
    F: FnOnce() -> Result<T, CniError>,
{
    let guard = NetnsGuard::enter(netns_path)?;
    let result = f();
    guard.restore()?;
    result
}

pub fn open_netns(netns_path: &str) -> Result<File, CniError> {
    File::open(netns_path).map_err(|e| {
        CniError::namespace_error(&format!("failed to open network namespace: {}", netns_path))
            .with_details(&e.to_string())
    })
}

/// Whether a namespace path is usable; DEL may arrive after the namespace is gone
pub fn netns_exists(netns_path: &str) -> bool {
    !netns_path.is_empty() && Path::new(netns_path).exists()
}
