//! Release command implementation
//!
//! Frees an address by hand, for containers whose DEL never arrived. Only the
//! store is touched, so this works without a known subnet.

use anyhow::Result;
use bridgenet_cni::store::{with_lock, AllocationStore};
use colored::Colorize;
use std::net::Ipv4Addr;

use crate::cli::ContainerArgs;
use crate::config::Config;

pub fn run(config: &Config, args: ContainerArgs) -> Result<()> {
    let mut store = super::open_store(config)?;

    let message = match release(&mut store, &args.container_id)? {
        Some(ip) => format!("Released {} from {}", ip, args.container_id),
        None => format!("{} holds no address", args.container_id),
    };

    if config.color_enabled() {
        println!("{}", message.green());
    } else {
        println!("{}", message);
    }
    Ok(())
}

/// Returns the released address, or `None` if the container held none
fn release<S: AllocationStore>(store: &mut S, container_id: &str) -> Result<Option<Ipv4Addr>> {
    let freed = with_lock(store, |s| s.remove_by_container(container_id))?;
    if let Some(ip) = freed {
        tracing::info!(container_id, %ip, "released address");
    }
    Ok(freed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridgenet_cni::{FileStore, MemoryStore};

    #[test]
    fn test_release() {
        let ip = Ipv4Addr::new(10, 244, 3, 2);
        let mut store = MemoryStore::new();
        with_lock(&mut store, |s| s.add_record(ip, "ctr-a", "eth0")).unwrap();

        assert_eq!(release(&mut store, "ctr-a").unwrap(), Some(ip));
        assert!(store.persisted().ips.is_empty());

        // Second release is a no-op
        assert_eq!(release(&mut store, "ctr-a").unwrap(), None);
    }

    #[test]
    fn test_run_without_subnet_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.store.data_dir = tmp.path().to_path_buf();
        config.store.subnet_file = tmp.path().join("missing.json");
        config.display.color = false;

        let mut store = FileStore::open(tmp.path(), &config.store.network).unwrap();
        with_lock(&mut store, |s| {
            s.add_record(Ipv4Addr::new(10, 244, 3, 2), "ctr-a", "eth0")
        })
        .unwrap();

        run(
            &config,
            ContainerArgs {
                container_id: "ctr-a".to_string(),
            },
        )
        .unwrap();

        let records = with_lock(&mut store, |s| Ok(s.records())).unwrap();
        assert!(records.is_empty());
    }
}
