//! IP Address Management (IPAM)
//!
//! Hands out addresses from one IPv4 subnet on top of an [`AllocationStore`].
//!
//! The usable range is every address strictly between the network and the
//! broadcast address. The first of those is the gateway and is never handed
//! out: the scan always yields the successor of its current position, and the
//! lowest position it ever takes is the gateway itself.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

use crate::error::IpamError;
use crate::store::{Allocation, AllocationStore};

pub struct Ipam<S> {
    subnet: Ipv4Net,
    gateway: Ipv4Addr,
    store: S,
}

impl<S: AllocationStore> Ipam<S> {
    /// Build an allocator for `cidr`
    ///
    /// Host bits in `cidr` are ignored. Subnets smaller than a /30 are rejected
    /// since nothing would be left once the gateway is reserved.
    pub fn new(cidr: &str, store: S) -> Result<Self, IpamError> {
        let subnet: Ipv4Net = cidr.trim().parse().map_err(|source| IpamError::InvalidSubnet {
            cidr: cidr.to_string(),
            source,
        })?;
        let subnet = subnet.trunc();

        if subnet.prefix_len() > 30 {
            return Err(IpamError::SubnetTooSmall(subnet));
        }

        let gateway = Ipv4Addr::from(u32::from(subnet.network()) + 1);

        Ok(Self {
            subnet,
            gateway,
            store,
        })
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    pub fn mask(&self) -> Ipv4Addr {
        self.subnet.netmask()
    }

    pub fn prefix_len(&self) -> u8 {
        self.subnet.prefix_len()
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// Pair `ip` with the subnet prefix
    pub fn ip_net(&self, ip: Ipv4Addr) -> Ipv4Net {
        // prefix_len comes from a parsed Ipv4Net, so it is always <= 32
        Ipv4Net::new(ip, self.subnet.prefix_len()).unwrap_or(self.subnet)
    }

    /// The gateway address with the subnet prefix, as assigned to the bridge
    pub fn gateway_net(&self) -> Ipv4Net {
        self.ip_net(self.gateway)
    }

    /// Number of addresses that can be handed out to containers
    pub fn capacity(&self) -> u32 {
        u32::from(self.last_usable()) - u32::from(self.gateway)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn last_usable(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet.broadcast()) - 1)
    }

    fn in_range(&self, ip: Ipv4Addr) -> bool {
        ip >= self.gateway && ip <= self.last_usable()
    }

    /// Successor of `ip`, or `None` once it would leave the usable range
    fn next_ip(&self, ip: Ipv4Addr) -> Option<Ipv4Addr> {
        let next = u32::from(ip).checked_add(1).map(Ipv4Addr::from)?;
        (next <= self.last_usable()).then_some(next)
    }

    /// Run `f` inside the store lock on freshly loaded data
    fn with_store_lock<T, F>(&mut self, f: F) -> Result<T, IpamError>
    where
        F: FnOnce(&mut Self) -> Result<T, IpamError>,
    {
        self.store.lock()?;

        let result = self.store.load_data().and_then(|()| f(self));

        match self.store.unlock() {
            Ok(()) => result,
            Err(unlock_err) => match result {
                Ok(_) => Err(unlock_err),
                Err(e) => {
                    warn!(error = %unlock_err, "failed to release store lock after error");
                    Err(e)
                }
            },
        }
    }

    /// Give `container_id` an address, reusing the one it already holds
    pub fn allocate_ip(&mut self, container_id: &str, if_name: &str) -> Result<Ipv4Addr, IpamError> {
        self.with_store_lock(|ipam| ipam.allocate_locked(container_id, if_name))
    }

    fn allocate_locked(&mut self, container_id: &str, if_name: &str) -> Result<Ipv4Addr, IpamError> {
        if let Some(ip) = self.store.find_by_container(container_id) {
            if self.in_range(ip) {
                info!(container_id, %ip, "container already has an address");
            } else {
                warn!(
                    container_id,
                    %ip,
                    subnet = %self.subnet,
                    "container holds an address outside the subnet"
                );
            }
            return Ok(ip);
        }

        let start = match self.store.last_allocated() {
            Some(last) if self.in_range(last) => last,
            Some(last) => {
                warn!(%last, subnet = %self.subnet, "cursor outside subnet, scanning from gateway");
                self.gateway
            }
            None => self.gateway,
        };

        let mut current = start;
        loop {
            let candidate = match self.next_ip(current) {
                Some(next) => next,
                // Wrap to pick up addresses below the cursor that were released
                None if start != self.gateway && current != self.gateway => {
                    debug!(subnet = %self.subnet, "reached end of subnet, wrapping to gateway");
                    current = self.gateway;
                    continue;
                }
                None => break,
            };

            if !self.store.contains(candidate) {
                self.store.add_record(candidate, container_id, if_name)?;
                info!(container_id, if_name, ip = %candidate, "allocated address");
                return Ok(candidate);
            }

            current = candidate;
            if current == start {
                break;
            }
        }

        Err(IpamError::Exhausted {
            subnet: self.subnet,
        })
    }

    /// Free the container's address and return it; unknown containers are ignored
    pub fn release_ip(&mut self, container_id: &str) -> Result<Option<Ipv4Addr>, IpamError> {
        self.with_store_lock(|ipam| {
            let freed = ipam.store.remove_by_container(container_id)?;
            match freed {
                Some(ip) => info!(container_id, %ip, "released address"),
                None => info!(container_id, "container had no address"),
            }
            Ok(freed)
        })
    }

    /// Address currently held by the container
    pub fn check_ip(&mut self, container_id: &str) -> Result<Ipv4Addr, IpamError> {
        self.with_store_lock(|ipam| {
            ipam.store
                .find_by_container(container_id)
                .ok_or_else(|| IpamError::NotFound {
                    container_id: container_id.to_string(),
                })
        })
    }

    /// Snapshot of every allocation in the subnet
    pub fn allocations(&mut self) -> Result<Vec<Allocation>, IpamError> {
        self.with_store_lock(|ipam| Ok(ipam.store.records()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::fs;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use tempfile::TempDir;

    use super::*;
    use crate::store::{FileStore, MemoryStore};

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn memory_ipam(cidr: &str) -> Ipam<MemoryStore> {
        Ipam::new(cidr, MemoryStore::new()).unwrap()
    }

    #[test]
    fn test_derived_accessors() {
        let ipam = memory_ipam("10.244.1.0/24");
        assert_eq!(ipam.gateway(), ip("10.244.1.1"));
        assert_eq!(ipam.mask(), ip("255.255.255.0"));
        assert_eq!(ipam.prefix_len(), 24);
        assert_eq!(ipam.ip_net(ip("10.244.1.7")).to_string(), "10.244.1.7/24");
        assert_eq!(ipam.gateway_net().to_string(), "10.244.1.1/24");
        assert_eq!(ipam.capacity(), 253);
    }

    #[test]
    fn test_host_bits_are_ignored() {
        let ipam = memory_ipam("10.244.1.77/24");
        assert_eq!(ipam.subnet().to_string(), "10.244.1.0/24");
        assert_eq!(ipam.gateway(), ip("10.244.1.1"));
    }

    #[test]
    fn test_invalid_subnets() {
        assert!(matches!(
            Ipam::new("10.244.0.0", MemoryStore::new()),
            Err(IpamError::InvalidSubnet { .. })
        ));
        assert!(matches!(
            Ipam::new("not-a-cidr", MemoryStore::new()),
            Err(IpamError::InvalidSubnet { .. })
        ));
        assert!(matches!(
            Ipam::new("10.244.0.0/31", MemoryStore::new()),
            Err(IpamError::SubnetTooSmall(_))
        ));
        assert!(matches!(
            Ipam::new("10.244.0.0/32", MemoryStore::new()),
            Err(IpamError::SubnetTooSmall(_))
        ));
    }

    #[test]
    fn test_construction_does_not_touch_store() {
        let ipam = memory_ipam("10.244.0.0/24");
        assert_eq!(ipam.store().saves(), 0);
    }

    #[test]
    fn test_first_allocation_skips_gateway() {
        let mut ipam = memory_ipam("10.244.0.0/24");
        assert_eq!(ipam.allocate_ip("c1", "eth0").unwrap(), ip("10.244.0.2"));
        assert_eq!(ipam.allocate_ip("c2", "eth0").unwrap(), ip("10.244.0.3"));
        assert_eq!(ipam.allocate_ip("c3", "eth0").unwrap(), ip("10.244.0.4"));
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let mut ipam = memory_ipam("10.244.0.0/24");
        let first = ipam.allocate_ip("c1", "eth0").unwrap();
        let saves = ipam.store().saves();

        let second = ipam.allocate_ip("c1", "eth0").unwrap();
        assert_eq!(first, second);
        assert_eq!(ipam.store().saves(), saves);
        assert_eq!(ipam.store().persisted().last, Some(first));
        assert_eq!(ipam.allocations().unwrap().len(), 1);
    }

    #[test]
    fn test_slash_30_scenario() {
        // .1 is the gateway, .3 the broadcast address: only .2 can be handed out
        let mut ipam = memory_ipam("10.244.0.0/30");
        assert_eq!(ipam.capacity(), 1);

        assert_eq!(ipam.allocate_ip("c1", "eth0").unwrap(), ip("10.244.0.2"));

        let err = ipam.allocate_ip("c2", "eth0").unwrap_err();
        assert!(err.is_exhausted());

        ipam.release_ip("c1").unwrap();
        assert_eq!(ipam.allocate_ip("c2", "eth0").unwrap(), ip("10.244.0.2"));
    }

    #[test]
    fn test_exhaustion_after_capacity() {
        let mut ipam = memory_ipam("10.244.0.0/29");
        let capacity = ipam.capacity();
        assert_eq!(capacity, 5);

        let mut seen = HashSet::new();
        for i in 0..capacity {
            let addr = ipam.allocate_ip(&format!("c{}", i), "eth0").unwrap();
            assert!(addr >= ip("10.244.0.2") && addr <= ip("10.244.0.6"));
            assert!(seen.insert(addr), "address {} handed out twice", addr);
        }

        let err = ipam.allocate_ip("one-too-many", "eth0").unwrap_err();
        assert!(err.is_exhausted());
        assert!(!seen.contains(&ip("10.244.0.1")));
        assert!(!seen.contains(&ip("10.244.0.7")));
    }

    #[test]
    fn test_release_then_wraparound_reuses_address() {
        let mut ipam = memory_ipam("10.244.0.0/29");
        for i in 0..5 {
            ipam.allocate_ip(&format!("c{}", i), "eth0").unwrap();
        }

        // Free one below the cursor (.6); the next scan must wrap to find it
        ipam.release_ip("c1").unwrap();
        assert_eq!(ipam.allocate_ip("fresh", "eth0").unwrap(), ip("10.244.0.3"));
        assert!(ipam.allocate_ip("another", "eth0").unwrap_err().is_exhausted());
    }

    #[test]
    fn test_scan_continues_from_cursor() {
        let mut ipam = memory_ipam("10.244.0.0/24");
        ipam.allocate_ip("c1", "eth0").unwrap(); // .2
        ipam.allocate_ip("c2", "eth0").unwrap(); // .3
        ipam.release_ip("c1").unwrap();

        // .2 is free but the scan starts after the cursor (.3)
        assert_eq!(ipam.allocate_ip("c3", "eth0").unwrap(), ip("10.244.0.4"));
    }

    #[test]
    fn test_stale_cursor_restarts_at_gateway() {
        let mut ipam = memory_ipam("10.244.0.0/24");
        ipam.store.load_data().unwrap();
        ipam.store.add_record(ip("192.168.9.9"), "elsewhere", "eth0").unwrap();

        assert_eq!(ipam.allocate_ip("c1", "eth0").unwrap(), ip("10.244.0.2"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut ipam = memory_ipam("10.244.0.0/24");
        assert_eq!(ipam.release_ip("never-allocated").unwrap(), None);

        let addr = ipam.allocate_ip("c1", "eth0").unwrap();
        assert_eq!(ipam.release_ip("c1").unwrap(), Some(addr));
        assert_eq!(ipam.release_ip("c1").unwrap(), None);
        assert!(ipam.allocations().unwrap().is_empty());
    }

    #[test]
    fn test_held_address_outside_subnet_is_returned() {
        // Store left over from a different subnet
        let mut ipam = memory_ipam("10.244.0.0/24");
        ipam.store.load_data().unwrap();
        ipam.store.add_record(ip("192.168.9.9"), "c1", "eth0").unwrap();
        let saves = ipam.store().saves();

        assert_eq!(ipam.allocate_ip("c1", "eth0").unwrap(), ip("192.168.9.9"));
        assert_eq!(ipam.store().saves(), saves);
        assert_eq!(ipam.allocations().unwrap().len(), 1);
    }

    #[test]
    fn test_check() {
        let mut ipam = memory_ipam("10.244.0.0/24");
        let addr = ipam.allocate_ip("c1", "eth0").unwrap();
        assert_eq!(ipam.check_ip("c1").unwrap(), addr);

        ipam.release_ip("c1").unwrap();
        let err = ipam.check_ip("c1").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_allocation_is_durable_across_processes() {
        let tmp = TempDir::new().unwrap();
        let addr = {
            let store = FileStore::open(tmp.path(), "pods").unwrap();
            let mut ipam = Ipam::new("10.244.0.0/24", store).unwrap();
            ipam.allocate_ip("c1", "eth0").unwrap()
        };

        // A fresh store stands in for the next plugin invocation
        let mut store = FileStore::open(tmp.path(), "pods").unwrap();
        store.load_data().unwrap();
        assert_eq!(store.find_by_container("c1"), Some(addr));

        let mut ipam = Ipam::new("10.244.0.0/24", store).unwrap();
        assert_eq!(ipam.allocate_ip("c2", "eth0").unwrap(), ip("10.244.0.3"));
    }

    #[test]
    fn test_corrupt_store_propagates() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::open(tmp.path(), "pods").unwrap();
        fs::write(store.data_file(), "not json").unwrap();

        let mut ipam = Ipam::new("10.244.0.0/24", store).unwrap();
        let err = ipam.allocate_ip("c1", "eth0").unwrap_err();
        assert!(matches!(err, IpamError::Corrupt { .. }));

        // The lock was released despite the failure
        let mut other = FileStore::open(tmp.path(), "pods").unwrap();
        other.lock().unwrap();
        other.unlock().unwrap();
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        const WORKERS: usize = 16;

        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let barrier = Arc::new(Barrier::new(WORKERS));

        let handles: Vec<_> = (0..WORKERS)
            .map(|i| {
                let root = root.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    // Each worker gets its own store, like a separate plugin process
                    let store = FileStore::open(&root, "pods").unwrap();
                    let mut ipam = Ipam::new("10.244.0.0/27", store).unwrap();
                    barrier.wait();
                    ipam.allocate_ip(&format!("container-{}", i), "eth0").unwrap()
                })
            })
            .collect();

        let addrs: HashSet<Ipv4Addr> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(addrs.len(), WORKERS);

        let store = FileStore::open(&root, "pods").unwrap();
        let mut ipam = Ipam::new("10.244.0.0/27", store).unwrap();
        let records = ipam.allocations().unwrap();
        assert_eq!(records.len(), WORKERS);
        for record in records {
            assert!(addrs.contains(&record.ip));
        }
    }

    #[test]
    fn test_concurrent_allocate_and_release() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let root = root.clone();
                thread::spawn(move || {
                    let store = FileStore::open(&root, "pods").unwrap();
                    let mut ipam = Ipam::new("10.244.0.0/28", store).unwrap();
                    let id = format!("c{}", i);
                    for _ in 0..10 {
                        ipam.allocate_ip(&id, "eth0").unwrap();
                        ipam.release_ip(&id).unwrap();
                    }
                    ipam.allocate_ip(&id, "eth0").unwrap()
                })
            })
            .collect();

        let addrs: HashSet<Ipv4Addr> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(addrs.len(), 8);
        assert!(!addrs.contains(&ip("10.244.0.1")));
    }
}
