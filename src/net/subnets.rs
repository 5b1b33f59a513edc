//! Subnet and IP pool.
//!
//! Dynamic allocations carve disjoint /30 networks out of the configured
//! range; static subnets of any size join the pool on first use. Each
//! subnet tracks the set of allocated IPs — the set size IS the subnet's
//! refcount, so the coherence invariant (refcount equals allocated IPs)
//! holds by construction. A subnet leaves the pool when its last IP is
//! released.
//!
//! Within a subnet the network address, the broadcast address, and the
//! first host (reserved for the gateway) are never allocatable. Dynamic IP
//! assignment is lowest-free-first for reproducibility.

use crate::constants::DYNAMIC_SUBNET_PREFIX;
use crate::error::{Error, Result};
use ipnetwork::Ipv4Network;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// How the caller picks a subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetSelector {
    /// Carve a fresh /30 out of the dynamic range.
    Dynamic,
    /// Use this specific subnet, creating it in the pool if new.
    Static(Ipv4Network),
}

/// How the caller picks an IP within the subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpSelector {
    /// Lowest free host address.
    Dynamic,
    /// This specific address.
    Static(Ipv4Addr),
}

/// The gateway address of a subnet: its first host.
pub fn gateway_ip(subnet: Ipv4Network) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) + 1)
}

/// The broadcast address of a subnet.
pub fn broadcast_ip(subnet: Ipv4Network) -> Ipv4Addr {
    let host_bits = 32 - subnet.prefix();
    let mask = if host_bits == 32 { u32::MAX } else { (1u32 << host_bits) - 1 };
    Ipv4Addr::from(u32::from(subnet.network()) | mask)
}

fn overlaps(a: Ipv4Network, b: Ipv4Network) -> bool {
    u32::from(a.network()) <= u32::from(broadcast_ip(b))
        && u32::from(b.network()) <= u32::from(broadcast_ip(a))
}

/// Serialized allocator for subnets and the IPs within them.
#[derive(Debug)]
pub struct SubnetPool {
    dynamic_range: Ipv4Network,
    allocated: Mutex<HashMap<Ipv4Network, HashSet<Ipv4Addr>>>,
}

impl SubnetPool {
    pub fn new(dynamic_range: Ipv4Network) -> Self {
        Self {
            dynamic_range,
            allocated: Mutex::new(HashMap::new()),
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<Ipv4Network, HashSet<Ipv4Addr>>>> {
        self.allocated
            .lock()
            .map_err(|e| Error::Internal(format!("subnet pool lock poisoned: {e}")))
    }

    /// Allocates a subnet/IP pair according to the selectors.
    ///
    /// A static IP can only be requested together with a static subnet.
    pub fn acquire(
        &self,
        subnet_sel: SubnetSelector,
        ip_sel: IpSelector,
    ) -> Result<(Ipv4Network, Ipv4Addr)> {
        let mut pool = self.lock()?;

        let subnet = match subnet_sel {
            SubnetSelector::Static(subnet) => subnet,
            SubnetSelector::Dynamic => {
                if matches!(ip_sel, IpSelector::Static(_)) {
                    return Err(Error::InconsistentNetworkSpec);
                }
                self.next_dynamic_subnet(&pool)?
            }
        };

        let taken = pool.get(&subnet);
        let ip = match ip_sel {
            IpSelector::Dynamic => Self::next_dynamic_ip(subnet, taken)?,
            IpSelector::Static(ip) => {
                Self::check_static_ip(subnet, ip)?;
                if taken.is_some_and(|set| set.contains(&ip)) {
                    return Err(Error::IpAlreadyAcquired {
                        subnet: subnet.to_string(),
                        ip: ip.to_string(),
                    });
                }
                ip
            }
        };

        pool.entry(subnet).or_default().insert(ip);
        Ok((subnet, ip))
    }

    /// Releases an IP and decrements its subnet's refcount.
    ///
    /// Returns `true` when this was the subnet's last IP and the subnet
    /// left the pool.
    pub fn release(&self, subnet: Ipv4Network, ip: Ipv4Addr) -> Result<bool> {
        let mut pool = self.lock()?;
        let not_allocated = || Error::IpNotAllocated {
            subnet: subnet.to_string(),
            ip: ip.to_string(),
        };
        let taken = pool.get_mut(&subnet).ok_or_else(not_allocated)?;
        if !taken.remove(&ip) {
            return Err(not_allocated());
        }
        let subnet_freed = taken.is_empty();
        if subnet_freed {
            pool.remove(&subnet);
        }
        Ok(subnet_freed)
    }

    /// Re-registers a persisted allocation during restart recovery.
    pub fn recover(&self, subnet: Ipv4Network, ip: Ipv4Addr) -> Result<()> {
        let mut pool = self.lock()?;
        if !pool.entry(subnet).or_default().insert(ip) {
            return Err(Error::IpAlreadyAcquired {
                subnet: subnet.to_string(),
                ip: ip.to_string(),
            });
        }
        Ok(())
    }

    /// Snapshot of (subnet, refcount) pairs, for introspection and tests.
    pub fn allocations(&self) -> Result<Vec<(Ipv4Network, usize)>> {
        let pool = self.lock()?;
        let mut snapshot: Vec<_> = pool
            .iter()
            .map(|(subnet, ips)| (*subnet, ips.len()))
            .collect();
        snapshot.sort_by_key(|(subnet, _)| u32::from(subnet.network()));
        Ok(snapshot)
    }

    fn next_dynamic_subnet(
        &self,
        pool: &HashMap<Ipv4Network, HashSet<Ipv4Addr>>,
    ) -> Result<Ipv4Network> {
        if self.dynamic_range.prefix() > DYNAMIC_SUBNET_PREFIX {
            return Err(Error::SubnetPoolExhausted);
        }
        let count = 1u32 << (DYNAMIC_SUBNET_PREFIX - self.dynamic_range.prefix());
        let base = u32::from(self.dynamic_range.network());
        for i in 0..count {
            let network = Ipv4Addr::from(base + i * 4);
            let candidate = Ipv4Network::new(network, DYNAMIC_SUBNET_PREFIX)
                .map_err(|e| Error::Internal(format!("subnet arithmetic: {e}")))?;
            if pool.keys().all(|taken| !overlaps(*taken, candidate)) {
                return Ok(candidate);
            }
        }
        Err(Error::SubnetPoolExhausted)
    }

    fn next_dynamic_ip(
        subnet: Ipv4Network,
        taken: Option<&HashSet<Ipv4Addr>>,
    ) -> Result<Ipv4Addr> {
        // First host is the gateway; walk from the second host up.
        let first = u32::from(subnet.network()) + 2;
        let last = u32::from(broadcast_ip(subnet));
        for raw in first..last {
            let candidate = Ipv4Addr::from(raw);
            if taken.is_none_or(|set| !set.contains(&candidate)) {
                return Ok(candidate);
            }
        }
        Err(Error::IpPoolExhausted(subnet.to_string()))
    }

    fn check_static_ip(subnet: Ipv4Network, ip: Ipv4Addr) -> Result<()> {
        if !subnet.contains(ip) {
            return Err(Error::Validation(format!("IP {ip} is outside subnet {subnet}")));
        }
        if ip == subnet.network() || ip == broadcast_ip(subnet) || ip == gateway_ip(subnet) {
            return Err(Error::Validation(format!(
                "IP {ip} is reserved in subnet {subnet}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> SubnetPool {
        SubnetPool::new("10.254.0.0/22".parse().unwrap())
    }

    #[test]
    fn dynamic_allocation_carves_disjoint_slash30s() {
        let pool = pool();
        let (s1, ip1) = pool
            .acquire(SubnetSelector::Dynamic, IpSelector::Dynamic)
            .unwrap();
        let (s2, ip2) = pool
            .acquire(SubnetSelector::Dynamic, IpSelector::Dynamic)
            .unwrap();
        assert_eq!(s1.to_string(), "10.254.0.0/30");
        assert_eq!(s2.to_string(), "10.254.0.4/30");
        assert_eq!(ip1.to_string(), "10.254.0.2");
        assert_eq!(ip2.to_string(), "10.254.0.6");
    }

    #[test]
    fn dynamic_ip_skips_network_gateway_and_broadcast() {
        let pool = pool();
        let subnet: Ipv4Network = "192.168.4.0/30".parse().unwrap();
        let (_, ip) = pool
            .acquire(SubnetSelector::Static(subnet), IpSelector::Dynamic)
            .unwrap();
        // .0 network, .1 gateway, .3 broadcast — only .2 is a host.
        assert_eq!(ip.to_string(), "192.168.4.2");
        assert!(matches!(
            pool.acquire(SubnetSelector::Static(subnet), IpSelector::Dynamic),
            Err(Error::IpPoolExhausted(_))
        ));
    }

    #[test]
    fn static_ip_in_dynamic_subnet_is_inconsistent() {
        let pool = pool();
        let result = pool.acquire(
            SubnetSelector::Dynamic,
            IpSelector::Static("10.254.0.2".parse().unwrap()),
        );
        assert!(matches!(result, Err(Error::InconsistentNetworkSpec)));
    }

    #[test]
    fn static_subnet_hands_out_lowest_free_hosts() {
        let pool = pool();
        let subnet: Ipv4Network = "172.250.1.0/24".parse().unwrap();
        let (_, first) = pool
            .acquire(SubnetSelector::Static(subnet), IpSelector::Dynamic)
            .unwrap();
        let (_, second) = pool
            .acquire(SubnetSelector::Static(subnet), IpSelector::Dynamic)
            .unwrap();
        assert_eq!(first.to_string(), "172.250.1.2");
        assert_eq!(second.to_string(), "172.250.1.3");
    }

    #[test]
    fn specific_ip_can_be_claimed_once() {
        let pool = pool();
        let subnet: Ipv4Network = "172.250.1.0/24".parse().unwrap();
        let ip: Ipv4Addr = "172.250.1.20".parse().unwrap();
        pool.acquire(SubnetSelector::Static(subnet), IpSelector::Static(ip))
            .unwrap();
        assert!(matches!(
            pool.acquire(SubnetSelector::Static(subnet), IpSelector::Static(ip)),
            Err(Error::IpAlreadyAcquired { .. })
        ));
    }

    #[test]
    fn reserved_addresses_are_rejected() {
        let pool = pool();
        let subnet: Ipv4Network = "172.250.1.0/24".parse().unwrap();
        for reserved in ["172.250.1.0", "172.250.1.1", "172.250.1.255"] {
            let result = pool.acquire(
                SubnetSelector::Static(subnet),
                IpSelector::Static(reserved.parse().unwrap()),
            );
            assert!(matches!(result, Err(Error::Validation(_))), "{reserved}");
        }
    }

    #[test]
    fn refcount_equals_allocated_ips_and_subnet_frees_on_last_release() {
        let pool = pool();
        let subnet: Ipv4Network = "172.250.1.0/24".parse().unwrap();
        let (_, a) = pool
            .acquire(SubnetSelector::Static(subnet), IpSelector::Dynamic)
            .unwrap();
        let (_, b) = pool
            .acquire(SubnetSelector::Static(subnet), IpSelector::Dynamic)
            .unwrap();
        assert_eq!(pool.allocations().unwrap(), vec![(subnet, 2)]);

        assert!(!pool.release(subnet, a).unwrap());
        assert_eq!(pool.allocations().unwrap(), vec![(subnet, 1)]);
        assert!(pool.release(subnet, b).unwrap());
        assert!(pool.allocations().unwrap().is_empty());
    }

    #[test]
    fn released_dynamic_subnet_is_reused() {
        let pool = pool();
        let (s1, ip1) = pool
            .acquire(SubnetSelector::Dynamic, IpSelector::Dynamic)
            .unwrap();
        pool.release(s1, ip1).unwrap();
        let (s2, _) = pool
            .acquire(SubnetSelector::Dynamic, IpSelector::Dynamic)
            .unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn double_release_is_an_error() {
        let pool = pool();
        let (subnet, ip) = pool
            .acquire(SubnetSelector::Dynamic, IpSelector::Dynamic)
            .unwrap();
        pool.release(subnet, ip).unwrap();
        assert!(matches!(
            pool.release(subnet, ip),
            Err(Error::IpNotAllocated { .. })
        ));
    }

    #[test]
    fn dynamic_range_exhaustion_is_reported() {
        let pool = SubnetPool::new("10.1.0.0/29".parse().unwrap());
        pool.acquire(SubnetSelector::Dynamic, IpSelector::Dynamic)
            .unwrap();
        pool.acquire(SubnetSelector::Dynamic, IpSelector::Dynamic)
            .unwrap();
        assert!(matches!(
            pool.acquire(SubnetSelector::Dynamic, IpSelector::Dynamic),
            Err(Error::SubnetPoolExhausted)
        ));
    }

    #[test]
    fn dynamic_allocation_avoids_overlapping_static_subnets() {
        let pool = SubnetPool::new("10.1.0.0/29".parse().unwrap());
        let inside: Ipv4Network = "10.1.0.0/30".parse().unwrap();
        pool.acquire(SubnetSelector::Static(inside), IpSelector::Dynamic)
            .unwrap();
        let (dynamic, _) = pool
            .acquire(SubnetSelector::Dynamic, IpSelector::Dynamic)
            .unwrap();
        assert_eq!(dynamic.to_string(), "10.1.0.4/30");
    }

    #[test]
    fn recover_reinstates_a_persisted_allocation() {
        let pool = pool();
        let subnet: Ipv4Network = "10.254.0.0/30".parse().unwrap();
        let ip: Ipv4Addr = "10.254.0.2".parse().unwrap();
        pool.recover(subnet, ip).unwrap();
        // The recovered /30 is no longer available dynamically.
        let (next, _) = pool
            .acquire(SubnetSelector::Dynamic, IpSelector::Dynamic)
            .unwrap();
        assert_eq!(next.to_string(), "10.254.0.4/30");
        assert!(pool.recover(subnet, ip).is_err());
    }

    #[test]
    fn gateway_and_broadcast_helpers() {
        let subnet: Ipv4Network = "10.254.0.4/30".parse().unwrap();
        assert_eq!(gateway_ip(subnet).to_string(), "10.254.0.5");
        assert_eq!(broadcast_ip(subnet).to_string(), "10.254.0.7");
    }
}
