//! Parsing of caller network selectors.
//!
//! The network field of a container spec is one of:
//!
//! | Spec              | Subnet                   | IP      |
//! |-------------------|--------------------------|---------|
//! | `""`              | dynamic /30              | dynamic |
//! | `"a.b.c.0/24"`    | that subnet              | dynamic |
//! | `"a.b.c.d/24"`    | that subnet              | `a.b.c.d` |
//! | `"a.b.c.d"`       | the enclosing static /30 | `a.b.c.d` |

use crate::constants::DYNAMIC_SUBNET_PREFIX;
use crate::error::{Error, Result};
use crate::net::subnets::{IpSelector, SubnetSelector};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Parses a network spec string into pool selectors.
pub fn parse(spec: &str) -> Result<(SubnetSelector, IpSelector)> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok((SubnetSelector::Dynamic, IpSelector::Dynamic));
    }

    if let Some((addr_part, prefix_part)) = spec.split_once('/') {
        let addr: Ipv4Addr = addr_part
            .parse()
            .map_err(|_| bad_spec(spec))?;
        let prefix: u8 = prefix_part.parse().map_err(|_| bad_spec(spec))?;
        let subnet = normalized(addr, prefix).ok_or_else(|| bad_spec(spec))?;
        let ip_sel = if addr == subnet.network() {
            IpSelector::Dynamic
        } else {
            IpSelector::Static(addr)
        };
        return Ok((SubnetSelector::Static(subnet), ip_sel));
    }

    let addr: Ipv4Addr = spec.parse().map_err(|_| bad_spec(spec))?;
    let subnet =
        normalized(addr, DYNAMIC_SUBNET_PREFIX).ok_or_else(|| bad_spec(spec))?;
    Ok((SubnetSelector::Static(subnet), IpSelector::Static(addr)))
}

/// The network containing `addr` at the given prefix length.
fn normalized(addr: Ipv4Addr, prefix: u8) -> Option<Ipv4Network> {
    if prefix > 32 {
        return None;
    }
    let host_bits = 32 - prefix;
    let network = if host_bits == 32 {
        Ipv4Addr::from(0)
    } else {
        Ipv4Addr::from(u32::from(addr) & !((1u32 << host_bits) - 1))
    };
    Ipv4Network::new(network, prefix).ok()
}

fn bad_spec(spec: &str) -> Error {
    Error::Validation(format!("malformed network spec: {spec:?}"))
}
