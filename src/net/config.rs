//! Per-container network configuration.
//!
//! A [`NetworkConfig`] is everything the host side needs to plumb one
//! container: interface and bridge names, addressing, and the name of the
//! container's iptables chain. Configs are derived once from the handle
//! and the allocated subnet/IP, persisted under reserved property keys,
//! and read back to drive teardown — including after a daemon restart.

use crate::constants::{
    BRIDGE_IP_PROPERTY, BRIDGE_NAME_PROPERTY, CONTAINER_INTERFACE_PROPERTY,
    CONTAINER_IP_PROPERTY, EXTERNAL_IP_PROPERTY, HOST_INTERFACE_PROPERTY,
    IPTABLES_CHAIN_PROPERTY, MTU_PROPERTY, SUBNET_PROPERTY,
};
use crate::error::{Error, Result};
use crate::net::subnets::gateway_ip;
use crate::uid::SequentialIdGenerator;
use ipnetwork::Ipv4Network;
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Host-side network plumbing description for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub bridge_name: String,
    pub bridge_ip: Ipv4Addr,
    pub container_ip: Ipv4Addr,
    pub external_ip: Ipv4Addr,
    pub subnet: Ipv4Network,
    pub host_interface: String,
    pub container_interface: String,
    pub iptables_chain: String,
    pub mtu: u32,
}

/// Derives configs from allocated subnets and IPs.
///
/// Interface names come from a sequential instance id to stay inside the
/// kernel's 15-byte limit; the bridge name encodes the subnet so every
/// container in a subnet finds the same bridge.
#[derive(Debug)]
pub struct ConfigCreator {
    id_gen: SequentialIdGenerator,
    interface_prefix: String,
    chain_prefix: String,
    external_ip: Ipv4Addr,
    mtu: u32,
}

impl ConfigCreator {
    pub fn new(
        interface_prefix: impl Into<String>,
        chain_prefix: impl Into<String>,
        external_ip: Ipv4Addr,
        mtu: u32,
    ) -> Self {
        Self {
            id_gen: SequentialIdGenerator::new(0),
            interface_prefix: interface_prefix.into(),
            chain_prefix: chain_prefix.into(),
            external_ip,
            mtu,
        }
    }

    pub fn create(&self, subnet: Ipv4Network, container_ip: Ipv4Addr) -> NetworkConfig {
        let id = self.id_gen.next_id();
        NetworkConfig {
            bridge_name: format!("{}{}", self.interface_prefix, subnet_slug(subnet)),
            bridge_ip: gateway_ip(subnet),
            container_ip,
            external_ip: self.external_ip,
            subnet,
            host_interface: format!("{}{}-0", self.interface_prefix, id),
            container_interface: format!("{}{}-1", self.interface_prefix, id),
            iptables_chain: format!("{}instance-{}", self.chain_prefix, id),
            mtu: self.mtu,
        }
    }
}

/// The subnet's network address with dots replaced by dashes, e.g.
/// `172-250-1-0` for 172.250.1.0/24.
fn subnet_slug(subnet: Ipv4Network) -> String {
    subnet.network().to_string().replace('.', "-")
}

// =============================================================================
// Property Persistence
// =============================================================================

impl NetworkConfig {
    /// The key/value pairs persisted for this config.
    pub fn to_properties(&self) -> Vec<(&'static str, String)> {
        vec![
            (SUBNET_PROPERTY, self.subnet.to_string()),
            (CONTAINER_IP_PROPERTY, self.container_ip.to_string()),
            (BRIDGE_NAME_PROPERTY, self.bridge_name.clone()),
            (BRIDGE_IP_PROPERTY, self.bridge_ip.to_string()),
            (HOST_INTERFACE_PROPERTY, self.host_interface.clone()),
            (
                CONTAINER_INTERFACE_PROPERTY,
                self.container_interface.clone(),
            ),
            (IPTABLES_CHAIN_PROPERTY, self.iptables_chain.clone()),
            (EXTERNAL_IP_PROPERTY, self.external_ip.to_string()),
            (MTU_PROPERTY, self.mtu.to_string()),
        ]
    }

    /// Rebuilds a config from a handle's persisted properties.
    ///
    /// Returns `None` when the handle has no network record at all, and an
    /// error when the record is present but incomplete.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Option<Self>> {
        if !properties.contains_key(SUBNET_PROPERTY) {
            return Ok(None);
        }
        let field = |key: &str| -> Result<&String> {
            properties
                .get(key)
                .ok_or_else(|| Error::Internal(format!("network record is missing {key}")))
        };
        let parse_err =
            |key: &str| Error::Internal(format!("network record has a malformed {key}"));

        Ok(Some(Self {
            subnet: field(SUBNET_PROPERTY)?
                .parse()
                .map_err(|_| parse_err(SUBNET_PROPERTY))?,
            container_ip: field(CONTAINER_IP_PROPERTY)?
                .parse()
                .map_err(|_| parse_err(CONTAINER_IP_PROPERTY))?,
            bridge_name: field(BRIDGE_NAME_PROPERTY)?.clone(),
            bridge_ip: field(BRIDGE_IP_PROPERTY)?
                .parse()
                .map_err(|_| parse_err(BRIDGE_IP_PROPERTY))?,
            host_interface: field(HOST_INTERFACE_PROPERTY)?.clone(),
            container_interface: field(CONTAINER_INTERFACE_PROPERTY)?.clone(),
            iptables_chain: field(IPTABLES_CHAIN_PROPERTY)?.clone(),
            external_ip: field(EXTERNAL_IP_PROPERTY)?
                .parse()
                .map_err(|_| parse_err(EXTERNAL_IP_PROPERTY))?,
            mtu: field(MTU_PROPERTY)?
                .parse()
                .map_err(|_| parse_err(MTU_PROPERTY))?,
        }))
    }
}
