//! Container network allocation and lifecycle.
//!
//! The allocator owns the subnet pool, the mapped-port pool, and the
//! persistent per-handle network record:
//!
//! - `network` runs at create time: parse the caller's selector, allocate
//!   a subnet and IP, derive a [`NetworkConfig`], persist it, and hand the
//!   supervisor the hook commands the runtime will invoke out-of-band.
//! - `configure` runs inside the prestart hook, once the container's
//!   network namespace exists.
//! - `destroy` tears down in a fixed order — iptables chains, port
//!   forwards, IP, subnet refcount, property record — so a failure at any
//!   step never leaves an earlier step uncleaned.
//! - `restore` re-registers persisted allocations after a daemon restart.

pub mod config;
pub mod configurer;
pub mod iptables;
pub mod ports;
pub mod spec;
pub mod subnets;

pub use config::{ConfigCreator, NetworkConfig};
pub use configurer::{Configurer, HostConfigurer};
pub use iptables::{
    FirewallOpener, Iptables, IptablesFirewallOpener, IptablesPortForwarder, IptablesStarter,
    NetOutRule, PortForwarder, PortRange, Protocol,
};
pub use ports::PortPool;
pub use subnets::{IpSelector, SubnetPool, SubnetSelector};

use crate::constants::MAPPED_PORTS_PROPERTY;
use crate::error::{Error, Result};
use crate::properties::PropertyManager;
use crate::spec::{HookCommand, NetworkHooks, PortMapping};
use crate::supervisor::Networker;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The production network allocator.
pub struct NetworkAllocator {
    subnets: Arc<SubnetPool>,
    ports: Arc<PortPool>,
    config_creator: ConfigCreator,
    configurer: Arc<dyn Configurer>,
    properties: Arc<PropertyManager>,
    port_forwarder: Arc<dyn PortForwarder>,
    firewall_opener: Arc<dyn FirewallOpener>,
    hook_binary: PathBuf,
}

impl NetworkAllocator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subnets: Arc<SubnetPool>,
        ports: Arc<PortPool>,
        config_creator: ConfigCreator,
        configurer: Arc<dyn Configurer>,
        properties: Arc<PropertyManager>,
        port_forwarder: Arc<dyn PortForwarder>,
        firewall_opener: Arc<dyn FirewallOpener>,
        hook_binary: impl Into<PathBuf>,
    ) -> Self {
        Self {
            subnets,
            ports,
            config_creator,
            configurer,
            properties,
            port_forwarder,
            firewall_opener,
            hook_binary: hook_binary.into(),
        }
    }

    /// Applies the persisted configuration to the namespace of
    /// `container_pid`; the prestart hook calls this.
    pub async fn configure(&self, handle: &str, container_pid: u32) -> Result<()> {
        let config = self.load_config(handle)?;
        self.configurer.apply(&config, container_pid).await
    }

    fn load_config(&self, handle: &str) -> Result<NetworkConfig> {
        NetworkConfig::from_properties(&self.properties.all(handle)?)?
            .ok_or_else(|| Error::HandleNotFound(handle.to_string()))
    }

    fn mapped_ports(&self, handle: &str) -> Result<Vec<PortMapping>> {
        match self.properties.get(handle, MAPPED_PORTS_PROPERTY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    fn save_mapped_ports(&self, handle: &str, mappings: &[PortMapping]) -> Result<()> {
        self.properties.set(
            handle,
            MAPPED_PORTS_PROPERTY,
            &serde_json::to_string(mappings)?,
        )
    }

    fn hook(&self, action: &str, handle: &str) -> HookCommand {
        HookCommand {
            path: self.hook_binary.clone(),
            args: vec![
                format!("--action={action}"),
                format!("--handle={handle}"),
            ],
        }
    }
}

#[async_trait]
impl Networker for NetworkAllocator {
    async fn network(&self, handle: &str, network_spec: &str) -> Result<NetworkHooks> {
        let (subnet_sel, ip_sel) = spec::parse(network_spec)?;
        let (subnet, ip) = self.subnets.acquire(subnet_sel, ip_sel)?;
        info!(handle, subnet = %subnet, ip = %ip, "allocated container network");

        let config = self.config_creator.create(subnet, ip);
        for (key, value) in config.to_properties() {
            if let Err(err) = self.properties.set(handle, key, &value) {
                let _ = self.subnets.release(subnet, ip);
                return Err(err);
            }
        }

        Ok(NetworkHooks {
            prestart: self.hook("create", handle),
            poststop: self.hook("destroy", handle),
        })
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        let Some(config) = NetworkConfig::from_properties(&self.properties.all(handle)?)? else {
            debug!(handle, "no network record, nothing to destroy");
            return Ok(());
        };

        self.configurer.destroy(&config).await?;

        for mapping in self.mapped_ports(handle)? {
            match self.ports.release(mapping.host_port) {
                // Explicitly requested ports live outside the pool.
                Ok(()) | Err(Error::PortNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let subnet_freed = self.subnets.release(config.subnet, config.container_ip)?;
        if subnet_freed {
            self.configurer.destroy_bridge(&config).await?;
        }

        for (key, _) in config.to_properties() {
            self.properties.remove(handle, key)?;
        }
        self.properties.remove(handle, MAPPED_PORTS_PROPERTY)?;
        info!(handle, "network destroyed");
        Ok(())
    }

    async fn net_in(
        &self,
        handle: &str,
        host_port: u16,
        container_port: u16,
    ) -> Result<(u16, u16)> {
        let config = self.load_config(handle)?;

        let (host_port, acquired) = if host_port == 0 {
            (self.ports.acquire()?, true)
        } else {
            (host_port, false)
        };
        let container_port = if container_port == 0 {
            host_port
        } else {
            container_port
        };

        if let Err(err) = self
            .port_forwarder
            .forward(&config, host_port, container_port)
            .await
        {
            if acquired {
                let _ = self.ports.release(host_port);
            }
            return Err(err);
        }

        let mut mappings = self.mapped_ports(handle)?;
        mappings.push(PortMapping {
            host_port,
            container_port,
        });
        self.save_mapped_ports(handle, &mappings)?;

        debug!(handle, host_port, container_port, "port mapped");
        Ok((host_port, container_port))
    }

    async fn net_out(&self, handle: &str, rule: NetOutRule) -> Result<()> {
        let config = self.load_config(handle)?;
        self.firewall_opener.open(&config, &rule).await
    }

    async fn restore(&self, handles: &[String]) -> Result<()> {
        for handle in handles {
            let config = match NetworkConfig::from_properties(&self.properties.all(handle)?) {
                Ok(Some(config)) => config,
                Ok(None) => continue,
                Err(err) => {
                    warn!(handle, error = %err, "skipping unrecoverable network record");
                    continue;
                }
            };
            if let Err(err) = self.subnets.recover(config.subnet, config.container_ip) {
                warn!(handle, error = %err, "subnet recovery failed");
            }
            for mapping in self.mapped_ports(handle)? {
                if let Err(err) = self.ports.remove(mapping.host_port) {
                    warn!(handle, port = mapping.host_port, error = %err, "port recovery failed");
                }
            }
            debug!(handle, "network state restored");
        }
        Ok(())
    }
}
