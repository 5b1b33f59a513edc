//! Host-side network plumbing.
//!
//! Applies a [`NetworkConfig`] to the host: bridge creation, the veth
//! pair, moving the container end into the target network namespace, and
//! the container's iptables chains. Invoked out-of-band by the network
//! hook between namespace creation and pivot_root, with the container's
//! init pid naming the namespace.

use crate::command::{CommandRunner, CommandSpec};
use crate::error::Result;
use crate::net::config::NetworkConfig;
use crate::net::iptables::Iptables;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Applies and removes host-side network configuration.
#[async_trait]
pub trait Configurer: Send + Sync {
    /// Plumbs the container whose init process is `container_pid`.
    async fn apply(&self, config: &NetworkConfig, container_pid: u32) -> Result<()>;

    /// Removes the container's host-side configuration. Must cope with
    /// partially applied configs.
    async fn destroy(&self, config: &NetworkConfig) -> Result<()>;

    /// Removes the shared bridge once its subnet has no containers left.
    async fn destroy_bridge(&self, config: &NetworkConfig) -> Result<()>;
}

/// Production configurer driving `ip`/`nsenter` and iptables.
pub struct HostConfigurer {
    runner: Arc<dyn CommandRunner>,
    iptables: Arc<Iptables>,
}

impl HostConfigurer {
    pub fn new(runner: Arc<dyn CommandRunner>, iptables: Arc<Iptables>) -> Self {
        Self { runner, iptables }
    }

    async fn ip(&self, args: &[&str]) -> Result<()> {
        self.runner
            .run_checked(&CommandSpec::new("ip").args(args.iter().copied()))
            .await?;
        Ok(())
    }

    async fn ip_exists(&self, args: &[&str]) -> bool {
        self.runner
            .run_checked(&CommandSpec::new("ip").args(args.iter().copied()))
            .await
            .is_ok()
    }

    /// Runs an `ip` command inside the container's network namespace.
    async fn ip_in_netns(&self, pid: u32, args: &[&str]) -> Result<()> {
        let pid = pid.to_string();
        let cmd = CommandSpec::new("nsenter")
            .args(["-t", pid.as_str(), "-n", "ip"])
            .args(args.iter().copied());
        self.runner.run_checked(&cmd).await?;
        Ok(())
    }

    async fn ensure_bridge(&self, config: &NetworkConfig) -> Result<()> {
        if self.ip_exists(&["link", "show", &config.bridge_name]).await {
            return Ok(());
        }
        info!(bridge = %config.bridge_name, subnet = %config.subnet, "creating bridge");
        self.ip(&["link", "add", &config.bridge_name, "type", "bridge"])
            .await?;
        let bridge_addr = format!("{}/{}", config.bridge_ip, config.subnet.prefix());
        self.ip(&["addr", "add", &bridge_addr, "dev", &config.bridge_name])
            .await?;
        self.ip(&["link", "set", &config.bridge_name, "up"]).await?;
        self.iptables.add_subnet_masquerade(config.subnet).await
    }
}

#[async_trait]
impl Configurer for HostConfigurer {
    async fn apply(&self, config: &NetworkConfig, container_pid: u32) -> Result<()> {
        debug!(
            host = %config.host_interface,
            container = %config.container_interface,
            pid = container_pid,
            "applying network configuration"
        );

        self.ensure_bridge(config).await?;

        let mtu = config.mtu.to_string();
        self.ip(&[
            "link",
            "add",
            &config.host_interface,
            "mtu",
            &mtu,
            "type",
            "veth",
            "peer",
            "name",
            &config.container_interface,
        ])
        .await?;
        self.ip(&[
            "link",
            "set",
            &config.host_interface,
            "master",
            &config.bridge_name,
        ])
        .await?;
        self.ip(&["link", "set", &config.host_interface, "up"]).await?;

        let pid = container_pid.to_string();
        self.ip(&["link", "set", &config.container_interface, "netns", &pid])
            .await?;

        let container_addr = format!("{}/{}", config.container_ip, config.subnet.prefix());
        self.ip_in_netns(
            container_pid,
            &["addr", "add", &container_addr, "dev", &config.container_interface],
        )
        .await?;
        self.ip_in_netns(
            container_pid,
            &["link", "set", &config.container_interface, "mtu", &mtu, "up"],
        )
        .await?;
        self.ip_in_netns(container_pid, &["link", "set", "lo", "up"])
            .await?;
        let gateway = config.bridge_ip.to_string();
        self.ip_in_netns(container_pid, &["route", "add", "default", "via", &gateway])
            .await?;

        self.iptables.create_instance_chains(config).await
    }

    async fn destroy(&self, config: &NetworkConfig) -> Result<()> {
        debug!(host = %config.host_interface, "removing network configuration");
        self.iptables.destroy_instance_chains(config).await;
        // The veth pair dies with the namespace when the container is
        // already gone; a missing link is not a failure here.
        let _ = self.ip(&["link", "del", &config.host_interface]).await;
        Ok(())
    }

    async fn destroy_bridge(&self, config: &NetworkConfig) -> Result<()> {
        info!(bridge = %config.bridge_name, "removing bridge");
        self.iptables.remove_subnet_masquerade(config.subnet).await;
        if self.ip_exists(&["link", "show", &config.bridge_name]).await {
            self.ip(&["link", "del", &config.bridge_name]).await?;
        }
        Ok(())
    }
}
