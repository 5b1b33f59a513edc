//! iptables rule lifecycle.
//!
//! Every container owns a chain in `filter` (egress openings) and a chain
//! in `nat` (port forwards), reached by jumps from the supervisor's global
//! prefix chains. Concurrent containers never touch each other's chains,
//! so per-container setup and teardown need no extra serialization beyond
//! the iptables `-w` lock.
//!
//! The [`IptablesStarter`] installs the global chains and the configured
//! deny/allow rules once, before request handling begins.

use crate::command::{CommandRunner, CommandSpec};
use crate::error::Result;
use crate::net::config::NetworkConfig;
use crate::supervisor::Starter;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Rule Types
// =============================================================================

/// Protocol selector for egress rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
            Self::All => "all",
        }
    }
}

/// An inclusive destination port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }
}

/// An egress opening requested through `net_out`.
#[derive(Debug, Clone, Default)]
pub struct NetOutRule {
    /// Protocol to match; `None` matches everything.
    pub protocol: Option<Protocol>,
    /// Destination networks; empty means anywhere.
    pub networks: Vec<Ipv4Network>,
    /// Destination port ranges; empty means all ports. Ports require a
    /// port-aware protocol (tcp or udp).
    pub ports: Vec<PortRange>,
}

// =============================================================================
// Iptables
// =============================================================================

/// Issues iptables commands through the command seam.
pub struct Iptables {
    runner: Arc<dyn CommandRunner>,
    chain_prefix: String,
}

impl Iptables {
    pub fn new(runner: Arc<dyn CommandRunner>, chain_prefix: impl Into<String>) -> Self {
        Self {
            runner,
            chain_prefix: chain_prefix.into(),
        }
    }

    /// The global chain carrying per-container jumps in `filter`.
    pub fn forward_chain(&self) -> String {
        format!("{}forward", self.chain_prefix)
    }

    /// The global chain carrying per-container jumps in `nat`.
    pub fn prerouting_chain(&self) -> String {
        format!("{}prerouting", self.chain_prefix)
    }

    /// The global fallthrough chain holding deny/allow policy.
    pub fn default_chain(&self) -> String {
        format!("{}default", self.chain_prefix)
    }

    /// The global chain guarding traffic from containers to the host.
    pub fn input_chain(&self) -> String {
        format!("{}input", self.chain_prefix)
    }

    /// The global chain in `nat` holding per-subnet masquerading.
    pub fn postrouting_chain(&self) -> String {
        format!("{}postrouting", self.chain_prefix)
    }

    async fn run<I, S>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cmd = CommandSpec::new("iptables").arg("-w").args(args);
        self.runner.run_checked(&cmd).await?;
        Ok(())
    }

    async fn run_allow_failure<I, S>(&self, args: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cmd = CommandSpec::new("iptables").arg("-w").args(args);
        self.runner.run_checked(&cmd).await.is_ok()
    }

    /// Creates a chain if it does not exist, then flushes it.
    pub async fn create_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run_allow_failure(["-t", table, "-N", chain]).await;
        self.run(["-t", table, "-F", chain]).await
    }

    /// Flushes and deletes a chain; absent chains are tolerated.
    pub async fn delete_chain(&self, table: &str, chain: &str) {
        self.run_allow_failure(["-t", table, "-F", chain]).await;
        self.run_allow_failure(["-t", table, "-X", chain]).await;
    }

    /// Appends a rule.
    pub async fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        let mut args = vec!["-t".to_string(), table.to_string(), "-A".to_string(), chain.to_string()];
        args.extend_from_slice(rule);
        self.run(args).await
    }

    /// Installs a jump from `from` to `to` unless it is already present.
    pub async fn ensure_jump(&self, table: &str, from: &str, to: &str) -> Result<()> {
        let present = self
            .run_allow_failure(["-t", table, "-C", from, "-j", to])
            .await;
        if present {
            return Ok(());
        }
        self.run(["-t", table, "-I", from, "1", "-j", to]).await
    }

    /// Removes a jump; absent jumps are tolerated.
    pub async fn remove_jump(&self, table: &str, from: &str, to: &str) {
        self.run_allow_failure(["-t", table, "-D", from, "-j", to])
            .await;
    }

    // -------------------------------------------------------------------------
    // Per-container chains
    // -------------------------------------------------------------------------

    /// Creates the container's filter and nat chains and hooks them into
    /// the global prefix chains.
    pub async fn create_instance_chains(&self, config: &NetworkConfig) -> Result<()> {
        debug!(chain = %config.iptables_chain, "creating instance chains");

        self.create_chain("filter", &config.iptables_chain).await?;
        self.append(
            "filter",
            &config.iptables_chain,
            &string_vec([
                "-m",
                "conntrack",
                "--ctstate",
                "ESTABLISHED,RELATED",
                "-j",
                "ACCEPT",
            ]),
        )
        .await?;
        self.append(
            "filter",
            &config.iptables_chain,
            &string_vec(["-j", &self.default_chain()]),
        )
        .await?;
        self.ensure_jump("filter", &self.forward_chain(), &config.iptables_chain)
            .await?;

        self.create_chain("nat", &config.iptables_chain).await?;
        self.ensure_jump("nat", &self.prerouting_chain(), &config.iptables_chain)
            .await?;
        Ok(())
    }

    /// Unhooks and deletes the container's chains. Teardown is tolerant:
    /// a partially created container must still destroy cleanly.
    pub async fn destroy_instance_chains(&self, config: &NetworkConfig) {
        debug!(chain = %config.iptables_chain, "destroying instance chains");
        self.remove_jump("filter", &self.forward_chain(), &config.iptables_chain)
            .await;
        self.remove_jump("nat", &self.prerouting_chain(), &config.iptables_chain)
            .await;
        self.delete_chain("filter", &config.iptables_chain).await;
        self.delete_chain("nat", &config.iptables_chain).await;
    }

    /// Adds the per-subnet masquerade rule when a bridge comes up.
    pub async fn add_subnet_masquerade(&self, subnet: Ipv4Network) -> Result<()> {
        self.append(
            "nat",
            &self.postrouting_chain(),
            &string_vec([
                "-s",
                &subnet.to_string(),
                "!",
                "-d",
                &subnet.to_string(),
                "-j",
                "MASQUERADE",
            ]),
        )
        .await
    }

    /// Drops the per-subnet masquerade rule when the last container in the
    /// subnet goes away.
    pub async fn remove_subnet_masquerade(&self, subnet: Ipv4Network) {
        let chain = self.postrouting_chain();
        let subnet = subnet.to_string();
        self.run_allow_failure(string_vec([
            "-t",
            "nat",
            "-D",
            &chain,
            "-s",
            &subnet,
            "!",
            "-d",
            &subnet,
            "-j",
            "MASQUERADE",
        ]))
        .await;
    }
}

fn string_vec<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Port Forwarding
// =============================================================================

/// Installs host-port to container-port forwards.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    async fn forward(
        &self,
        config: &NetworkConfig,
        host_port: u16,
        container_port: u16,
    ) -> Result<()>;
}

/// DNAT rules in the container's nat chain.
pub struct IptablesPortForwarder {
    iptables: Arc<Iptables>,
}

impl IptablesPortForwarder {
    pub fn new(iptables: Arc<Iptables>) -> Self {
        Self { iptables }
    }
}

#[async_trait]
impl PortForwarder for IptablesPortForwarder {
    async fn forward(
        &self,
        config: &NetworkConfig,
        host_port: u16,
        container_port: u16,
    ) -> Result<()> {
        debug!(
            chain = %config.iptables_chain,
            host_port, container_port, "adding port forward"
        );
        self.iptables
            .append(
                "nat",
                &config.iptables_chain,
                &string_vec([
                    "-p",
                    "tcp",
                    "-d",
                    &config.external_ip.to_string(),
                    "--dport",
                    &host_port.to_string(),
                    "-j",
                    "DNAT",
                    "--to-destination",
                    &format!("{}:{}", config.container_ip, container_port),
                ]),
            )
            .await
    }
}

// =============================================================================
// Egress Openings
// =============================================================================

/// Opens outbound traffic for a container.
#[async_trait]
pub trait FirewallOpener: Send + Sync {
    async fn open(&self, config: &NetworkConfig, rule: &NetOutRule) -> Result<()>;
}

/// ACCEPT rules prepended to the container's filter chain so they run
/// before the default-deny fallthrough.
pub struct IptablesFirewallOpener {
    iptables: Arc<Iptables>,
}

impl IptablesFirewallOpener {
    pub fn new(iptables: Arc<Iptables>) -> Self {
        Self { iptables }
    }

    fn rule_specs(config: &NetworkConfig, rule: &NetOutRule) -> Vec<Vec<String>> {
        let networks: Vec<Option<Ipv4Network>> = if rule.networks.is_empty() {
            vec![None]
        } else {
            rule.networks.iter().copied().map(Some).collect()
        };
        let ports: Vec<Option<PortRange>> = if rule.ports.is_empty() {
            vec![None]
        } else {
            rule.ports.iter().copied().map(Some).collect()
        };

        let mut specs = Vec::new();
        for network in &networks {
            for port in &ports {
                let mut spec = vec!["-s".to_string(), config.container_ip.to_string()];
                if let Some(protocol) = rule.protocol {
                    spec.push("-p".to_string());
                    spec.push(protocol.as_str().to_string());
                }
                if let Some(network) = network {
                    spec.push("-d".to_string());
                    spec.push(network.to_string());
                }
                if let Some(range) = port {
                    spec.push("--dport".to_string());
                    spec.push(format!("{}:{}", range.start, range.end));
                }
                spec.push("-j".to_string());
                spec.push("ACCEPT".to_string());
                specs.push(spec);
            }
        }
        specs
    }
}

#[async_trait]
impl FirewallOpener for IptablesFirewallOpener {
    async fn open(&self, config: &NetworkConfig, rule: &NetOutRule) -> Result<()> {
        if !rule.ports.is_empty()
            && !matches!(rule.protocol, Some(Protocol::Tcp) | Some(Protocol::Udp))
        {
            return Err(crate::error::Error::Validation(
                "port ranges require a tcp or udp protocol".to_string(),
            ));
        }
        for spec in Self::rule_specs(config, rule) {
            let mut args = vec![
                "-t".to_string(),
                "filter".to_string(),
                "-I".to_string(),
                config.iptables_chain.clone(),
                "1".to_string(),
            ];
            args.extend(spec);
            self.iptables.run(args).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Starter
// =============================================================================

/// Installs the global prefix chains and host-access policy at startup.
pub struct IptablesStarter {
    iptables: Arc<Iptables>,
    allow_host_access: bool,
    interface_prefix: String,
    deny_networks: Vec<Ipv4Network>,
}

impl IptablesStarter {
    pub fn new(
        iptables: Arc<Iptables>,
        allow_host_access: bool,
        interface_prefix: impl Into<String>,
        deny_networks: Vec<Ipv4Network>,
    ) -> Self {
        Self {
            iptables,
            allow_host_access,
            interface_prefix: interface_prefix.into(),
            deny_networks,
        }
    }
}

#[async_trait]
impl Starter for IptablesStarter {
    async fn start(&self) -> Result<()> {
        info!("installing global iptables chains");
        let ipt = &self.iptables;

        ipt.create_chain("filter", &ipt.forward_chain()).await?;
        ipt.create_chain("filter", &ipt.default_chain()).await?;
        ipt.create_chain("filter", &ipt.input_chain()).await?;
        ipt.create_chain("nat", &ipt.prerouting_chain()).await?;
        ipt.create_chain("nat", &ipt.postrouting_chain()).await?;

        ipt.ensure_jump("filter", "FORWARD", &ipt.forward_chain())
            .await?;
        ipt.ensure_jump("filter", "INPUT", &ipt.input_chain()).await?;
        ipt.ensure_jump("nat", "PREROUTING", &ipt.prerouting_chain())
            .await?;
        ipt.ensure_jump("nat", "POSTROUTING", &ipt.postrouting_chain())
            .await?;

        // Policy: established flows return, configured networks are denied,
        // anything else falls through to the runtime default.
        ipt.append(
            "filter",
            &ipt.default_chain(),
            &string_vec([
                "-m",
                "conntrack",
                "--ctstate",
                "ESTABLISHED,RELATED",
                "-j",
                "ACCEPT",
            ]),
        )
        .await?;
        for network in &self.deny_networks {
            ipt.append(
                "filter",
                &ipt.default_chain(),
                &string_vec(["-d", &network.to_string(), "-j", "REJECT"]),
            )
            .await?;
        }

        if !self.allow_host_access {
            ipt.append(
                "filter",
                &ipt.input_chain(),
                &string_vec([
                    "-i",
                    &format!("{}+", self.interface_prefix),
                    "-j",
                    "REJECT",
                ]),
            )
            .await?;
        }
        Ok(())
    }
}
