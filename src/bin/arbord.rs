//! arbord - the container supervisor daemon.
//!
//! Wires the supervisor's subsystems together, runs the startup sequence
//! (cgroup hierarchy, global iptables chains, network state recovery),
//! and then parks until SIGINT/SIGTERM/SIGHUP, exiting 0 on a graceful
//! stop. The API transport in front of the [`Supervisor`] is deliberately
//! not part of this crate.
//!
//! ## Usage
//!
//! ```sh
//! arbord --depot /var/run/arbor/depot --runtime-bin runc --tag g0
//! arbord --config /etc/arbor/config.json
//! ```

use arbor::bundle::{
    BaseTemplateRule, BindMountsRule, Bundle, BundleTemplate, Device, EnvRule, LimitsRule, Mount,
    Namespace, NetworkHookRule, Process, RootfsRule,
};
use arbor::cgroup::{CgroupReader, CgroupStarter};
use arbor::command::HostCommandRunner;
use arbor::constants::{
    DEFAULT_MTU, DEFAULT_NETWORK_POOL, DEFAULT_PORT_POOL_SIZE, DEFAULT_PORT_POOL_START,
};
use arbor::containerizer::{DepotContainerizer, HelperTarStreamer};
use arbor::depot::Depot;
use arbor::events::EventStore;
use arbor::mkdir::HostMkdirer;
use arbor::net::{
    ConfigCreator, HostConfigurer, Iptables, IptablesFirewallOpener, IptablesPortForwarder,
    IptablesStarter, NetworkAllocator, PortPool, SubnetPool,
};
use arbor::properties::PropertyManager;
use arbor::rootfs::PassthroughRootfsProvider;
use arbor::runtime::{ExecPreparer, PasswdUserLookup, RuncBinary, RuntimeDriver};
use arbor::spec::IdMap;
use arbor::supervisor::{Starter, Supervisor};
use arbor::uid::UuidGenerator;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct ArborConfig {
    /// Directory in which to store container bundles.
    depot: PathBuf,
    /// OCI runtime binary to invoke.
    runtime_bin: PathBuf,
    /// Network configuration hook binary.
    network_hook_bin: PathBuf,
    /// Namespace-entering tar helper binary.
    tar_helper_bin: PathBuf,
    /// tar binary handed to the helper.
    tar_bin: PathBuf,
    /// Default rootfs for specs that name none.
    rootfs: Option<PathBuf>,
    /// Pool of dynamically allocated container subnets.
    network_pool: String,
    /// Start of the ephemeral port range for mapped ports.
    port_pool_start: u16,
    /// Size of the ephemeral port range.
    port_pool_size: u16,
    /// MTU for container interfaces.
    mtu: u32,
    /// IP used to reach mapped container ports.
    external_ip: String,
    /// CIDR blocks containers may not reach.
    deny_networks: Vec<String>,
    /// Allow containers to reach the host.
    allow_host_access: bool,
    /// Server-wide identifier distinguishing parallel installs.
    tag: String,
    /// Cgroup hierarchy mount point.
    cgroup_path: PathBuf,
}

impl Default for ArborConfig {
    fn default() -> Self {
        Self {
            depot: PathBuf::from("/var/run/arbor/depot"),
            runtime_bin: PathBuf::from("runc"),
            network_hook_bin: PathBuf::from("/usr/local/bin/arbor-net"),
            tar_helper_bin: PathBuf::from("/usr/local/bin/arbor-tar"),
            tar_bin: PathBuf::from("tar"),
            rootfs: None,
            network_pool: DEFAULT_NETWORK_POOL.to_string(),
            port_pool_start: DEFAULT_PORT_POOL_START,
            port_pool_size: DEFAULT_PORT_POOL_SIZE,
            mtu: DEFAULT_MTU,
            external_ip: "127.0.0.1".to_string(),
            deny_networks: Vec::new(),
            allow_host_access: false,
            tag: "g0".to_string(),
            cgroup_path: PathBuf::from("/sys/fs/cgroup"),
        }
    }
}

fn parse_args() -> Result<ArborConfig, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = ArborConfig::default();

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        if flag == "--help" || flag == "-h" {
            return Err(usage());
        }
        let value = args
            .get(i + 1)
            .ok_or_else(|| format!("{flag} requires a value"))?
            .clone();
        match flag {
            "--config" => {
                let raw = std::fs::read_to_string(&value)
                    .map_err(|e| format!("cannot read {value}: {e}"))?;
                config = serde_json::from_str(&raw)
                    .map_err(|e| format!("cannot parse {value}: {e}"))?;
            }
            "--depot" => config.depot = PathBuf::from(value),
            "--runtime-bin" => config.runtime_bin = PathBuf::from(value),
            "--network-hook-bin" => config.network_hook_bin = PathBuf::from(value),
            "--tar-helper-bin" => config.tar_helper_bin = PathBuf::from(value),
            "--tar-bin" => config.tar_bin = PathBuf::from(value),
            "--rootfs" => config.rootfs = Some(PathBuf::from(value)),
            "--network-pool" => config.network_pool = value,
            "--port-pool-start" => {
                config.port_pool_start =
                    value.parse().map_err(|_| "malformed --port-pool-start".to_string())?;
            }
            "--port-pool-size" => {
                config.port_pool_size = value.parse().map_err(|_| "malformed --port-pool-size".to_string())?;
            }
            "--mtu" => config.mtu = value.parse().map_err(|_| "malformed --mtu".to_string())?,
            "--external-ip" => config.external_ip = value,
            "--deny-network" => config.deny_networks.push(value),
            "--allow-host-access" => {
                config.allow_host_access =
                    value.parse().map_err(|_| "malformed --allow-host-access".to_string())?;
            }
            "--tag" => config.tag = value,
            "--cgroup-path" => config.cgroup_path = PathBuf::from(value),
            other => return Err(format!("unknown flag: {other}\n\n{}", usage())),
        }
        i += 2;
    }
    Ok(config)
}

fn usage() -> String {
    "arbord - container supervisor daemon\n\n\
     Options:\n\
       --config PATH             load configuration from a JSON file\n\
       --depot PATH              bundle store directory\n\
       --runtime-bin PATH        OCI runtime binary (default: runc)\n\
       --network-hook-bin PATH   network configuration hook binary\n\
       --tar-helper-bin PATH     namespace-entering tar helper binary\n\
       --tar-bin PATH            tar binary for the helper\n\
       --rootfs PATH             default container rootfs\n\
       --network-pool CIDR       dynamic subnet pool (default: 10.254.0.0/22)\n\
       --port-pool-start PORT    first mapped host port (default: 60000)\n\
       --port-pool-size N        mapped host port count (default: 5000)\n\
       --mtu N                   container interface MTU (default: 1500)\n\
       --external-ip IP          IP reaching mapped ports\n\
       --deny-network CIDR       repeatable; networks containers may not reach\n\
       --allow-host-access BOOL  allow containers to reach the host\n\
       --tag NAME                identifier for parallel installs (default: g0)\n\
       --cgroup-path PATH        cgroup hierarchy root"
        .to_string()
}

// =============================================================================
// Identity Mappings
// =============================================================================

/// Root maps to the host's overflow uid; everything else maps through
/// one-to-one shifted by nothing, mirroring a conventional unprivileged
/// container setup.
fn default_id_mappings() -> Vec<IdMap> {
    let max_id = std::fs::read_to_string("/proc/sys/kernel/overflowuid")
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .unwrap_or(65534);
    vec![
        IdMap {
            container_id: 0,
            host_id: max_id,
            size: 1,
        },
        IdMap {
            container_id: 1,
            host_id: 1,
            size: max_id - 1,
        },
    ]
}

// =============================================================================
// Bundle Bases
// =============================================================================

fn base_bundle(rootfs: &Option<PathBuf>) -> Bundle {
    Bundle::default()
        .with_rootfs(rootfs.clone().unwrap_or_default())
        .with_hostname("container")
        .with_namespaces([
            Namespace::of(Namespace::NETWORK),
            Namespace::of(Namespace::PID),
            Namespace::of(Namespace::UTS),
            Namespace::of(Namespace::IPC),
            Namespace::of(Namespace::MOUNT),
        ])
        .with_process(Process::new("/bin/sh", ["-c", r#"echo "Pid 1 Running"; read x"#]))
        .with_mounts([
            Mount {
                destination: PathBuf::from("/proc"),
                kind: "proc".to_string(),
                source: PathBuf::from("proc"),
                options: vec![],
            },
            Mount {
                destination: PathBuf::from("/dev/shm"),
                kind: "tmpfs".to_string(),
                source: PathBuf::from("tmpfs"),
                options: vec![],
            },
            Mount {
                destination: PathBuf::from("/dev/pts"),
                kind: "devpts".to_string(),
                source: PathBuf::from("devpts"),
                options: vec![
                    "nosuid".to_string(),
                    "noexec".to_string(),
                    "newinstance".to_string(),
                    "ptmxmode=0666".to_string(),
                    "mode=0620".to_string(),
                ],
            },
        ])
        .with_devices([
            Device::char("/dev/null", 1, 3),
            Device::char("/dev/tty", 5, 0),
            Device::char("/dev/random", 1, 8),
            Device::char("/dev/urandom", 1, 9),
            Device::char("/dev/zero", 1, 5),
            Device::char("/dev/full", 1, 7),
        ])
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match parse_args() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "arbord failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ArborConfig) -> arbor::Result<()> {
    let network_pool = config
        .network_pool
        .parse()
        .map_err(|_| arbor::Error::Validation(format!("bad network pool {}", config.network_pool)))?;
    let external_ip = config
        .external_ip
        .parse()
        .map_err(|_| arbor::Error::Validation(format!("bad external IP {}", config.external_ip)))?;
    let mut deny_networks = Vec::new();
    for raw in &config.deny_networks {
        deny_networks.push(raw.parse().map_err(|_| {
            arbor::Error::Validation(format!("bad deny network {raw}"))
        })?);
    }

    let interface_prefix = format!("{}b-", config.tag);
    let chain_prefix = format!("{}--", config.tag);

    let runner = Arc::new(HostCommandRunner::new());
    let properties = Arc::new(PropertyManager::new());
    let events = Arc::new(EventStore::new());
    let mkdirer = Arc::new(HostMkdirer);

    // Network stack.
    let iptables = Arc::new(Iptables::new(runner.clone(), chain_prefix.clone()));
    let networker = Arc::new(NetworkAllocator::new(
        Arc::new(SubnetPool::new(network_pool)),
        Arc::new(PortPool::new(config.port_pool_start, config.port_pool_size)?),
        ConfigCreator::new(interface_prefix.clone(), chain_prefix, external_ip, config.mtu),
        Arc::new(HostConfigurer::new(runner.clone(), iptables.clone())),
        properties.clone(),
        Arc::new(IptablesPortForwarder::new(iptables.clone())),
        Arc::new(IptablesFirewallOpener::new(iptables.clone())),
        config.network_hook_bin.clone(),
    ));

    // Containerizer stack.
    let id_mappings = default_id_mappings();
    let root_host_id = arbor::spec::map_id(&id_mappings, 0);
    let base = base_bundle(&config.rootfs);
    let template = Arc::new(BundleTemplate::new(vec![
        Box::new(BaseTemplateRule {
            privileged_base: base.clone(),
            unprivileged_base: base
                .with_namespace(Namespace::of(Namespace::USER))
                .with_uid_mappings(id_mappings.clone())
                .with_gid_mappings(id_mappings),
        }),
        Box::new(RootfsRule {
            container_root_uid: root_host_id,
            container_root_gid: root_host_id,
            mkdirer: mkdirer.clone(),
        }),
        Box::new(LimitsRule),
        Box::new(NetworkHookRule {
            log_file_pattern: config
                .depot
                .join("%s")
                .join(arbor::constants::NETWORK_LOG_FILE)
                .display()
                .to_string(),
        }),
        Box::new(BindMountsRule),
        Box::new(EnvRule),
    ]));

    let uid_gen = Arc::new(UuidGenerator);
    let driver = Arc::new(RuntimeDriver::new(
        runner.clone(),
        RuncBinary::new(config.runtime_bin.clone()),
        uid_gen.clone(),
        ExecPreparer::new(Arc::new(PasswdUserLookup), mkdirer),
    ));
    let containerizer = Arc::new(DepotContainerizer::new(
        Arc::new(Depot::new(config.depot.clone())?),
        template,
        driver,
        events,
        CgroupReader::new(config.cgroup_path.clone()),
        Arc::new(HelperTarStreamer::new(
            config.tar_helper_bin.clone(),
            config.tar_bin.clone(),
            runner.clone(),
        )),
    ));

    let starters: Vec<Box<dyn Starter>> = vec![
        Box::new(CgroupStarter::new(config.cgroup_path.clone(), runner.clone())),
        Box::new(IptablesStarter::new(
            iptables,
            config.allow_host_access,
            interface_prefix,
            deny_networks,
        )),
    ];

    let supervisor = Supervisor::new(
        uid_gen,
        starters,
        Arc::new(PassthroughRootfsProvider::new(config.rootfs.clone())),
        networker,
        containerizer,
        properties,
    );

    supervisor.start().await?;
    info!(depot = %config.depot.display(), "arbord started");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sighup.recv() => info!("received SIGHUP"),
    }
    info!("arbord stopping");
    Ok(())
}
