//! Constants for the container supervisor.
//!
//! All limits, timeouts, defaults, and reserved keys are defined here to
//! ensure consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Timeouts
// =============================================================================

/// Deadline for the runtime to answer `state` after a detached `start`.
pub const START_TIMEOUT: Duration = Duration::from_secs(15);

/// Poll interval while waiting for the runtime state to appear.
pub const START_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Deadline for the runtime to populate a process pid file.
pub const PID_FILE_TIMEOUT: Duration = Duration::from_secs(15);

/// Poll interval while waiting for a pid file.
pub const PID_FILE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Attempts for the runtime `delete` verb during destroy.
pub const DELETE_RETRY_ATTEMPTS: u32 = 10;

/// Fixed interval between `delete` attempts.
pub const DELETE_RETRY_INTERVAL: Duration = Duration::from_millis(200);

// =============================================================================
// Network Defaults
// =============================================================================

/// Pool of dynamically allocated container subnets.
pub const DEFAULT_NETWORK_POOL: &str = "10.254.0.0/22";

/// Start of the ephemeral port range used for mapped container ports.
pub const DEFAULT_PORT_POOL_START: u16 = 60000;

/// Size of the ephemeral port range.
pub const DEFAULT_PORT_POOL_SIZE: u16 = 5000;

/// MTU for container network interfaces.
pub const DEFAULT_MTU: u32 = 1500;

/// Prefix length of the subnets carved out of the dynamic pool.
pub const DYNAMIC_SUBNET_PREFIX: u8 = 30;

// =============================================================================
// Reserved Property Keys
// =============================================================================
//
// Network state is persisted per handle under these keys so that destroy
// and daemon restart can recover the configuration.

/// Subnet CIDR allocated to the container.
pub const SUBNET_PROPERTY: &str = "kawasaki.subnet";

/// IP address assigned to the container end of the veth pair.
pub const CONTAINER_IP_PROPERTY: &str = "kawasaki.container-ip";

/// Name of the container-side interface.
pub const CONTAINER_INTERFACE_PROPERTY: &str = "kawasaki.container-interface";

/// Name of the host-side interface.
pub const HOST_INTERFACE_PROPERTY: &str = "kawasaki.host-interface";

/// Name of the bridge the host interface is enslaved to.
pub const BRIDGE_NAME_PROPERTY: &str = "kawasaki.bridge-name";

/// Gateway IP assigned to the bridge.
pub const BRIDGE_IP_PROPERTY: &str = "kawasaki.bridge-ip";

/// Per-container iptables chain suffix.
pub const IPTABLES_CHAIN_PROPERTY: &str = "kawasaki.iptables-chain";

/// External IP used to reach the container's mapped ports.
pub const EXTERNAL_IP_PROPERTY: &str = "kawasaki.external-ip";

/// Interface MTU.
pub const MTU_PROPERTY: &str = "kawasaki.mtu";

/// JSON array of host-port/container-port mappings.
pub const MAPPED_PORTS_PROPERTY: &str = "kawasaki.mapped-ports";

// =============================================================================
// Process Environment Defaults
// =============================================================================

/// PATH appended to a root (uid 0) process that does not set one.
pub const DEFAULT_ROOT_PATH: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// PATH appended to a non-root process that does not set one.
pub const DEFAULT_USER_PATH: &str = "PATH=/usr/local/bin:/usr/bin:/bin";

/// User name assumed when a process spec names none.
pub const DEFAULT_USER: &str = "root";

// =============================================================================
// Depot Layout
// =============================================================================

/// Bundle descriptor file inside each depot entry.
pub const BUNDLE_CONFIG_FILE: &str = "config.json";

/// Subdirectory for per-exec process specs and pid files.
pub const PROCESSES_DIR: &str = "processes";

/// Log file written by the network configuration hook.
pub const NETWORK_LOG_FILE: &str = "network.log";

// =============================================================================
// OCI
// =============================================================================

/// OCI Runtime Spec version written into bundle descriptors.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";
