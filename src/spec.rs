//! Caller-facing value types for the supervisor API.
//!
//! These records cross the boundary between the orchestrator and its
//! subsystems: `ContainerSpec` is what a caller hands to `Supervisor::create`,
//! `DesiredContainerSpec` is the fully resolved form the containerizer
//! consumes, and the `Info`/`Metrics` types are what flows back out.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};

// =============================================================================
// Container Creation
// =============================================================================

/// Caller request to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Stable identifier; generated when empty.
    pub handle: Option<String>,
    /// Root filesystem location handed to the rootfs provider.
    pub rootfs: String,
    /// Whether the container runs without a user namespace.
    pub privileged: bool,
    /// Container-wide environment, `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// Host directories bound into the container.
    pub bind_mounts: Vec<BindMount>,
    /// Resource limits.
    pub limits: Limits,
    /// Network selector: empty, a CIDR, or a host IP.
    pub network: String,
    /// Arbitrary properties applied after creation.
    pub properties: HashMap<String, String>,
}

/// A host directory bound into the container filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Path on the host.
    pub src_path: PathBuf,
    /// Path inside the container.
    pub dst_path: PathBuf,
    /// Mount read-only.
    pub read_only: bool,
}

/// Resource limits attached to a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Relative cpu weight; 0 leaves the runtime default.
    pub cpu_shares: u64,
    /// Memory ceiling in bytes; 0 means unlimited.
    pub memory_limit_bytes: u64,
    /// Disk quota in bytes, enforced by the rootfs provider; 0 means none.
    pub disk_limit_bytes: u64,
    /// Relative block-I/O weight; 0 leaves the runtime default.
    pub blkio_weight: u16,
}

/// Fully resolved container description consumed by the containerizer.
///
/// Produced by the supervisor after the rootfs provider and the network
/// allocator have run: the rootfs is a concrete path and the network
/// configuration step is expressed as hook commands.
#[derive(Debug, Clone, Default)]
pub struct DesiredContainerSpec {
    pub handle: String,
    /// Concrete root filesystem path.
    pub rootfs_path: PathBuf,
    pub privileged: bool,
    /// Container-wide environment, rootfs-provider entries included.
    pub env: Vec<String>,
    pub bind_mounts: Vec<BindMount>,
    pub limits: Limits,
    /// Out-of-band network configuration commands the runtime must invoke
    /// between namespace creation and pivot_root, and after teardown.
    pub network_hooks: Option<NetworkHooks>,
}

/// The pair of commands the runtime runs around container setup/teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHooks {
    pub prestart: HookCommand,
    pub poststop: HookCommand,
}

/// A single hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookCommand {
    pub path: PathBuf,
    pub args: Vec<String>,
}

// =============================================================================
// Process Execution
// =============================================================================

/// Specification of a process to run inside a container.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Program path inside the container.
    pub path: String,
    /// Program arguments, not including the program itself.
    pub args: Vec<String>,
    /// Additional environment, `KEY=VALUE`; wins over the container env.
    pub env: Vec<String>,
    /// Working directory inside the container; defaults to `/`.
    pub cwd: Option<String>,
    /// User to run as, looked up in the container's /etc/passwd.
    pub user: Option<String>,
    /// Resource limit overrides for this process.
    pub rlimits: Vec<Rlimit>,
}

/// A POSIX resource limit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rlimit {
    /// Limit name, e.g. `RLIMIT_NOFILE`.
    #[serde(rename = "type")]
    pub kind: String,
    pub hard: u64,
    pub soft: u64,
}

/// Caller-supplied stdio sinks and source for a tracked process.
///
/// Each stream is optional; absent streams are discarded.
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl std::fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

// =============================================================================
// Streaming
// =============================================================================

/// Destination of a tar stream pushed into a container.
#[derive(Debug, Clone)]
pub struct StreamInSpec {
    /// Directory inside the container to unpack into.
    pub path: String,
    /// User owning the unpacked files.
    pub user: String,
}

/// Source of a tar stream pulled out of a container.
#[derive(Debug, Clone)]
pub struct StreamOutSpec {
    /// File or directory inside the container to pack.
    pub path: String,
    /// User reading the files.
    pub user: String,
}

// =============================================================================
// Introspection
// =============================================================================

/// Containerizer-level view of a live container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActualContainerSpec {
    /// Depot directory of the container bundle.
    pub bundle_path: PathBuf,
    /// Events surfaced by the runtime.
    pub events: Vec<String>,
    /// CPU shares read back from the cgroup hierarchy.
    pub cpu_shares: u64,
}

/// Snapshot of a live container, assembled from the depot, the event store,
/// the cgroup hierarchy, and the persisted network record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Depot directory of the container bundle.
    pub bundle_path: PathBuf,
    /// Events surfaced by the runtime, e.g. `"Out of memory"`.
    pub events: Vec<String>,
    /// IP assigned to the container, when networked.
    pub container_ip: Option<String>,
    /// Gateway IP on the bridge, when networked.
    pub bridge_ip: Option<String>,
    /// External IP reaching the container's mapped ports.
    pub external_ip: Option<String>,
    /// Host-port to container-port mappings.
    pub mapped_ports: Vec<PortMapping>,
    /// Arbitrary properties attached to the container.
    pub properties: HashMap<String, String>,
    /// CPU shares read back from the cgroup hierarchy.
    pub cpu_shares: u64,
}

/// A single host-to-container port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// Cgroup counters read back through the runtime's stats verb.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetrics {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
}

/// CPU usage counters in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuStats {
    pub usage: u64,
    pub system: u64,
    pub user: u64,
}

/// Memory usage counters in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStats {
    pub total_rss: u64,
    pub total_cache: u64,
    pub total_inactive_file: u64,
    pub total_mapped_file: u64,
    pub total_swap: u64,
    /// Derived: rss plus the page-cache share that counts toward the limit.
    #[serde(skip_deserializing)]
    pub total_usage_toward_limit: u64,
}

impl MemoryStats {
    /// Recomputes the derived usage-toward-limit counter.
    pub fn with_usage_toward_limit(mut self) -> Self {
        self.total_usage_toward_limit =
            self.total_rss + (self.total_cache - self.total_inactive_file.min(self.total_cache));
        self
    }
}

// =============================================================================
// UID/GID Mappings
// =============================================================================

/// One user-namespace identity mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMap {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

/// Maps a container id to its host id through a mapping list.
///
/// Returns the id unchanged when no mapping covers it, which is the
/// behaviour of an absent user namespace.
pub fn map_id(mappings: &[IdMap], id: u32) -> u32 {
    for m in mappings {
        if id >= m.container_id && id < m.container_id + m.size {
            return m.host_id + (id - m.container_id);
        }
    }
    id
}
