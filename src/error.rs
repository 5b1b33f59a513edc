//! Error types for the container supervisor.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the container supervisor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Caller input was rejected before any resource was touched.
    #[error("invalid input: {0}")]
    Validation(String),

    /// A dynamic subnet was requested together with a static IP.
    #[error("a static IP cannot be requested from a dynamic subnet")]
    InconsistentNetworkSpec,

    // =========================================================================
    // Collision Errors
    // =========================================================================
    /// Container handle already present in the depot.
    #[error("container already exists: {0}")]
    HandleAlreadyExists(String),

    /// The requested IP is already held by another container.
    #[error("IP {ip} is already acquired in subnet {subnet}")]
    IpAlreadyAcquired { subnet: String, ip: String },

    // =========================================================================
    // Not-Found Errors
    // =========================================================================
    /// No depot entry for the handle.
    #[error("container not found: {0}")]
    HandleNotFound(String),

    /// A released IP was not held in the pool.
    #[error("IP {ip} is not allocated in subnet {subnet}")]
    IpNotAllocated { subnet: String, ip: String },

    /// A released or removed port was outside the pool range.
    #[error("port {0} is not managed by this pool")]
    PortNotFound(u16),

    /// Per-handle cgroup data is missing from the hierarchy.
    #[error("no cgroup found for container: {0}")]
    CgroupNotFound(String),

    // =========================================================================
    // Exhaustion Errors
    // =========================================================================
    /// No /30 left in the dynamic allocation range.
    #[error("no free subnets remain in the dynamic allocation range")]
    SubnetPoolExhausted,

    /// No host address left inside a subnet.
    #[error("no free IP addresses remain in subnet {0}")]
    IpPoolExhausted(String),

    /// No port left in the ephemeral range.
    #[error("no free ports remain in the port pool")]
    PortPoolExhausted,

    // =========================================================================
    // External-Process Errors
    // =========================================================================
    /// The runtime binary exited non-zero; `message` carries the exit status
    /// and, when the runtime log yielded one, its last log message.
    #[error("runc {verb}: {message}")]
    Runtime { verb: String, message: String },

    /// A helper command (iptables, ip, mount, tar helper) failed.
    #[error("command '{program}' failed with status {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: i32,
        stderr: String,
    },

    /// A helper command could not be spawned at all.
    #[error("failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // Orchestration Errors
    // =========================================================================
    /// A container creation step failed; earlier steps have been compensated.
    #[error("create: {step}: {source}")]
    CreateFailed {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// The depot entry could not be written.
    #[error("failed to create depot entry at {path}: {reason}")]
    DepotCreateFailed { path: PathBuf, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wraps an error with the name of the failing creation step.
    pub fn in_create_step(self, step: &'static str) -> Self {
        Error::CreateFailed {
            step,
            source: Box::new(self),
        }
    }
}
