//! Driving of the external OCI runtime binary.
//!
//! The runtime implements the container mechanics; this module owns the
//! conversation with it:
//!
//! - [`binary`] phrases the runtime's verbs as argument vectors,
//! - [`logs`] parses the structured log files the runtime writes,
//! - [`exec`] prepares per-exec `process.json` specs,
//! - [`process`] tracks long-lived runtime children and their stdio,
//! - [`driver`] ties the pieces into the [`ContainerRuntime`] operations
//!   the containerizer consumes.

pub mod binary;
pub mod driver;
pub mod exec;
pub mod logs;
pub mod process;

pub use binary::{RuncBinary, RuncCommands};
pub use driver::{ContainerRuntime, RuntimeDriver, State, Status};
pub use exec::{ExecPreparer, ExecUser, PasswdUserLookup, UserLookup, compose_env};
pub use process::{ProcessTracker, TrackedProcess};
