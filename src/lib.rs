//! # arbor
//!
//! **Linux container supervisor driving an external OCI runtime**
//!
//! This crate is the long-running brain of a container host: it accepts
//! requests to create, introspect, manipulate, and destroy containers,
//! and delegates the namespace/cgroup mechanics to an OCI-compliant
//! runtime binary invoked as a child process. Callers identify containers
//! by a stable string handle.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Supervisor                              │
//! │   create / destroy / lookup / containers / bulk info+metrics    │
//! │   all-or-nothing creation, reverse-order compensation           │
//! ├───────────────────┬─────────────────────┬───────────────────────┤
//! │  Containerizer    │  Network Allocator  │  Rootfs Provider      │
//! │  depot of bundles │  subnet + IP pools  │  (external contract)  │
//! │  bundle rules     │  port pool          │                       │
//! │  event watcher    │  iptables chains    │                       │
//! ├───────────────────┴─────────────────────┴───────────────────────┤
//! │                      Runtime Driver                             │
//! │   start / exec / state / kill / delete / events / stats         │
//! │   structured-log forwarding, process tracking via pid files     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! A container is born from an ordered pipeline: handle assignment, rootfs
//! provisioning, subnet/IP/bridge allocation, bundle construction from
//! pure rules, and a detached runtime `start` checked against the
//! runtime's `state` verb under a bounded deadline. Any failure unwinds
//! the completed steps in reverse, so the caller observes either a live
//! container or an unchanged host.
//!
//! Destruction converges disk and runtime even across supervisor
//! restarts: network state is persisted per handle under reserved
//! property keys and read back to drive teardown in a fixed order.

pub mod bundle;
pub mod cgroup;
pub mod command;
pub mod constants;
pub mod containerizer;
pub mod depot;
pub mod error;
pub mod events;
pub mod mkdir;
pub mod net;
pub mod properties;
pub mod retrier;
pub mod rootfs;
pub mod runtime;
pub mod spec;
pub mod supervisor;
pub mod uid;

pub use error::{Error, Result};
pub use spec::{
    ActualContainerSpec, BindMount, ContainerInfo, ContainerMetrics, ContainerSpec,
    DesiredContainerSpec, Limits, NetworkHooks, PortMapping, ProcessIo, ProcessSpec,
};
pub use supervisor::{Container, Containerizer, Networker, RootfsProvider, Starter, Supervisor};
