//! The orchestrator.
//!
//! [`Supervisor`] composes handle generation, root filesystem
//! provisioning, network allocation, and containerization into the
//! externally visible operations. Creation is all-or-nothing: when a step
//! fails, the compensating action of every completed step runs in reverse
//! order and the caller sees the original error with no resources left
//! behind. Destruction attempts every step and reports the first failure
//! after trying them all, which keeps it idempotent and safe to re-run on
//! partially constructed containers.

use crate::error::{Error, Result};
use crate::net::iptables::NetOutRule;
use crate::properties::PropertyManager;
use crate::runtime::process::TrackedProcess;
use crate::spec::{
    ActualContainerSpec, ContainerInfo, ContainerMetrics, ContainerSpec, DesiredContainerSpec,
    NetworkHooks, PortMapping, ProcessIo, ProcessSpec, StreamInSpec, StreamOutSpec,
};
use crate::uid::UidGenerator;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::task::JoinSet;
use tracing::{info, warn};

// =============================================================================
// Collaborator Contracts
// =============================================================================

/// Work run once at daemon startup, before any request is served.
#[async_trait]
pub trait Starter: Send + Sync {
    async fn start(&self) -> Result<()>;
}

/// The bundle/process supervisor the orchestrator drives.
#[async_trait]
pub trait Containerizer: Send + Sync {
    async fn create(&self, spec: DesiredContainerSpec) -> Result<()>;
    async fn run(&self, handle: &str, spec: ProcessSpec, io: ProcessIo)
        -> Result<TrackedProcess>;
    async fn stop(&self, handle: &str, kill: bool) -> Result<()>;
    async fn stream_in(
        &self,
        handle: &str,
        spec: StreamInSpec,
        source: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()>;
    async fn stream_out(
        &self,
        handle: &str,
        spec: StreamOutSpec,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;
    async fn destroy(&self, handle: &str) -> Result<()>;
    async fn info(&self, handle: &str) -> Result<ActualContainerSpec>;
    async fn metrics(&self, handle: &str) -> Result<ContainerMetrics>;
    async fn handles(&self) -> Result<Vec<String>>;
}

/// The network allocator the orchestrator drives.
#[async_trait]
pub trait Networker: Send + Sync {
    /// Allocates networking for a handle and returns the hook commands the
    /// runtime must invoke around container setup and teardown.
    async fn network(&self, handle: &str, network_spec: &str) -> Result<NetworkHooks>;
    async fn destroy(&self, handle: &str) -> Result<()>;
    async fn net_in(&self, handle: &str, host_port: u16, container_port: u16)
        -> Result<(u16, u16)>;
    async fn net_out(&self, handle: &str, rule: NetOutRule) -> Result<()>;
    /// Re-registers persisted allocations after a daemon restart.
    async fn restore(&self, handles: &[String]) -> Result<()>;
}

/// Provisions and reclaims container root filesystems.
#[async_trait]
pub trait RootfsProvider: Send + Sync {
    /// Returns the concrete rootfs path plus environment entries to inject
    /// into the container.
    async fn create(
        &self,
        handle: &str,
        rootfs: &str,
        privileged: bool,
        disk_quota_bytes: u64,
    ) -> Result<(PathBuf, Vec<String>)>;

    async fn destroy(&self, handle: &str) -> Result<()>;
}

// =============================================================================
// Supervisor
// =============================================================================

/// The top-level container supervisor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    uid_gen: Arc<dyn UidGenerator>,
    starters: Vec<Box<dyn Starter>>,
    rootfs: Arc<dyn RootfsProvider>,
    networker: Arc<dyn Networker>,
    containerizer: Arc<dyn Containerizer>,
    properties: Arc<PropertyManager>,
}

impl Supervisor {
    pub fn new(
        uid_gen: Arc<dyn UidGenerator>,
        starters: Vec<Box<dyn Starter>>,
        rootfs: Arc<dyn RootfsProvider>,
        networker: Arc<dyn Networker>,
        containerizer: Arc<dyn Containerizer>,
        properties: Arc<PropertyManager>,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                uid_gen,
                starters,
                rootfs,
                networker,
                containerizer,
                properties,
            }),
        }
    }

    /// Runs the registered starters in sequence, then re-registers any
    /// recoverable network state for depot entries that survived a
    /// restart. Must complete before the first request is accepted.
    pub async fn start(&self) -> Result<()> {
        for starter in &self.inner.starters {
            starter.start().await?;
        }
        let handles = self.inner.containerizer.handles().await?;
        if !handles.is_empty() {
            self.inner.networker.restore(&handles).await?;
        }
        Ok(())
    }

    /// Creates a container and returns its proxy.
    pub async fn create(&self, spec: ContainerSpec) -> Result<Container> {
        let handle = match &spec.handle {
            Some(handle) if !handle.is_empty() => handle.clone(),
            _ => self.inner.uid_gen.generate(),
        };
        if self.inner.containerizer.handles().await?.contains(&handle) {
            return Err(Error::HandleAlreadyExists(handle));
        }
        info!(handle, "creating container");

        let (rootfs_path, rootfs_env) = self
            .inner
            .rootfs
            .create(
                &handle,
                &spec.rootfs,
                spec.privileged,
                spec.limits.disk_limit_bytes,
            )
            .await
            .map_err(|err| err.in_create_step("rootfs"))?;

        let network_hooks = match self.inner.networker.network(&handle, &spec.network).await {
            Ok(hooks) => hooks,
            Err(err) => {
                self.compensate(&handle, CreatedSteps::ROOTFS).await;
                return Err(err.in_create_step("network"));
            }
        };

        let mut env = spec.env.clone();
        env.extend(rootfs_env);
        let desired = DesiredContainerSpec {
            handle: handle.clone(),
            rootfs_path,
            privileged: spec.privileged,
            env,
            bind_mounts: spec.bind_mounts.clone(),
            limits: spec.limits,
            network_hooks: Some(network_hooks),
        };
        if let Err(err) = self.inner.containerizer.create(desired).await {
            self.compensate(&handle, CreatedSteps::ROOTFS | CreatedSteps::NETWORK)
                .await;
            return Err(err.in_create_step("containerize"));
        }

        let mut property_error = None;
        for (key, value) in &spec.properties {
            if let Err(err) = self.inner.properties.set(&handle, key, value) {
                property_error = Some(err);
                break;
            }
        }
        if let Some(err) = property_error {
            self.compensate(
                &handle,
                CreatedSteps::ROOTFS | CreatedSteps::NETWORK | CreatedSteps::CONTAINER,
            )
            .await;
            return Err(err.in_create_step("properties"));
        }

        info!(handle, "container created");
        Ok(self.container(handle))
    }

    /// Runs the compensating action of each completed step, newest first.
    async fn compensate(&self, handle: &str, steps: CreatedSteps) {
        warn!(handle, "create failed, compensating completed steps");
        if steps.contains(CreatedSteps::CONTAINER) {
            if let Err(err) = self.inner.containerizer.destroy(handle).await {
                warn!(handle, error = %err, "containerizer compensation failed");
            }
        }
        if steps.contains(CreatedSteps::NETWORK) {
            if let Err(err) = self.inner.networker.destroy(handle).await {
                warn!(handle, error = %err, "network compensation failed");
            }
        }
        if steps.contains(CreatedSteps::ROOTFS) {
            if let Err(err) = self.inner.rootfs.destroy(handle).await {
                warn!(handle, error = %err, "rootfs compensation failed");
            }
        }
        if let Err(err) = self.inner.properties.remove_all(handle) {
            warn!(handle, error = %err, "property compensation failed");
        }
    }

    /// Destroys a container, attempting every cleanup step.
    pub async fn destroy(&self, handle: &str) -> Result<()> {
        let known = self
            .inner
            .containerizer
            .handles()
            .await?
            .contains(&handle.to_string());
        if !known {
            return Err(Error::HandleNotFound(handle.to_string()));
        }
        info!(handle, "destroying container");

        let mut first_error = None;
        record_failure(
            &mut first_error,
            "containerizer",
            handle,
            self.inner.containerizer.destroy(handle).await,
        );
        record_failure(
            &mut first_error,
            "network",
            handle,
            self.inner.networker.destroy(handle).await,
        );
        record_failure(
            &mut first_error,
            "rootfs",
            handle,
            self.inner.rootfs.destroy(handle).await,
        );
        record_failure(
            &mut first_error,
            "properties",
            handle,
            self.inner.properties.remove_all(handle),
        );

        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Returns the proxy of an existing container.
    pub async fn lookup(&self, handle: &str) -> Result<Container> {
        let known = self
            .inner
            .containerizer
            .handles()
            .await?
            .contains(&handle.to_string());
        if !known {
            return Err(Error::HandleNotFound(handle.to_string()));
        }
        Ok(self.container(handle.to_string()))
    }

    /// Lists the handles whose properties are a superset of `filter`.
    /// An empty filter lists every depot entry.
    pub async fn containers(&self, filter: &HashMap<String, String>) -> Result<Vec<String>> {
        let handles = self.inner.containerizer.handles().await?;
        if filter.is_empty() {
            return Ok(handles);
        }
        let mut matching = Vec::new();
        for handle in handles {
            let properties = self.inner.properties.all(&handle)?;
            let matches = filter
                .iter()
                .all(|(k, v)| properties.get(k).is_some_and(|have| have == v));
            if matches {
                matching.push(handle);
            }
        }
        Ok(matching)
    }

    /// Fetches `Info` for many handles concurrently. Per-handle failures
    /// land in the map instead of failing the batch.
    pub async fn bulk_info(
        &self,
        handles: &[String],
    ) -> Result<HashMap<String, Result<ContainerInfo>>> {
        let mut tasks = JoinSet::new();
        for handle in handles {
            let supervisor = self.clone();
            let handle = handle.clone();
            tasks.spawn(async move {
                let info = supervisor.container(handle.clone()).info().await;
                (handle, info)
            });
        }
        let mut results = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (handle, info) =
                joined.map_err(|e| Error::Internal(format!("bulk info task: {e}")))?;
            results.insert(handle, info);
        }
        Ok(results)
    }

    /// Fetches metrics for many handles concurrently, per-handle errors
    /// alongside per-handle data.
    pub async fn bulk_metrics(
        &self,
        handles: &[String],
    ) -> Result<HashMap<String, Result<ContainerMetrics>>> {
        let mut tasks = JoinSet::new();
        for handle in handles {
            let supervisor = self.clone();
            let handle = handle.clone();
            tasks.spawn(async move {
                let metrics = supervisor.inner.containerizer.metrics(&handle).await;
                (handle, metrics)
            });
        }
        let mut results = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (handle, metrics) =
                joined.map_err(|e| Error::Internal(format!("bulk metrics task: {e}")))?;
            results.insert(handle, metrics);
        }
        Ok(results)
    }

    fn container(&self, handle: String) -> Container {
        Container {
            handle,
            inner: self.inner.clone(),
        }
    }
}

fn record_failure(first: &mut Option<Error>, step: &str, handle: &str, result: Result<()>) {
    if let Err(err) = result {
        warn!(handle, step, error = %err, "destroy step failed");
        if first.is_none() {
            *first = Some(err);
        }
    }
}

/// Which creation steps have completed, for compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CreatedSteps(u8);

impl CreatedSteps {
    const ROOTFS: Self = Self(1);
    const NETWORK: Self = Self(2);
    const CONTAINER: Self = Self(4);

    fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CreatedSteps {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// =============================================================================
// Container Proxy
// =============================================================================

/// Caller-facing handle to one container. Cheap to clone; every operation
/// delegates to the owning subsystem keyed by the handle.
#[derive(Clone)]
pub struct Container {
    handle: String,
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container").field("handle", &self.handle).finish()
    }
}

impl Container {
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Runs a process inside the container.
    pub async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<TrackedProcess> {
        self.inner.containerizer.run(&self.handle, spec, io).await
    }

    /// Signals the container's processes; `kill` selects SIGKILL over
    /// SIGTERM.
    pub async fn stop(&self, kill: bool) -> Result<()> {
        self.inner.containerizer.stop(&self.handle, kill).await
    }

    /// Unpacks a tar stream into the container.
    pub async fn stream_in(
        &self,
        spec: StreamInSpec,
        source: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()> {
        self.inner
            .containerizer
            .stream_in(&self.handle, spec, source)
            .await
    }

    /// Packs a path inside the container into a tar stream.
    pub async fn stream_out(
        &self,
        spec: StreamOutSpec,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        self.inner.containerizer.stream_out(&self.handle, spec).await
    }

    /// Maps a host port to a container port.
    pub async fn net_in(&self, host_port: u16, container_port: u16) -> Result<(u16, u16)> {
        self.inner
            .networker
            .net_in(&self.handle, host_port, container_port)
            .await
    }

    /// Opens outbound traffic.
    pub async fn net_out(&self, rule: NetOutRule) -> Result<()> {
        self.inner.networker.net_out(&self.handle, rule).await
    }

    /// Assembles the container snapshot from the containerizer, the
    /// property store, and the persisted network record.
    pub async fn info(&self) -> Result<ContainerInfo> {
        let actual = self.inner.containerizer.info(&self.handle).await?;
        let properties = self.inner.properties.all(&self.handle)?;

        let mapped_ports: Vec<PortMapping> = match properties
            .get(crate::constants::MAPPED_PORTS_PROPERTY)
        {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };

        Ok(ContainerInfo {
            bundle_path: actual.bundle_path,
            events: actual.events,
            container_ip: properties
                .get(crate::constants::CONTAINER_IP_PROPERTY)
                .cloned(),
            bridge_ip: properties.get(crate::constants::BRIDGE_IP_PROPERTY).cloned(),
            external_ip: properties
                .get(crate::constants::EXTERNAL_IP_PROPERTY)
                .cloned(),
            mapped_ports,
            properties,
            cpu_shares: actual.cpu_shares,
        })
    }

    /// Reads current cgroup counters.
    pub async fn metrics(&self) -> Result<ContainerMetrics> {
        self.inner.containerizer.metrics(&self.handle).await
    }

    pub fn set_property(&self, key: &str, value: &str) -> Result<()> {
        self.inner.properties.set(&self.handle, key, value)
    }

    pub fn property(&self, key: &str) -> Result<Option<String>> {
        self.inner.properties.get(&self.handle, key)
    }

    pub fn properties(&self) -> Result<HashMap<String, String>> {
        self.inner.properties.all(&self.handle)
    }

    pub fn remove_property(&self, key: &str) -> Result<()> {
        self.inner.properties.remove(&self.handle, key)
    }
}
