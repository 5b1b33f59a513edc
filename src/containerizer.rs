//! Bundle and process supervision.
//!
//! The containerizer composes the depot, the bundle pipeline, and the
//! runtime driver into container-level operations:
//!
//! - `create` writes the bundle into the depot, starts the container
//!   detached, waits for the runtime to report state within a bounded
//!   deadline, and parents an event watcher to the container's lifetime.
//! - `destroy` converges disk and runtime: kill when running, delete under
//!   the bounded retrier, then remove the depot entry. A handle the
//!   runtime has never heard of still removes cleanly.
//! - `stream_in`/`stream_out` shuttle tar streams through the external
//!   namespace-entering helper, addressed by the container's init pid.

use crate::command::{CommandRunner, CommandSpec, StdioConfig};
use crate::bundle::BundleTemplate;
use crate::cgroup::CgroupReader;
use crate::constants::{
    DELETE_RETRY_ATTEMPTS, DELETE_RETRY_INTERVAL, START_POLL_INTERVAL, START_TIMEOUT,
};
use crate::depot::Depot;
use crate::error::{Error, Result};
use crate::events::{EventSink, EventStore};
use crate::retrier::Retrier;
use crate::runtime::driver::{ContainerRuntime, Status};
use crate::runtime::process::TrackedProcess;
use crate::spec::{
    ActualContainerSpec, ContainerMetrics, DesiredContainerSpec, ProcessIo, ProcessSpec,
    StreamInSpec, StreamOutSpec,
};
use crate::supervisor::Containerizer;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// Tar Streaming Helper
// =============================================================================

/// Moves tar streams in and out of a running container's namespaces.
#[async_trait]
pub trait TarStreamer: Send + Sync {
    async fn stream_in(
        &self,
        pid: i32,
        path: &str,
        user: &str,
        source: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()>;

    async fn stream_out(
        &self,
        pid: i32,
        path: &str,
        user: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// Drives the external tar helper binary, which enters the container's
/// mount namespace by pid and runs tar there.
pub struct HelperTarStreamer {
    helper_path: PathBuf,
    tar_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl HelperTarStreamer {
    pub fn new(
        helper_path: impl Into<PathBuf>,
        tar_path: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            helper_path: helper_path.into(),
            tar_path: tar_path.into(),
            runner,
        }
    }

    fn command(&self, verb: &str, pid: i32, user: &str, path: &str) -> CommandSpec {
        CommandSpec::new(self.helper_path.display().to_string())
            .arg(self.tar_path.display().to_string())
            .arg(verb)
            .arg(pid.to_string())
            .arg(user)
            .arg(path)
    }
}

#[async_trait]
impl TarStreamer for HelperTarStreamer {
    async fn stream_in(
        &self,
        pid: i32,
        path: &str,
        user: &str,
        mut source: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()> {
        let cmd = self.command("stream-in", pid, user, path);
        let mut child = self
            .runner
            .spawn(
                &cmd,
                StdioConfig {
                    stdin: true,
                    stdout: false,
                    stderr: true,
                },
            )
            .await?;

        let mut stdin = child
            .take_stdin()
            .ok_or_else(|| Error::Internal("tar helper has no stdin".to_string()))?;
        let stderr = child.take_stderr();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            buf
        });

        tokio::io::copy(&mut source, &mut stdin).await?;
        drop(stdin);

        let code = child.wait().await?;
        let stderr_buf = stderr_task.await.unwrap_or_default();
        if code != 0 {
            return Err(Error::CommandFailed {
                program: cmd.program,
                status: code,
                stderr: String::from_utf8_lossy(&stderr_buf).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn stream_out(
        &self,
        pid: i32,
        path: &str,
        user: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let cmd = self.command("stream-out", pid, user, path);
        let mut child = self
            .runner
            .spawn(
                &cmd,
                StdioConfig {
                    stdin: false,
                    stdout: true,
                    stderr: false,
                },
            )
            .await?;
        let stdout = child
            .take_stdout()
            .ok_or_else(|| Error::Internal("tar helper has no stdout".to_string()))?;
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(stdout)
    }
}

// =============================================================================
// Containerizer
// =============================================================================

/// Manages the depot of container bundles and their runtime lifecycles.
pub struct DepotContainerizer {
    depot: Arc<Depot>,
    bundler: Arc<BundleTemplate>,
    runtime: Arc<dyn ContainerRuntime>,
    events: Arc<EventStore>,
    cgroups: CgroupReader,
    tar: Arc<dyn TarStreamer>,
    delete_retrier: Retrier,
    start_retrier: Retrier,
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl DepotContainerizer {
    pub fn new(
        depot: Arc<Depot>,
        bundler: Arc<BundleTemplate>,
        runtime: Arc<dyn ContainerRuntime>,
        events: Arc<EventStore>,
        cgroups: CgroupReader,
        tar: Arc<dyn TarStreamer>,
    ) -> Self {
        let start_attempts =
            (START_TIMEOUT.as_millis() / START_POLL_INTERVAL.as_millis()).max(1) as u32;
        Self {
            depot,
            bundler,
            runtime,
            events,
            cgroups,
            tar,
            delete_retrier: Retrier::new(DELETE_RETRY_ATTEMPTS, DELETE_RETRY_INTERVAL),
            start_retrier: Retrier::new(start_attempts, START_POLL_INTERVAL),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks until the runtime answers `state` for a freshly started
    /// container, bounded by the start deadline.
    async fn wait_for_state(&self, handle: &str) -> Result<()> {
        let result = self
            .start_retrier
            .run(|| async { self.runtime.state(handle).await.map(|_| ()) })
            .await;
        result.map_err(|err| {
            warn!(handle, error = %err, "runtime state never appeared");
            Error::Timeout {
                operation: format!("waiting for runtime state of container {handle}"),
                duration: START_TIMEOUT,
            }
        })
    }

    fn spawn_watcher(&self, handle: &str) -> Result<()> {
        let runtime = self.runtime.clone();
        let sink: Arc<dyn EventSink> = self.events.clone();
        let watched = handle.to_string();
        let task = tokio::spawn(async move {
            if let Err(err) = runtime.watch_events(&watched, sink).await {
                warn!(handle = %watched, error = %err, "event watcher terminated");
            }
        });
        let mut watchers = self
            .watchers
            .lock()
            .map_err(|e| Error::Internal(format!("watcher lock poisoned: {e}")))?;
        watchers.insert(handle.to_string(), task);
        Ok(())
    }

    fn stop_watcher(&self, handle: &str) {
        if let Ok(mut watchers) = self.watchers.lock() {
            if let Some(task) = watchers.remove(handle) {
                task.abort();
            }
        }
    }

    fn remove_from_depot(&self, handle: &str) -> Result<()> {
        self.events.remove(handle);
        self.depot.destroy(handle)
    }

    /// Pid of the container's init process, required for streaming.
    async fn init_pid(&self, handle: &str) -> Result<i32> {
        let state = self.runtime.state(handle).await.map_err(|err| {
            warn!(handle, error = %err, "pid not found for container");
            Error::HandleNotFound(handle.to_string())
        })?;
        Ok(state.pid)
    }
}

#[async_trait]
impl Containerizer for DepotContainerizer {
    async fn create(&self, spec: DesiredContainerSpec) -> Result<()> {
        let handle = spec.handle.clone();
        info!(handle, "creating container");

        let bundle = self.bundler.generate(&spec)?;
        let bundle_path = self.depot.create(&handle, &bundle)?;

        let started = async {
            self.runtime.start(&bundle_path, &handle).await?;
            self.wait_for_state(&handle).await
        }
        .await;

        if let Err(err) = started {
            // The depot entry must not outlive a failed create.
            let _ = self
                .delete_retrier
                .run(|| self.runtime.delete(&handle))
                .await;
            let _ = self.remove_from_depot(&handle);
            return Err(err);
        }

        self.spawn_watcher(&handle)?;
        info!(handle, "container created");
        Ok(())
    }

    async fn run(
        &self,
        handle: &str,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<TrackedProcess> {
        debug!(handle, path = %spec.path, "running process");
        let bundle_path = self.depot.lookup(handle)?;
        self.runtime.exec(&bundle_path, handle, spec, io).await
    }

    async fn stop(&self, handle: &str, kill: bool) -> Result<()> {
        let bundle_path = self.depot.lookup(handle)?;
        let state = self.runtime.state(handle).await?;
        if state.status != Status::Running {
            return Ok(());
        }
        let signal = if kill { "KILL" } else { "TERM" };
        self.runtime.kill(&bundle_path, handle, signal).await
    }

    async fn stream_in(
        &self,
        handle: &str,
        spec: StreamInSpec,
        source: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()> {
        let pid = self.init_pid(handle).await?;
        self.tar
            .stream_in(pid, &spec.path, &spec.user, source)
            .await
            .map_err(|err| Error::Internal(format!("stream-in: {err}")))
    }

    async fn stream_out(
        &self,
        handle: &str,
        spec: StreamOutSpec,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let pid = self.init_pid(handle).await?;
        self.tar
            .stream_out(pid, &spec.path, &spec.user)
            .await
            .map_err(|err| Error::Internal(format!("stream-out: {err}")))
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        info!(handle, "destroying container");
        self.stop_watcher(handle);

        let state = match self.runtime.state(handle).await {
            Ok(state) => state,
            Err(err) => {
                debug!(handle, error = %err, "runtime state unavailable, removing depot entry");
                return self.remove_from_depot(handle);
            }
        };

        if state.status == Status::Running {
            let bundle_path = self.depot.lookup(handle)?;
            self.runtime.kill(&bundle_path, handle, "KILL").await?;
        }

        self.delete_retrier
            .run(|| self.runtime.delete(handle))
            .await?;

        self.remove_from_depot(handle)
    }

    async fn info(&self, handle: &str) -> Result<ActualContainerSpec> {
        let bundle_path = self.depot.lookup(handle)?;
        Ok(ActualContainerSpec {
            bundle_path,
            events: self.events.events(handle)?,
            cpu_shares: self.cgroups.cpu_shares(handle)?,
        })
    }

    async fn metrics(&self, handle: &str) -> Result<ContainerMetrics> {
        self.depot.lookup(handle)?;
        self.runtime.stats(handle).await
    }

    async fn handles(&self) -> Result<Vec<String>> {
        self.depot.handles()
    }
}
