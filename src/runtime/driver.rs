//! High-level operations against the external OCI runtime.
//!
//! Each operation phrases a verb through [`RuncBinary`], executes it via
//! the command seam, and post-processes: log files are parsed and forwarded,
//! exit statuses become typed `runc <verb>: …` errors, and JSON responses
//! (state, stats, events) are decoded into crate types.

use crate::command::{CommandRunner, CommandSpec, StdioConfig};
use crate::constants::PROCESSES_DIR;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::runtime::binary::RuncBinary;
use crate::runtime::exec::ExecPreparer;
use crate::runtime::logs;
use crate::runtime::process::{ProcessTracker, TrackedProcess};
use crate::spec::{ContainerMetrics, CpuStats, MemoryStats, ProcessIo, ProcessSpec};
use crate::uid::UidGenerator;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info};

// =============================================================================
// Runtime State
// =============================================================================

/// Response of the runtime's `state` verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct State {
    #[serde(default)]
    pub pid: i32,
    pub status: Status,
}

/// Lifecycle phase reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Created,
    Running,
    Stopped,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Runtime Trait
// =============================================================================

/// The runtime operations the containerizer composes.
///
/// Production uses [`RuntimeDriver`]; tests substitute scripted fakes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Starts the container detached; returns once the runtime exits.
    async fn start(&self, bundle_path: &Path, id: &str) -> Result<()>;

    /// Runs a process inside the container and tracks it.
    async fn exec(
        &self,
        bundle_path: &Path,
        id: &str,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<TrackedProcess>;

    /// Signals the container's init process.
    async fn kill(&self, bundle_path: &Path, id: &str, signal: &str) -> Result<()>;

    /// Removes the runtime's record of a stopped container.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Queries the container's lifecycle state.
    async fn state(&self, id: &str) -> Result<State>;

    /// Reads cgroup cpu and memory counters.
    async fn stats(&self, id: &str) -> Result<ContainerMetrics>;

    /// Follows the runtime's event stream until EOF, forwarding OOM
    /// notifications to `sink` under the container id.
    async fn watch_events(&self, id: &str, sink: Arc<dyn EventSink>) -> Result<()>;
}

// =============================================================================
// Driver
// =============================================================================

/// Production [`ContainerRuntime`] backed by the external runtime binary.
pub struct RuntimeDriver {
    runner: Arc<dyn CommandRunner>,
    runc: RuncBinary,
    tracker: ProcessTracker,
    pid_gen: Arc<dyn UidGenerator>,
    preparer: ExecPreparer,
}

impl RuntimeDriver {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        runc: RuncBinary,
        pid_gen: Arc<dyn UidGenerator>,
        preparer: ExecPreparer,
    ) -> Self {
        Self {
            runner,
            runc,
            tracker: ProcessTracker::new(),
            pid_gen,
            preparer,
        }
    }

    /// Runs a logging verb to completion and folds its log file into the
    /// result.
    async fn run_logged(&self, verb: &str, cmd: &CommandSpec, log_file: &Path) -> Result<()> {
        let output = self.runner.run(cmd).await?;
        let contents = std::fs::read_to_string(log_file).unwrap_or_default();
        logs::forward_logs(verb, &contents);
        if output.status.success() {
            Ok(())
        } else {
            Err(logs::wrap_error(
                verb,
                output.status.code().unwrap_or(-1),
                &contents,
            ))
        }
    }

    /// Runs a query verb and returns its stdout.
    async fn run_query(&self, verb: &str, cmd: &CommandSpec) -> Result<Vec<u8>> {
        let output = self.runner.run(cmd).await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::Runtime {
                verb: verb.to_string(),
                message: format!(
                    "exit status {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            })
        }
    }
}

#[async_trait]
impl ContainerRuntime for RuntimeDriver {
    async fn start(&self, bundle_path: &Path, id: &str) -> Result<()> {
        info!(handle = id, bundle = %bundle_path.display(), "starting container");
        let log_file = bundle_path.join("start.log");
        let cmd = self.runc.with_log_file(&log_file).start(bundle_path, id);
        self.run_logged("start", &cmd, &log_file).await
    }

    async fn exec(
        &self,
        bundle_path: &Path,
        id: &str,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<TrackedProcess> {
        let pid = self.pid_gen.generate();
        debug!(handle = id, process = %pid, path = %spec.path, "exec");

        let process = self.preparer.prepare(bundle_path, &spec)?;

        let processes_dir = bundle_path.join(PROCESSES_DIR);
        std::fs::create_dir_all(&processes_dir)?;
        let process_json = processes_dir.join(format!("{pid}.json"));
        std::fs::write(&process_json, serde_json::to_vec_pretty(&process)?)?;
        let pid_file = processes_dir.join(format!("{pid}.pid"));

        let log_file = bundle_path.join(format!("exec-{pid}.log"));
        let cmd = self
            .runc
            .with_log_file(&log_file)
            .exec(id, &process_json, &pid_file);
        let child = self.runner.spawn(&cmd, StdioConfig::piped_all()).await?;
        Ok(self.tracker.track(pid, child, io, Some(pid_file)))
    }

    async fn kill(&self, bundle_path: &Path, id: &str, signal: &str) -> Result<()> {
        info!(handle = id, signal, "killing container");
        let token = self.pid_gen.generate();
        let log_file = bundle_path.join(format!("kill-{token}.log"));
        let cmd = self.runc.with_log_file(&log_file).kill(id, signal);
        self.run_logged("kill", &cmd, &log_file).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        debug!(handle = id, "deleting container");
        let output = self.runner.run(&self.runc.commands().delete(id)).await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::Runtime {
                verb: "delete".to_string(),
                message: format!(
                    "exit status {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            })
        }
    }

    async fn state(&self, id: &str) -> Result<State> {
        let stdout = self
            .run_query("state", &self.runc.commands().state(id))
            .await?;
        serde_json::from_slice(&stdout).map_err(|e| Error::Runtime {
            verb: "state".to_string(),
            message: format!("decode state: {e}"),
        })
    }

    async fn stats(&self, id: &str) -> Result<ContainerMetrics> {
        let stdout = self
            .run_query("stats", &self.runc.commands().stats(id))
            .await?;
        let raw: RawStats = serde_json::from_slice(&stdout).map_err(|e| Error::Runtime {
            verb: "stats".to_string(),
            message: format!("decode stats: {e}"),
        })?;
        Ok(raw.into_metrics())
    }

    async fn watch_events(&self, id: &str, sink: Arc<dyn EventSink>) -> Result<()> {
        debug!(handle = id, "watching runtime events");
        let cmd = self.runc.commands().events(id);
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
            .ok_or_else(|| Error::Internal("events child has no stdout".to_string()))?;

        // Reap the child regardless of how the decode loop ends.
        let reap = move || {
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        };

        let mut lines = tokio::io::BufReader::new(stdout).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    reap();
                    return Err(e.into());
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let event: RuncEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    reap();
                    return Err(Error::Runtime {
                        verb: "events".to_string(),
                        message: format!("decode event: {e}"),
                    });
                }
            };
            debug!(handle = id, event_type = %event.kind, "runtime event");
            if event.kind == "oom" {
                sink.on_event(id, "Out of memory");
            }
        }

        reap();
        debug!(handle = id, "runtime event stream ended");
        Ok(())
    }
}

// =============================================================================
// Wire Formats
// =============================================================================

/// One entry of the runtime's line-delimited event stream.
#[derive(Debug, Deserialize)]
struct RuncEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    #[allow(dead_code)]
    data: serde_json::Value,
}

/// Shape of the `events --stats` response.
#[derive(Debug, Default, Deserialize)]
struct RawStats {
    #[serde(default)]
    data: RawStatsData,
}

#[derive(Debug, Default, Deserialize)]
struct RawStatsData {
    #[serde(rename = "CgroupStats", default)]
    cgroup_stats: RawCgroupStats,
}

#[derive(Debug, Default, Deserialize)]
struct RawCgroupStats {
    #[serde(default)]
    cpu_stats: RawCpuStats,
    #[serde(default)]
    memory_stats: RawMemoryStats,
}

#[derive(Debug, Default, Deserialize)]
struct RawCpuStats {
    #[serde(default)]
    cpu_usage: RawCpuUsage,
}

#[derive(Debug, Default, Deserialize)]
struct RawCpuUsage {
    #[serde(default)]
    total_usage: u64,
    #[serde(default)]
    usage_in_kernelmode: u64,
    #[serde(default)]
    usage_in_usermode: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RawMemoryStats {
    #[serde(default)]
    stats: MemoryStats,
}

impl RawStats {
    fn into_metrics(self) -> ContainerMetrics {
        let cgroup = self.data.cgroup_stats;
        ContainerMetrics {
            cpu: CpuStats {
                usage: cgroup.cpu_stats.cpu_usage.total_usage,
                system: cgroup.cpu_stats.cpu_usage.usage_in_kernelmode,
                user: cgroup.cpu_stats.cpu_usage.usage_in_usermode,
            },
            memory: cgroup.memory_stats.stats.with_usage_toward_limit(),
        }
    }
}
