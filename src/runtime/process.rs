//! Tracking of long-lived runtime children.
//!
//! A detached runtime child leaves only two artifacts the supervisor can
//! hold on to: the child process itself (for the exit status) and the pid
//! file the runtime writes (for signalling the in-container process). The
//! tracker owns both, plus the fan-out of the child's stdio into the
//! caller-supplied sinks.

use crate::command::ChildHandle;
use crate::constants::{PID_FILE_POLL_INTERVAL, PID_FILE_TIMEOUT};
use crate::error::{Error, Result};
use crate::spec::ProcessIo;
use std::path::PathBuf;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Spawns the plumbing tasks for runtime children and hands out process
/// handles.
#[derive(Debug, Default)]
pub struct ProcessTracker;

impl ProcessTracker {
    pub fn new() -> Self {
        Self
    }

    /// Adopts a spawned runtime child: wires its stdio into `io`, watches
    /// for its exit, and returns the caller-facing process handle.
    pub fn track(
        &self,
        id: String,
        mut child: Box<dyn ChildHandle>,
        io: ProcessIo,
        pid_file: Option<PathBuf>,
    ) -> TrackedProcess {
        if let (Some(mut source), Some(mut stdin)) = (io.stdin, child.take_stdin()) {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut source, &mut stdin).await;
            });
        }
        if let (Some(mut sink), Some(mut stdout)) = (io.stdout, child.take_stdout()) {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stdout, &mut sink).await;
            });
        }
        if let (Some(mut sink), Some(mut stderr)) = (io.stderr, child.take_stderr()) {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stderr, &mut sink).await;
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        {
            let id = id.clone();
            tokio::spawn(async move {
                let code = match child.wait().await {
                    Ok(code) => code,
                    Err(err) => {
                        warn!(process = %id, error = %err, "wait on runtime child failed");
                        -1
                    }
                };
                debug!(process = %id, exit_code = code, "runtime child exited");
                let _ = exit_tx.send(Some(code));
            });
        }

        TrackedProcess {
            id,
            pid_file,
            exit: exit_rx,
        }
    }
}

/// A process started through the runtime's `exec` verb.
#[derive(Debug, Clone)]
pub struct TrackedProcess {
    id: String,
    pid_file: Option<PathBuf>,
    exit: watch::Receiver<Option<i32>>,
}

impl TrackedProcess {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Blocks until the runtime child exits and returns its exit code.
    pub async fn wait(&self) -> Result<i32> {
        let mut exit = self.exit.clone();
        loop {
            let observed = *exit.borrow();
            if let Some(code) = observed {
                return Ok(code);
            }
            exit.changed()
                .await
                .map_err(|_| Error::Internal("process exit notifier dropped".to_string()))?;
        }
    }

    /// Delivers `signal` to the in-container process named by the pid file.
    ///
    /// The pid file appears asynchronously; the read polls with a bounded
    /// deadline before giving up.
    pub async fn signal(&self, signal: i32) -> Result<()> {
        let pid = self.read_pid().await?;
        let rc = unsafe { libc::kill(pid, signal) };
        if rc != 0 {
            return Err(Error::Internal(format!(
                "kill({pid}, {signal}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    async fn read_pid(&self) -> Result<i32> {
        let Some(pid_file) = &self.pid_file else {
            return Err(Error::Internal(format!(
                "process {} has no pid file",
                self.id
            )));
        };

        let deadline = Instant::now() + PID_FILE_TIMEOUT;
        loop {
            if let Ok(raw) = tokio::fs::read_to_string(pid_file).await {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return trimmed.parse::<i32>().map_err(|_| {
                        Error::Internal(format!(
                            "pid file {} contains {trimmed:?}",
                            pid_file.display()
                        ))
                    });
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: format!("waiting for pid file {}", pid_file.display()),
                    duration: PID_FILE_TIMEOUT,
                });
            }
            tokio::time::sleep(PID_FILE_POLL_INTERVAL).await;
        }
    }
}
