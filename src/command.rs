//! Child-process execution seam.
//!
//! Every external binary the supervisor touches — the OCI runtime, iptables,
//! `ip`, `mount`, the tar streaming helper — is invoked through the
//! [`CommandRunner`] trait so that tests can observe the exact argument
//! vectors and script the results without a Linux host.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::{Output, Stdio};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

// =============================================================================
// Command Specification
// =============================================================================

/// A program invocation: the program plus its argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// Which streams of a spawned child are piped back to the supervisor.
/// Unpiped streams are discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StdioConfig {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl StdioConfig {
    /// stdout and stderr piped, stdin closed.
    pub fn piped_output() -> Self {
        Self {
            stdin: false,
            stdout: true,
            stderr: true,
        }
    }

    /// All three streams piped.
    pub fn piped_all() -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: true,
        }
    }
}

// =============================================================================
// Runner and Child Traits
// =============================================================================

/// A spawned child process whose streams can be taken once each.
#[async_trait]
pub trait ChildHandle: Send {
    /// OS pid, when the child is still attached.
    fn pid(&self) -> Option<u32>;

    fn take_stdin(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>>;
    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;
    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;

    /// Waits for the child and returns its exit code. A signal-terminated
    /// child reports -1.
    async fn wait(&mut self) -> Result<i32>;
}

/// Executes command specifications.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a command to completion, capturing stdout and stderr.
    async fn run(&self, cmd: &CommandSpec) -> Result<Output>;

    /// Spawns a long-lived child with the requested stream plumbing.
    async fn spawn(&self, cmd: &CommandSpec, stdio: StdioConfig) -> Result<Box<dyn ChildHandle>>;

    /// Runs a command and maps a non-zero exit into [`Error::CommandFailed`].
    async fn run_checked(&self, cmd: &CommandSpec) -> Result<Output> {
        let output = self.run(cmd).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(Error::CommandFailed {
                program: cmd.program.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

// =============================================================================
// Production Runner
// =============================================================================

/// Runs commands as real child processes on the host.
#[derive(Debug, Default)]
pub struct HostCommandRunner;

impl HostCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<Output> {
        debug!(command = %cmd, "running");
        tokio::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::SpawnFailed {
                program: cmd.program.clone(),
                reason: e.to_string(),
            })
    }

    async fn spawn(&self, cmd: &CommandSpec, stdio: StdioConfig) -> Result<Box<dyn ChildHandle>> {
        debug!(command = %cmd, "spawning");
        let pipe_or_null = |piped| if piped { Stdio::piped() } else { Stdio::null() };
        let child = tokio::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(pipe_or_null(stdio.stdin))
            .stdout(pipe_or_null(stdio.stdout))
            .stderr(pipe_or_null(stdio.stderr))
            .spawn()
            .map_err(|e| Error::SpawnFailed {
                program: cmd.program.clone(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(HostChild { child }))
    }
}

struct HostChild {
    child: tokio::process::Child,
}

#[async_trait]
impl ChildHandle for HostChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdin(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
        self.child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncWrite + Send + Unpin>)
    }

    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>)
    }

    async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }
}
