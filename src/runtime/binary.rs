//! Argument-vector builders for the external OCI runtime binary.
//!
//! The runtime is a capability value: it knows where the binary lives and
//! how to phrase each verb, optionally routing the runtime's own structured
//! log output to a file. Production uses one concrete binary; tests build
//! the vectors and assert on them directly.

use crate::command::CommandSpec;
use std::path::{Path, PathBuf};

/// Location of the runtime binary plus per-invocation log configuration.
#[derive(Debug, Clone)]
pub struct RuncBinary {
    path: PathBuf,
}

impl RuncBinary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Verb builders that pass `--log` to the runtime.
    pub fn with_log_file(&self, log_file: impl Into<PathBuf>) -> RuncCommands {
        RuncCommands {
            path: self.path.clone(),
            log_file: Some(log_file.into()),
        }
    }

    /// Verb builders without log routing.
    pub fn commands(&self) -> RuncCommands {
        RuncCommands {
            path: self.path.clone(),
            log_file: None,
        }
    }
}

/// Builds one [`CommandSpec`] per runtime verb.
#[derive(Debug, Clone)]
pub struct RuncCommands {
    path: PathBuf,
    log_file: Option<PathBuf>,
}

impl RuncCommands {
    pub fn start(&self, bundle_path: &Path, id: &str) -> CommandSpec {
        self.verb("start")
            .arg("--detach")
            .arg(bundle_path.display().to_string())
            .arg(id)
    }

    pub fn exec(&self, id: &str, process_json: &Path, pid_file: &Path) -> CommandSpec {
        self.verb("exec")
            .arg(id)
            .arg(process_json.display().to_string())
            .arg("--pid-file")
            .arg(pid_file.display().to_string())
    }

    pub fn kill(&self, id: &str, signal: &str) -> CommandSpec {
        self.verb("kill").arg(id).arg(signal)
    }

    pub fn delete(&self, id: &str) -> CommandSpec {
        self.verb("delete").arg(id)
    }

    pub fn state(&self, id: &str) -> CommandSpec {
        self.verb("state").arg(id)
    }

    pub fn stats(&self, id: &str) -> CommandSpec {
        self.verb("events").arg("--stats").arg(id)
    }

    pub fn events(&self, id: &str) -> CommandSpec {
        self.verb("events").arg(id)
    }

    fn verb(&self, verb: &str) -> CommandSpec {
        let mut cmd = CommandSpec::new(self.path.display().to_string());
        if let Some(log_file) = &self.log_file {
            cmd = cmd.arg("--log").arg(log_file.display().to_string());
        }
        cmd.arg(verb)
    }
}
