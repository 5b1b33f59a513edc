//! Cgroup hierarchy preparation and per-container read-back.
//!
//! Before the supervisor serves requests, the [`CgroupStarter`] makes sure
//! every subsystem listed in `/proc/cgroups` is mounted under the
//! configured hierarchy root, honouring the composite-subsystem grouping
//! that `/proc/self/cgroup` reports (e.g. `cpu,cpuacct`). This is the only
//! component that mutates shared cgroup state, and it runs before any
//! container exists.
//!
//! [`CgroupReader`] reads a container's `cpu.shares` back out for `Info`.

use crate::command::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};
use crate::supervisor::Starter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Starter
// =============================================================================

/// Mounts the cgroup hierarchies the runtime needs.
pub struct CgroupStarter {
    cgroup_path: PathBuf,
    proc_cgroups_path: PathBuf,
    proc_self_cgroup_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl CgroupStarter {
    pub fn new(cgroup_path: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            cgroup_path: cgroup_path.into(),
            proc_cgroups_path: PathBuf::from("/proc/cgroups"),
            proc_self_cgroup_path: PathBuf::from("/proc/self/cgroup"),
            runner,
        }
    }

    /// Overrides the proc file locations; used by tests.
    pub fn with_proc_files(
        mut self,
        proc_cgroups: impl Into<PathBuf>,
        proc_self_cgroup: impl Into<PathBuf>,
    ) -> Self {
        self.proc_cgroups_path = proc_cgroups.into();
        self.proc_self_cgroup_path = proc_self_cgroup.into();
        self
    }

    async fn is_mountpoint(&self, path: &Path) -> bool {
        let cmd = CommandSpec::new("mountpoint")
            .arg("-q")
            .arg(path.display().to_string());
        matches!(self.runner.run(&cmd).await, Ok(output) if output.status.success())
    }

    async fn mount(&self, fstype: &str, options: &str, target: &Path) -> Result<()> {
        let target = target.display().to_string();
        let cmd = CommandSpec::new("mount")
            .args(["-t", fstype, "-o", options, "cgroup", target.as_str()]);
        self.runner.run_checked(&cmd).await?;
        Ok(())
    }

    /// Subsystem names from `/proc/cgroups`, header lines skipped.
    fn subsystems(&self) -> Result<Vec<String>> {
        let contents = std::fs::read_to_string(&self.proc_cgroups_path)?;
        Ok(contents
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter(|name| !name.is_empty() && !name.starts_with('#') && !name.contains('-'))
            .map(str::to_string)
            .collect())
    }

    /// Maps each subsystem to its mount group from `/proc/self/cgroup`
    /// (`3:cpu,cpuacct:/` groups cpu and cpuacct together).
    fn subsystem_groups(&self) -> Result<HashMap<String, String>> {
        let contents = std::fs::read_to_string(&self.proc_self_cgroup_path)?;
        let mut groups = HashMap::new();
        for line in contents.lines() {
            let mut fields = line.split(':');
            let (Some(_), Some(group)) = (fields.next(), fields.next()) else {
                continue;
            };
            for subsystem in group.split(',') {
                groups.insert(subsystem.to_string(), group.to_string());
            }
        }
        Ok(groups)
    }
}

#[async_trait]
impl Starter for CgroupStarter {
    async fn start(&self) -> Result<()> {
        info!(path = %self.cgroup_path.display(), "preparing cgroup hierarchy");
        std::fs::create_dir_all(&self.cgroup_path)?;

        if !self.is_mountpoint(&self.cgroup_path).await {
            self.mount("tmpfs", "uid=0,gid=0,mode=0755", &self.cgroup_path)
                .await?;
        }

        let groups = self.subsystem_groups()?;
        for subsystem in self.subsystems()? {
            let mount_dir = self.cgroup_path.join(&subsystem);
            std::fs::create_dir_all(&mount_dir)?;
            if self.is_mountpoint(&mount_dir).await {
                continue;
            }
            let options = groups.get(&subsystem).cloned().unwrap_or_else(|| subsystem.clone());
            debug!(subsystem, options, "mounting cgroup hierarchy");
            self.mount("cgroup", &options, &mount_dir).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Reads per-container cgroup values back out of the hierarchy.
#[derive(Debug, Clone)]
pub struct CgroupReader {
    cgroup_path: PathBuf,
}

impl CgroupReader {
    pub fn new(cgroup_path: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_path: cgroup_path.into(),
        }
    }

    /// Returns the container's `cpu.shares`.
    ///
    /// A missing per-container directory is NotFound; unparsable content is
    /// surfaced rather than read as zero.
    pub fn cpu_shares(&self, handle: &str) -> Result<u64> {
        let path = self.cgroup_path.join("cpu").join(handle).join("cpu.shares");
        let contents = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::CgroupNotFound(handle.to_string()),
            _ => Error::Io(e),
        })?;
        contents.trim().parse::<u64>().map_err(|_| {
            Error::Internal(format!(
                "unparsable cpu.shares for {handle}: {:?}",
                contents.trim()
            ))
        })
    }
}
