//! Directory creation with ownership, behind a trait.
//!
//! Rootfs directories and process working directories must exist before the
//! runtime enters them, owned by the (possibly user-namespace-mapped) uid
//! and gid that will use them. The trait keeps host filesystem mutation out
//! of the pure bundle rules and lets tests observe the requests.

use crate::error::Result;
use std::fs;
use std::os::unix::fs::{PermissionsExt, chown};
use std::path::Path;

/// Creates directories owned by a specific uid/gid.
pub trait Mkdirer: Send + Sync {
    /// Creates `path` and any missing parents with `mode`, then chowns every
    /// component this call created to `uid:gid`. Existing directories are
    /// left untouched.
    fn mkdir_as(&self, path: &Path, uid: u32, gid: u32, mode: u32) -> Result<()>;
}

/// Host implementation operating on the real filesystem.
#[derive(Debug, Default)]
pub struct HostMkdirer;

impl Mkdirer for HostMkdirer {
    fn mkdir_as(&self, path: &Path, uid: u32, gid: u32, mode: u32) -> Result<()> {
        let mut created = Vec::new();
        let mut missing = path;
        while !missing.exists() {
            created.push(missing.to_path_buf());
            match missing.parent() {
                Some(parent) => missing = parent,
                None => break,
            }
        }

        fs::create_dir_all(path)?;

        for dir in created.iter().rev() {
            fs::set_permissions(dir, fs::Permissions::from_mode(mode))?;
            chown(dir, Some(uid), Some(gid))?;
        }
        Ok(())
    }
}
