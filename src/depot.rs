//! Directory-per-handle bundle store.
//!
//! Layout of one entry:
//!
//! ```text
//! <depot>/<handle>/
//! ├── config.json        serialized OCI bundle, written exactly once
//! ├── network.log        output of the network configuration hook
//! ├── start.log          runtime log files
//! ├── exec-<pid>.log
//! ├── kill-<token>.log
//! └── processes/
//!     ├── <pid>.json     per-exec runtime process spec
//!     └── <pid>.pid      runtime pid file for that exec
//! ```
//!
//! The atomic `mkdir` of the entry directory doubles as the handle
//! uniqueness check.

use crate::bundle::Bundle;
use crate::constants::{BUNDLE_CONFIG_FILE, PROCESSES_DIR};
use crate::error::{Error, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Filesystem store holding one directory per container.
#[derive(Debug)]
pub struct Depot {
    dir: PathBuf,
}

impl Depot {
    /// Opens (and creates if needed) a depot rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::DepotCreateFailed {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        info!(depot = %dir.display(), "depot initialized");
        Ok(Self { dir })
    }

    /// Returns the depot root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the entry for `handle` and writes the bundle descriptor.
    ///
    /// Fails with [`Error::HandleAlreadyExists`] when the entry directory is
    /// already present. The descriptor is never rewritten afterwards.
    pub fn create(&self, handle: &str, bundle: &Bundle) -> Result<PathBuf> {
        let path = self.entry_path(handle)?;
        if let Err(e) = fs::create_dir(&path) {
            return Err(match e.kind() {
                ErrorKind::AlreadyExists => Error::HandleAlreadyExists(handle.to_string()),
                _ => Error::DepotCreateFailed {
                    path,
                    reason: e.to_string(),
                },
            });
        }

        let descriptor = bundle.to_json()?;
        fs::write(path.join(BUNDLE_CONFIG_FILE), descriptor)?;
        fs::create_dir(path.join(PROCESSES_DIR))?;

        debug!(handle, path = %path.display(), "depot entry created");
        Ok(path)
    }

    /// Returns the entry directory of a handle.
    pub fn lookup(&self, handle: &str) -> Result<PathBuf> {
        let path = self.entry_path(handle)?;
        if path.is_dir() {
            Ok(path)
        } else {
            Err(Error::HandleNotFound(handle.to_string()))
        }
    }

    /// Recursively removes the entry of a handle. Removing an absent entry
    /// succeeds, keeping destroy idempotent.
    pub fn destroy(&self, handle: &str) -> Result<()> {
        let path = self.entry_path(handle)?;
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                debug!(handle, "depot entry removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists the handles present in the depot, sorted.
    pub fn handles(&self) -> Result<Vec<String>> {
        let mut handles = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                handles.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        handles.sort();
        Ok(handles)
    }

    // A handle becomes a directory name, so path separators and dot-entries
    // must never reach the filesystem layer.
    fn entry_path(&self, handle: &str) -> Result<PathBuf> {
        if handle.is_empty()
            || handle == "."
            || handle == ".."
            || handle.contains('/')
            || handle.contains('\0')
        {
            return Err(Error::Validation(format!("invalid handle: {handle:?}")));
        }
        Ok(self.dir.join(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rejects_path_escaping_handles() {
        let temp = TempDir::new().unwrap();
        let depot = Depot::new(temp.path()).unwrap();
        for bad in ["", ".", "..", "a/b"] {
            assert!(matches!(depot.lookup(bad), Err(Error::Validation(_))));
        }
    }

    #[test]
    fn destroy_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let depot = Depot::new(temp.path()).unwrap();
        depot.destroy("never-created").unwrap();
    }
}
