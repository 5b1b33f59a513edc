//! Preparation of per-exec runtime process specs.
//!
//! `runc exec` consumes a `process.json` describing the process to start.
//! The preparer composes it from the saved bundle descriptor and the
//! caller's process spec: the container identity is resolved against the
//! rootfs's `/etc/passwd`, the working directory is materialized, and the
//! environment follows fixed PATH/USER rules so every exec sees exactly one
//! of each.

use crate::bundle::{Bundle, Process, User, merge_env};
use crate::constants::{DEFAULT_ROOT_PATH, DEFAULT_USER, DEFAULT_USER_PATH};
use crate::error::{Error, Result};
use crate::mkdir::Mkdirer;
use crate::spec::{ProcessSpec, map_id};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// User Lookup
// =============================================================================

/// Identity resolved from a container rootfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

/// Resolves a user name against a container root filesystem.
pub trait UserLookup: Send + Sync {
    fn lookup(&self, rootfs: &Path, user: &str) -> Result<ExecUser>;
}

/// Reads `<rootfs>/etc/passwd`. A rootfs without a passwd file still
/// resolves root, so minimal images can exec.
#[derive(Debug, Default)]
pub struct PasswdUserLookup;

impl UserLookup for PasswdUserLookup {
    fn lookup(&self, rootfs: &Path, user: &str) -> Result<ExecUser> {
        let passwd_path = rootfs.join("etc/passwd");
        let contents = match std::fs::read_to_string(&passwd_path) {
            Ok(contents) => contents,
            Err(_) if user == DEFAULT_USER => {
                return Ok(ExecUser {
                    name: DEFAULT_USER.to_string(),
                    uid: 0,
                    gid: 0,
                    home: PathBuf::from("/root"),
                });
            }
            Err(e) => {
                return Err(Error::Validation(format!(
                    "cannot resolve user {user:?}: {}: {e}",
                    passwd_path.display()
                )));
            }
        };

        for line in contents.lines() {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 6 || fields[0] != user {
                continue;
            }
            let uid = fields[2].parse::<u32>().map_err(|_| {
                Error::Validation(format!("malformed passwd entry for {user:?}"))
            })?;
            let gid = fields[3].parse::<u32>().map_err(|_| {
                Error::Validation(format!("malformed passwd entry for {user:?}"))
            })?;
            return Ok(ExecUser {
                name: user.to_string(),
                uid,
                gid,
                home: PathBuf::from(fields[5]),
            });
        }

        Err(Error::Validation(format!(
            "user {user:?} not found in {}",
            passwd_path.display()
        )))
    }
}

// =============================================================================
// Environment Composition
// =============================================================================

/// Final exec environment: container env overridden by spec env, then a
/// PATH appropriate for the uid and a USER entry appended when absent.
pub fn compose_env(
    container_env: &[String],
    spec_env: &[String],
    uid: u32,
    user_name: &str,
) -> Vec<String> {
    let mut env = merge_env(container_env, spec_env);
    if !env.iter().any(|e| e.starts_with("PATH=")) {
        let default_path = if uid == 0 {
            DEFAULT_ROOT_PATH
        } else {
            DEFAULT_USER_PATH
        };
        env.push(default_path.to_string());
    }
    if !env.iter().any(|e| e.starts_with("USER=")) {
        env.push(format!("USER={user_name}"));
    }
    env
}

// =============================================================================
// Preparer
// =============================================================================

/// Builds the `process.json` content for one exec.
pub struct ExecPreparer {
    user_lookup: Arc<dyn UserLookup>,
    mkdirer: Arc<dyn Mkdirer>,
}

impl ExecPreparer {
    pub fn new(user_lookup: Arc<dyn UserLookup>, mkdirer: Arc<dyn Mkdirer>) -> Self {
        Self {
            user_lookup,
            mkdirer,
        }
    }

    /// Resolves the process spec against the saved bundle in `bundle_dir`.
    ///
    /// Ensures the working directory exists inside the rootfs, owned by the
    /// exec user — mapped to the host identity when the bundle carries a
    /// user namespace.
    pub fn prepare(&self, bundle_dir: &Path, spec: &ProcessSpec) -> Result<Process> {
        if spec.path.is_empty() {
            return Err(Error::Validation("process spec has no program path".into()));
        }

        let bundle = Bundle::load(bundle_dir)?;
        let rootfs = bundle.root.path.clone();

        let user_name = spec.user.clone().unwrap_or_else(|| DEFAULT_USER.to_string());
        let user = self.user_lookup.lookup(&rootfs, &user_name)?;

        let cwd = spec.cwd.clone().unwrap_or_else(|| "/".to_string());
        self.ensure_cwd(&bundle, &rootfs, &cwd, &user)?;

        let env = compose_env(&bundle.process.env, &spec.env, user.uid, &user.name);

        let mut args = vec![spec.path.clone()];
        args.extend(spec.args.iter().cloned());

        Ok(Process {
            terminal: false,
            user: User {
                uid: user.uid,
                gid: user.gid,
            },
            args,
            env,
            cwd,
            capabilities: bundle.process.capabilities.clone(),
            rlimits: if spec.rlimits.is_empty() {
                bundle.process.rlimits.clone()
            } else {
                spec.rlimits.clone()
            },
        })
    }

    fn ensure_cwd(&self, bundle: &Bundle, rootfs: &Path, cwd: &str, user: &ExecUser) -> Result<()> {
        let relative = cwd.trim_start_matches('/');
        if relative.is_empty() {
            return Ok(());
        }
        let host_path = rootfs.join(relative);
        let (uid, gid) = if bundle.has_user_namespace() {
            (
                map_id(&bundle.linux.uid_mappings, user.uid),
                map_id(&bundle.linux.gid_mappings, user.gid),
            )
        } else {
            (user.uid, user.gid)
        };
        self.mkdirer.mkdir_as(&host_path, uid, gid, 0o755)
    }
}
