//! OCI runtime bundle model and construction pipeline.
//!
//! A [`Bundle`] is the in-memory form of a bundle's `config.json`. It is
//! built by folding an ordered list of pure [`BundleRule`]s over an empty
//! bundle:
//!
//! ```text
//! base template → rootfs → limits → network hook → bind mounts → env
//! ```
//!
//! Order is configuration, not code: the [`BundleTemplate`] owns the rule
//! list and each rule only sees `(bundle, spec)`. The resulting descriptor
//! is serialized exactly once, when the depot entry is created, and the
//! serialization is deterministic so identical specs yield byte-identical
//! `config.json` files.

mod rules;

pub use rules::{
    BaseTemplateRule, BindMountsRule, BundleRule, EnvRule, LimitsRule, NetworkHookRule, RootfsRule,
    merge_env,
};

use crate::constants::OCI_RUNTIME_SPEC_VERSION;
use crate::error::Result;
use crate::spec::{DesiredContainerSpec, IdMap, Rlimit};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// Bundle
// =============================================================================

/// In-memory OCI bundle descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub oci_version: String,
    pub root: Root,
    pub process: Process,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Hooks>,
    pub linux: Linux,
}

impl Default for Bundle {
    fn default() -> Self {
        Self {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            root: Root::default(),
            process: Process::default(),
            hostname: String::new(),
            mounts: Vec::new(),
            hooks: None,
            linux: Linux::default(),
        }
    }
}

impl Bundle {
    /// Serializes the descriptor; deterministic for a given bundle value.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Reads a descriptor back from a bundle directory's `config.json`.
    pub fn load(bundle_dir: &Path) -> Result<Self> {
        let raw = std::fs::read(bundle_dir.join(crate::constants::BUNDLE_CONFIG_FILE))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    // -------------------------------------------------------------------------
    // Builder methods used by the base templates and the rules
    // -------------------------------------------------------------------------

    pub fn with_rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.root.path = path.into();
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_process(mut self, process: Process) -> Self {
        self.process = process;
        self
    }

    pub fn with_namespaces<I>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = Namespace>,
    {
        self.linux.namespaces = namespaces.into_iter().collect();
        self
    }

    pub fn with_namespace(mut self, namespace: Namespace) -> Self {
        self.linux.namespaces.push(namespace);
        self
    }

    pub fn with_mounts<I>(mut self, mounts: I) -> Self
    where
        I: IntoIterator<Item = Mount>,
    {
        self.mounts.extend(mounts);
        self
    }

    pub fn with_devices<I>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = Device>,
    {
        self.linux.devices = devices.into_iter().collect();
        self
    }

    pub fn with_uid_mappings<I>(mut self, mappings: I) -> Self
    where
        I: IntoIterator<Item = IdMap>,
    {
        self.linux.uid_mappings = mappings.into_iter().collect();
        self
    }

    pub fn with_gid_mappings<I>(mut self, mappings: I) -> Self
    where
        I: IntoIterator<Item = IdMap>,
    {
        self.linux.gid_mappings = mappings.into_iter().collect();
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.linux.resources = Some(resources);
        self
    }

    pub fn with_prestart_hook(mut self, hook: Hook) -> Self {
        self.hooks.get_or_insert_with(Hooks::default).prestart.push(hook);
        self
    }

    pub fn with_poststop_hook(mut self, hook: Hook) -> Self {
        self.hooks.get_or_insert_with(Hooks::default).poststop.push(hook);
        self
    }

    /// True when the bundle carries a user namespace with identity mappings.
    pub fn has_user_namespace(&self) -> bool {
        self.linux
            .namespaces
            .iter()
            .any(|ns| ns.kind == Namespace::USER)
    }
}

// =============================================================================
// Descriptor Sections
// =============================================================================

/// Root filesystem section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Root {
    pub path: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

/// Init-process section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,
    pub user: User,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rlimits: Vec<Rlimit>,
}

impl Default for Process {
    fn default() -> Self {
        Self {
            terminal: false,
            user: User::default(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: "/".to_string(),
            capabilities: Vec::new(),
            rlimits: Vec::new(),
        }
    }
}

impl Process {
    /// A shell-style process running `program` with `args`.
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = vec![program.to_string()];
        argv.extend(args.into_iter().map(Into::into));
        Self {
            args: argv,
            ..Default::default()
        }
    }
}

/// Identity the init process runs as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
}

/// One mount entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub destination: PathBuf,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Lifecycle hook sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prestart: Vec<Hook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststop: Vec<Hook>,
}

/// One hook invocation run by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
}

/// Linux-specific section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    pub namespaces: Vec<Namespace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMap>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<Device>,
}

/// One namespace entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Namespace {
    pub const NETWORK: &'static str = "network";
    pub const PID: &'static str = "pid";
    pub const UTS: &'static str = "uts";
    pub const IPC: &'static str = "ipc";
    pub const MOUNT: &'static str = "mount";
    pub const USER: &'static str = "user";

    pub fn of(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            path: None,
        }
    }
}

/// Cgroup resource limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,
    #[serde(rename = "blockIO", default, skip_serializing_if = "Option::is_none")]
    pub block_io: Option<BlockIo>,
}

/// Memory cgroup limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

/// CPU cgroup limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
}

/// Block-I/O cgroup limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u16>,
}

/// One device node made available in the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub kind: String,
    pub major: i64,
    pub minor: i64,
    pub file_mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Device {
    /// A rw character device with mode 0666, owned by root.
    pub fn char(path: &str, major: i64, minor: i64) -> Self {
        Self {
            path: PathBuf::from(path),
            kind: "c".to_string(),
            major,
            minor,
            file_mode: 0o666,
            uid: 0,
            gid: 0,
        }
    }
}

// =============================================================================
// Template
// =============================================================================

/// Folds the configured rules, in order, over an empty bundle.
pub struct BundleTemplate {
    rules: Vec<Box<dyn BundleRule>>,
}

impl BundleTemplate {
    pub fn new(rules: Vec<Box<dyn BundleRule>>) -> Self {
        Self { rules }
    }

    pub fn generate(&self, spec: &DesiredContainerSpec) -> Result<Bundle> {
        let mut bundle = Bundle::default();
        for rule in &self.rules {
            bundle = rule.apply(bundle, spec)?;
        }
        Ok(bundle)
    }
}
