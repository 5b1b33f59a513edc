//! The ordered bundle construction rules.
//!
//! Each rule is a pure transformation from `(bundle, spec)` to a new
//! bundle; the only collaborator with side effects is the injected
//! [`Mkdirer`] used to materialize the rootfs directory.

use crate::bundle::{Bundle, Hook};
use crate::error::Result;
use crate::mkdir::Mkdirer;
use crate::spec::DesiredContainerSpec;
use std::path::PathBuf;
use std::sync::Arc;

/// A single step of bundle construction.
pub trait BundleRule: Send + Sync {
    fn apply(&self, bundle: Bundle, spec: &DesiredContainerSpec) -> Result<Bundle>;
}

// =============================================================================
// 1. Base Template
// =============================================================================

/// Selects the starting bundle: the privileged base keeps the five
/// always-on namespaces, the unprivileged base adds a user namespace and
/// the configured identity mappings.
pub struct BaseTemplateRule {
    pub privileged_base: Bundle,
    pub unprivileged_base: Bundle,
}

impl BundleRule for BaseTemplateRule {
    fn apply(&self, _bundle: Bundle, spec: &DesiredContainerSpec) -> Result<Bundle> {
        let base = if spec.privileged {
            &self.privileged_base
        } else {
            &self.unprivileged_base
        };
        Ok(base.clone())
    }
}

// =============================================================================
// 2. Root Filesystem
// =============================================================================

/// Points the bundle at the provisioned rootfs and makes sure the
/// directory exists, owned by the mapped root identity.
pub struct RootfsRule {
    pub container_root_uid: u32,
    pub container_root_gid: u32,
    pub mkdirer: Arc<dyn Mkdirer>,
}

impl BundleRule for RootfsRule {
    fn apply(&self, bundle: Bundle, spec: &DesiredContainerSpec) -> Result<Bundle> {
        self.mkdirer.mkdir_as(
            &spec.rootfs_path,
            self.container_root_uid,
            self.container_root_gid,
            0o755,
        )?;
        Ok(bundle.with_rootfs(&spec.rootfs_path))
    }
}

// =============================================================================
// 3. Limits
// =============================================================================

/// Merges cpu shares, the memory ceiling, and the block-I/O weight into
/// the resources section. Zero values leave the runtime defaults alone.
pub struct LimitsRule;

impl BundleRule for LimitsRule {
    fn apply(&self, mut bundle: Bundle, spec: &DesiredContainerSpec) -> Result<Bundle> {
        let mut resources = bundle.linux.resources.take().unwrap_or_default();
        if spec.limits.cpu_shares > 0 {
            resources.cpu.get_or_insert_with(Default::default).shares =
                Some(spec.limits.cpu_shares);
        }
        if spec.limits.memory_limit_bytes > 0 {
            resources.memory.get_or_insert_with(Default::default).limit =
                Some(spec.limits.memory_limit_bytes);
        }
        if spec.limits.blkio_weight > 0 {
            resources.block_io.get_or_insert_with(Default::default).weight =
                Some(spec.limits.blkio_weight);
        }
        Ok(bundle.with_resources(resources))
    }
}

// =============================================================================
// 4. Network Hooks
// =============================================================================

/// Injects the out-of-band network configuration commands as prestart and
/// poststop hooks. Hook output is redirected into the container's
/// `network.log`; the runtime itself captures nothing.
pub struct NetworkHookRule {
    /// Log file path with `%s` standing for the handle.
    pub log_file_pattern: String,
}

impl NetworkHookRule {
    fn wrap(&self, handle: &str, path: &std::path::Path, args: &[String]) -> Hook {
        let log_file = self.log_file_pattern.replace("%s", handle);
        let mut command = vec![path.display().to_string()];
        command.extend(args.iter().cloned());
        Hook {
            path: PathBuf::from("/bin/sh"),
            args: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("exec {} >>{} 2>&1", command.join(" "), log_file),
            ],
            env: Vec::new(),
        }
    }
}

impl BundleRule for NetworkHookRule {
    fn apply(&self, bundle: Bundle, spec: &DesiredContainerSpec) -> Result<Bundle> {
        let Some(hooks) = &spec.network_hooks else {
            return Ok(bundle);
        };
        let prestart = self.wrap(&spec.handle, &hooks.prestart.path, &hooks.prestart.args);
        let poststop = self.wrap(&spec.handle, &hooks.poststop.path, &hooks.poststop.args);
        Ok(bundle.with_prestart_hook(prestart).with_poststop_hook(poststop))
    }
}

// =============================================================================
// 5. Bind Mounts
// =============================================================================

/// Appends the caller-specified bind mounts.
pub struct BindMountsRule;

impl BundleRule for BindMountsRule {
    fn apply(&self, bundle: Bundle, spec: &DesiredContainerSpec) -> Result<Bundle> {
        let mounts = spec.bind_mounts.iter().map(|bm| crate::bundle::Mount {
            destination: bm.dst_path.clone(),
            kind: "bind".to_string(),
            source: bm.src_path.clone(),
            options: if bm.read_only {
                vec!["bind".to_string(), "ro".to_string()]
            } else {
                vec!["bind".to_string()]
            },
        });
        Ok(bundle.with_mounts(mounts))
    }
}

// =============================================================================
// 6. Environment
// =============================================================================

/// Merges the container-wide environment into the init process env, with
/// the spec's entries winning on key conflicts.
pub struct EnvRule;

impl BundleRule for EnvRule {
    fn apply(&self, mut bundle: Bundle, spec: &DesiredContainerSpec) -> Result<Bundle> {
        bundle.process.env = merge_env(&bundle.process.env, &spec.env);
        Ok(bundle)
    }
}

/// Key-wise merge of `KEY=VALUE` lists: `overrides` wins, first-seen
/// position is kept, so the result has exactly one entry per key.
pub fn merge_env(base: &[String], overrides: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(base.len() + overrides.len());
    for entry in base.iter().chain(overrides.iter()) {
        let key = env_key(entry);
        match merged.iter_mut().find(|have| env_key(have) == key) {
            Some(have) => *have = entry.clone(),
            None => merged.push(entry.clone()),
        }
    }
    merged
}

fn env_key(entry: &str) -> &str {
    entry.split('=').next().unwrap_or(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Namespace;
    use crate::error::Error;
    use crate::spec::{BindMount, HookCommand, Limits, NetworkHooks};
    use std::path::Path;
    use std::sync::Mutex;

    struct RecordingMkdirer {
        calls: Mutex<Vec<(PathBuf, u32, u32)>>,
    }

    impl RecordingMkdirer {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Mkdirer for RecordingMkdirer {
        fn mkdir_as(&self, path: &Path, uid: u32, gid: u32, _mode: u32) -> Result<()> {
            self.calls
                .lock()
                .map_err(|e| Error::Internal(e.to_string()))?
                .push((path.to_path_buf(), uid, gid));
            Ok(())
        }
    }

    fn spec() -> DesiredContainerSpec {
        DesiredContainerSpec {
            handle: "banana".to_string(),
            rootfs_path: PathBuf::from("/var/lib/arbor/rootfs/banana"),
            ..Default::default()
        }
    }

    #[test]
    fn base_template_picks_the_privileged_base() {
        let rule = BaseTemplateRule {
            privileged_base: Bundle::default().with_hostname("privileged"),
            unprivileged_base: Bundle::default()
                .with_hostname("unprivileged")
                .with_namespace(Namespace::of(Namespace::USER)),
        };

        let mut s = spec();
        s.privileged = true;
        assert_eq!(
            rule.apply(Bundle::default(), &s).unwrap().hostname,
            "privileged"
        );

        s.privileged = false;
        let bundle = rule.apply(Bundle::default(), &s).unwrap();
        assert_eq!(bundle.hostname, "unprivileged");
        assert!(bundle.has_user_namespace());
    }

    #[test]
    fn rootfs_rule_creates_the_directory_with_the_mapped_root() {
        let mkdirer = Arc::new(RecordingMkdirer::new());
        let rule = RootfsRule {
            container_root_uid: 65534,
            container_root_gid: 65534,
            mkdirer: mkdirer.clone(),
        };
        let bundle = rule.apply(Bundle::default(), &spec()).unwrap();
        assert_eq!(bundle.root.path, spec().rootfs_path);
        let calls = mkdirer.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[(spec().rootfs_path, 65534, 65534)]);
    }

    #[test]
    fn limits_rule_merges_nonzero_limits() {
        let mut s = spec();
        s.limits = Limits {
            cpu_shares: 512,
            memory_limit_bytes: 64 * 1024 * 1024,
            disk_limit_bytes: 0,
            blkio_weight: 200,
        };
        let bundle = LimitsRule.apply(Bundle::default(), &s).unwrap();
        let resources = bundle.linux.resources.unwrap();
        assert_eq!(resources.cpu.unwrap().shares, Some(512));
        assert_eq!(resources.memory.unwrap().limit, Some(64 * 1024 * 1024));
        assert_eq!(resources.block_io.unwrap().weight, Some(200));
    }

    #[test]
    fn limits_rule_leaves_zero_limits_unset() {
        let bundle = LimitsRule.apply(Bundle::default(), &spec()).unwrap();
        let resources = bundle.linux.resources.unwrap();
        assert!(resources.cpu.is_none());
        assert!(resources.memory.is_none());
        assert!(resources.block_io.is_none());
    }

    #[test]
    fn network_hook_rule_redirects_into_the_handle_log() {
        let rule = NetworkHookRule {
            log_file_pattern: "/var/depot/%s/network.log".to_string(),
        };
        let mut s = spec();
        s.network_hooks = Some(NetworkHooks {
            prestart: HookCommand {
                path: PathBuf::from("/usr/bin/arbor-net"),
                args: vec!["--action=create".into(), "--handle=banana".into()],
            },
            poststop: HookCommand {
                path: PathBuf::from("/usr/bin/arbor-net"),
                args: vec!["--action=destroy".into(), "--handle=banana".into()],
            },
        });
        let bundle = rule.apply(Bundle::default(), &s).unwrap();
        let hooks = bundle.hooks.unwrap();
        assert_eq!(hooks.prestart.len(), 1);
        assert_eq!(hooks.prestart[0].path, PathBuf::from("/bin/sh"));
        assert_eq!(
            hooks.prestart[0].args[2],
            "exec /usr/bin/arbor-net --action=create --handle=banana \
             >>/var/depot/banana/network.log 2>&1"
        );
        assert!(hooks.poststop[0].args[2].contains("--action=destroy"));
    }

    #[test]
    fn network_hook_rule_is_a_noop_without_hooks() {
        let rule = NetworkHookRule {
            log_file_pattern: "/var/depot/%s/network.log".to_string(),
        };
        let bundle = rule.apply(Bundle::default(), &spec()).unwrap();
        assert!(bundle.hooks.is_none());
    }

    #[test]
    fn bind_mounts_rule_appends_entries() {
        let mut s = spec();
        s.bind_mounts = vec![
            BindMount {
                src_path: PathBuf::from("/host/ro"),
                dst_path: PathBuf::from("/ro"),
                read_only: true,
            },
            BindMount {
                src_path: PathBuf::from("/host/rw"),
                dst_path: PathBuf::from("/rw"),
                read_only: false,
            },
        ];
        let bundle = BindMountsRule.apply(Bundle::default(), &s).unwrap();
        assert_eq!(bundle.mounts.len(), 2);
        assert_eq!(bundle.mounts[0].options, vec!["bind", "ro"]);
        assert_eq!(bundle.mounts[1].options, vec!["bind"]);
    }

    #[test]
    fn env_rule_overrides_base_entries_by_key() {
        let mut s = spec();
        s.env = vec!["TERM=xterm".to_string(), "LANG=C".to_string()];
        let base = Bundle::default().with_process(crate::bundle::Process {
            env: vec!["PATH=/bin".to_string(), "TERM=dumb".to_string()],
            ..Default::default()
        });
        let bundle = EnvRule.apply(base, &s).unwrap();
        assert_eq!(bundle.process.env, vec!["PATH=/bin", "TERM=xterm", "LANG=C"]);
    }

    #[test]
    fn merge_env_keeps_exactly_one_entry_per_key() {
        let merged = merge_env(
            &["A=1".to_string(), "B=2".to_string()],
            &["A=3".to_string(), "A=4".to_string()],
        );
        assert_eq!(merged, vec!["A=4", "B=2"]);
    }
}
