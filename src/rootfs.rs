//! Root filesystem provisioning.
//!
//! The layered copy-on-write rootfs builder lives outside this crate; the
//! supervisor only sees the [`RootfsProvider`](crate::supervisor::RootfsProvider)
//! contract. The passthrough implementation here validates the requested
//! path and shares it between containers, which is enough to wire the
//! daemon end to end and to exercise the create/destroy paths.

use crate::error::{Error, Result};
use crate::supervisor::RootfsProvider;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

/// Hands every container the caller-named rootfs directory, read-shared.
#[derive(Debug, Default)]
pub struct PassthroughRootfsProvider {
    /// Fallback rootfs used when a spec names none.
    default_rootfs: Option<PathBuf>,
}

impl PassthroughRootfsProvider {
    pub fn new(default_rootfs: Option<PathBuf>) -> Self {
        Self { default_rootfs }
    }
}

#[async_trait]
impl RootfsProvider for PassthroughRootfsProvider {
    async fn create(
        &self,
        handle: &str,
        rootfs: &str,
        _privileged: bool,
        _disk_quota_bytes: u64,
    ) -> Result<(PathBuf, Vec<String>)> {
        let requested = if rootfs.is_empty() {
            self.default_rootfs.clone().ok_or_else(|| {
                Error::Validation("no rootfs requested and no default configured".to_string())
            })?
        } else {
            PathBuf::from(rootfs)
        };

        let resolved = requested.canonicalize().map_err(|_| {
            Error::Validation(format!(
                "rootfs {} does not exist",
                requested.display()
            ))
        })?;
        debug!(handle, rootfs = %resolved.display(), "rootfs provisioned");
        Ok((resolved, Vec::new()))
    }

    async fn destroy(&self, _handle: &str) -> Result<()> {
        // Shared rootfs: nothing per-container to reclaim.
        Ok(())
    }
}
