//! Per-handle key/value property store.
//!
//! Components attach arbitrary string pairs to a container handle; the
//! network allocator additionally persists its configuration here under
//! reserved `kawasaki.*` keys so that destroy and daemon restart can
//! recover it. All operations hold one mutex for the duration of the call
//! and perform no I/O while holding it.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;

type PropertyMap = HashMap<String, HashMap<String, String>>;

/// In-memory map of handle → property set.
///
/// The store itself does not persist to disk; callers that need durability
/// substitute an externally backed map at construction time.
#[derive(Debug, Default)]
pub struct PropertyManager {
    inner: Mutex<PropertyMap>,
}

impl PropertyManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PropertyMap>> {
        self.inner
            .lock()
            .map_err(|e| Error::Internal(format!("property lock poisoned: {e}")))
    }

    /// Sets one property, creating the handle's record if absent.
    pub fn set(&self, handle: &str, key: &str, value: &str) -> Result<()> {
        let mut props = self.lock()?;
        props
            .entry(handle.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Reads one property; `None` when the handle or key is unknown.
    pub fn get(&self, handle: &str, key: &str) -> Result<Option<String>> {
        let props = self.lock()?;
        Ok(props.get(handle).and_then(|m| m.get(key)).cloned())
    }

    /// Returns the whole property set of a handle.
    pub fn all(&self, handle: &str) -> Result<HashMap<String, String>> {
        let props = self.lock()?;
        Ok(props.get(handle).cloned().unwrap_or_default())
    }

    /// Removes one property. Removing an absent key is not an error.
    pub fn remove(&self, handle: &str, key: &str) -> Result<()> {
        let mut props = self.lock()?;
        if let Some(m) = props.get_mut(handle) {
            m.remove(key);
        }
        Ok(())
    }

    /// Purges every property of a handle.
    pub fn remove_all(&self, handle: &str) -> Result<()> {
        let mut props = self.lock()?;
        props.remove(handle);
        Ok(())
    }

    /// Returns the handles whose property set is a superset of `filter`.
    ///
    /// An empty filter matches every recorded handle.
    pub fn matches_all(&self, filter: &HashMap<String, String>) -> Result<Vec<String>> {
        let props = self.lock()?;
        let mut handles: Vec<String> = props
            .iter()
            .filter(|(_, set)| {
                filter
                    .iter()
                    .all(|(k, v)| set.get(k).is_some_and(|have| have == v))
            })
            .map(|(handle, _)| handle.clone())
            .collect();
        handles.sort();
        Ok(handles)
    }
}
