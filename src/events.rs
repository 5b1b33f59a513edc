//! Per-handle container event store.
//!
//! The runtime event watcher pushes human-readable events (currently only
//! `"Out of memory"`) here; `Info` reads them back out.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;

/// Receives events surfaced by the runtime for a handle.
pub trait EventSink: Send + Sync {
    fn on_event(&self, handle: &str, event: &str);
}

/// In-memory event store, one ordered list per handle.
#[derive(Debug, Default)]
pub struct EventStore {
    inner: Mutex<HashMap<String, Vec<String>>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the events recorded for a handle, in arrival order.
    pub fn events(&self, handle: &str) -> Result<Vec<String>> {
        let events = self
            .inner
            .lock()
            .map_err(|e| Error::Internal(format!("event lock poisoned: {e}")))?;
        Ok(events.get(handle).cloned().unwrap_or_default())
    }

    /// Drops every event recorded for a handle.
    pub fn remove(&self, handle: &str) {
        if let Ok(mut events) = self.inner.lock() {
            events.remove(handle);
        }
    }
}

impl EventSink for EventStore {
    fn on_event(&self, handle: &str, event: &str) {
        if let Ok(mut events) = self.inner.lock() {
            events
                .entry(handle.to_string())
                .or_default()
                .push(event.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_recorded_in_order() {
        let store = EventStore::new();
        store.on_event("c1", "Out of memory");
        store.on_event("c1", "Out of memory");
        store.on_event("c2", "Out of memory");
        assert_eq!(
            store.events("c1").unwrap(),
            vec!["Out of memory", "Out of memory"]
        );
        assert_eq!(store.events("c2").unwrap().len(), 1);
        assert!(store.events("c3").unwrap().is_empty());
    }

    #[test]
    fn remove_clears_a_handle() {
        let store = EventStore::new();
        store.on_event("c1", "Out of memory");
        store.remove("c1");
        assert!(store.events("c1").unwrap().is_empty());
    }
}
