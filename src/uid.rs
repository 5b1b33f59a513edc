//! Handle and process-token generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Generates opaque unique identifiers for handles and process tokens.
pub trait UidGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Random v4 UUID generator used in production.
#[derive(Debug, Default)]
pub struct UuidGenerator;

impl UidGenerator for UuidGenerator {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Monotonic counter used for short, predictable names such as network
/// interfaces, where the 15-byte kernel limit rules out UUIDs.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
