//! Bounded fixed-interval retry.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retries a fallible async operation a fixed number of times, sleeping a
/// fixed interval between attempts, and returns the last error when every
/// attempt fails.
#[derive(Debug, Clone, Copy)]
pub struct Retrier {
    attempts: u32,
    interval: Duration,
}

impl Retrier {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.attempts => return Err(err),
                Err(err) => {
                    debug!(attempt, error = %err, "retrying after failure");
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }
}
