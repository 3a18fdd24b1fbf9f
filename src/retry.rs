//! Bounded retry with exponential backoff.
//!
//! Both the upstream client and the asset relocator apply the same policy
//! instead of hand-rolled retry loops.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// An explicit retry policy: a bounded number of attempts with
/// exponentially growing delays between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Run `op` until it succeeds or `max_attempts` is reached, sleeping
    /// between attempts. Returns the last error on exhaustion.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        what,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "retrying after {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}
