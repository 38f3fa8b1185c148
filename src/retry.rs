//! Bounded retry with linear backoff for whole read cycles and writes.

use crate::Result;
use std::future::Future;
use std::time::Duration;

/// How often and how patiently a recoverable operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    /// Delay before the second attempt; attempt `n` waits `n - 1` times this.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff * attempt.saturating_sub(1)
    }
}

/// Runs `operation` until it succeeds, fails with an error that is not
/// [recoverable](crate::Error::is_recoverable), or the attempts are used up.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(err) if err.is_recoverable() && attempt < policy.attempts => {
                attempt += 1;
                let delay = policy.delay(attempt);
                log::warn!(
                    "Attempt {} of {} failed: {err}, retrying in {delay:?}",
                    attempt - 1,
                    policy.attempts
                );
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}
