//! Retry with jittered backoff.
//!
//! One combinator covers every retriable network call (candle fetches, LTP,
//! margin quotes, token refresh). Order placement is deliberately never run
//! through it: retrying an order the broker rejected is unsafe.

use anyhow::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Attempt count and base delay for one class of calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based): linear backoff plus
    /// up to half a base-delay of jitter so parallel scans do not stampede.
    fn delay_for(&self, attempt: u32) -> Duration {
        let linear = self.base_delay * attempt;
        let jitter_ms = rand::thread_rng().gen_range(0..=self.base_delay.as_millis() as u64 / 2);
        linear + Duration::from_millis(jitter_ms)
    }
}

/// Run `operation` up to `policy.max_attempts` times, sleeping between
/// attempts. Returns the first success or the last error.
pub async fn with_backoff<T, F, Fut>(policy: RetryPolicy, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < attempts {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        "{label}: attempt {attempt}/{attempts} failed ({e:#}), retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    warn!("{label}: attempt {attempt}/{attempts} failed ({e:#}), giving up");
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.expect("at least one attempt"))
}
