//! Retry with capped exponential backoff and full jitter.

use std::time::Duration;

use rand::Rng;
use tokio::time;
use tracing::debug;

use crate::config::RetryConfig;

// ============================================================================
// RetryPolicy
// ============================================================================

/// Backoff parameters for [`retry`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Full jitter: the applied delay is drawn uniformly from
    /// `[0, computed]` rather than added on top of it.
    pub jitter: bool,
}

impl RetryPolicy {
    /// The computed (pre-jitter) delay after attempt `attempt` (0-indexed):
    /// `min(base * multiplier^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    fn applied_delay(&self, attempt: u32) -> Duration {
        let computed = self.delay_for(attempt);
        if self.jitter {
            computed.mul_f64(rand::rng().random_range(0.0..=1.0))
        } else {
            computed
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}

// ============================================================================
// retry
// ============================================================================

/// Run `op` until it succeeds, the error is classified non-retryable, or
/// `max_attempts` is exhausted. The last error is returned unchanged.
///
/// The backoff sleep suspends only the retrying task. `op` receives the
/// 0-indexed attempt number.
pub async fn retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    mut op: F,
    is_retryable: C,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !is_retryable(&error) || attempt + 1 >= policy.max_attempts {
                    return Err(error);
                }
                let delay = policy.applied_delay(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after error"
                );
                time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
