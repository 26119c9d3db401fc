//! Bounded exponential backoff for runtime operations.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{QueueError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Spread each delay randomly over `[delay, 1.5 * delay)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after `failures` failed attempts (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.max(1.0).powi(exponent);
        let delay = Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()));
        if self.jitter && !delay.is_zero() {
            let spread = rand::thread_rng().gen_range(1.0..1.5);
            delay.mul_f64(spread).min(self.max_delay)
        } else {
            delay
        }
    }
}

/// Run `operation` until it succeeds or the policy's attempts are used up.
///
/// Rejections are returned as they are, without further attempts.
/// Exhaustion yields [`QueueError::RetryExhausted`] carrying the last error.
pub async fn run_retrying<T, F, Fut>(policy: &RetryPolicy, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut failures = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_rejection() => return Err(e),
            Err(e) => {
                failures += 1;
                if failures >= attempts {
                    tracing::error!(operation = what, attempts, error = %e, "Giving up");
                    return Err(QueueError::RetryExhausted {
                        attempts,
                        last_error: e.to_string(),
                    });
                }
                let delay = policy.delay_after(failures);
                tracing::warn!(
                    operation = what,
                    attempt = failures,
                    error = %e,
                    retry_in = ?delay,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
