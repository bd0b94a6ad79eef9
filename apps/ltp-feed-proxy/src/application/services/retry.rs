//! Bounded Retry
//!
//! One retry schedule shared by upstream subscribe/unsubscribe forwarding
//! (fixed delay) and primary feed reconnection (exponential with jitter).

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Retry schedule: how long to wait between attempts and how many retries
/// follow the first attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor applied per retry (1.0 keeps the delay fixed).
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
}

impl RetryConfig {
    /// Fixed delay between a bounded number of attempts.
    ///
    /// `attempts` counts the first try; `fixed(2s, 3)` tries three times
    /// with two seconds between tries.
    #[must_use]
    pub const fn fixed(delay: Duration, attempts: u32) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter_factor: 0.0,
            max_retries: attempts.saturating_sub(1),
        }
    }

    /// Doubling delay with ±10% jitter, capped at `max_delay`.
    #[must_use]
    pub const fn exponential(
        initial_delay: Duration,
        max_delay: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_retries,
        }
    }

    /// Total attempts including the first.
    #[must_use]
    pub const fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Un-jittered delay before retry number `retry` (zero-based).
    fn base_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Stateful walk through a [`RetryConfig`] schedule.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use ltp_feed_proxy::application::services::retry::{RetryConfig, RetryPolicy};
///
/// let mut policy = RetryPolicy::new(RetryConfig::fixed(Duration::from_secs(2), 3));
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
/// assert_eq!(policy.next_delay(), None);
///
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    retries: u32,
}

impl RetryPolicy {
    /// Create a policy at the start of its schedule.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config, retries: 0 }
    }

    /// Delay before the next retry, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.config.max_retries {
            return None;
        }

        let delay = self.config.base_delay(self.retries);
        self.retries += 1;

        Some(self.jittered(delay))
    }

    /// Restart the schedule after a success.
    pub const fn reset(&mut self) {
        self.retries = 0;
    }

    /// Retries consumed so far.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.retries
    }

    /// Whether another retry is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.retries < self.config.max_retries
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let base = delay.as_secs_f64();
        let spread = base * self.config.jitter_factor;
        let offset: f64 = rand::rng().random_range(-spread..=spread);

        Duration::try_from_secs_f64((base + offset).max(0.001)).unwrap_or(delay)
    }
}

/// Retry budget exhausted.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// Error from the final attempt.
        last: E,
    },
}

/// Run `operation` until it succeeds or the schedule is spent.
///
/// The closure receives the one-based attempt number.
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] with the final error when every
/// attempt failed.
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut policy = RetryPolicy::new(config.clone());
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let Some(delay) = policy.next_delay() else {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                };

                tracing::debug!(
                    attempt,
                    error = %error,
                    delay_ms = delay.as_millis(),
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
