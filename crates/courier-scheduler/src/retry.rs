//! Exponential backoff with a cap.

use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;

use crate::SchedulerConfig;

/// Bounded exponential backoff: `delay(n) = min(base * 2^n, cap)`.
///
/// The same curve drives delivery retries (through new schedules) and
/// retries of failed store writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

/// Whether to retry, and after how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(60),
            cap: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            base,
            cap,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.max_attempts, config.backoff_base(), config.backoff_cap())
    }

    /// Delay before the attempt following attempt `attempt_count`.
    ///
    /// Saturates at `cap` instead of overflowing.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        2u32.checked_pow(attempt_count)
            .and_then(|factor| self.base.checked_mul(factor))
            .map(|delay| delay.min(self.cap))
            .unwrap_or(self.cap)
    }

    /// The same curve as an [`ExponentialBackoff`] without jitter, for
    /// retry loops that sleep in place.
    pub fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.base,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.cap,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }

    /// Decide what happens after attempt `attempt_count` (zero-based) failed.
    ///
    /// Attempts are numbered `0..max_attempts`, so a retry is allowed only if
    /// `attempt_count + 1` is still below the limit.
    pub fn next_attempt(&self, attempt_count: u32) -> RetryDecision {
        RetryDecision {
            should_retry: attempt_count.saturating_add(1) < self.max_attempts,
            delay: self.delay_for(attempt_count),
        }
    }
}
