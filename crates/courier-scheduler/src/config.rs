//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Longest retry delay a configuration may ask for.
const MAX_BACKOFF_CAP_SECONDS: u64 = 30 * 24 * 3600;

/// Tunables for scheduling, retries, throttling, and retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Total delivery attempts per item, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub backoff_base_seconds: u64,
    /// Upper bound on any retry delay.
    pub backoff_cap_seconds: u64,
    /// Minimum spacing between sends to the same destination.
    pub min_interval_per_destination_ms: u64,
    /// Concurrent deliveries per fan-out round; unbounded when unset.
    pub dispatch_parallelism: Option<usize>,
    /// How far in the past a due time may be and still be accepted.
    pub past_due_grace_seconds: u64,
    /// Deadline for a single transport call.
    pub attempt_timeout_seconds: u64,
    /// How far ahead a job may be scheduled.
    pub max_schedule_horizon_days: u32,
    /// Age after which finished jobs are purged.
    pub retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_seconds: 60,
            backoff_cap_seconds: 3600,
            min_interval_per_destination_ms: 1000,
            dispatch_parallelism: None,
            past_due_grace_seconds: 60,
            attempt_timeout_seconds: 30,
            max_schedule_horizon_days: 365,
            retention_days: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_seconds)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_seconds)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_per_destination_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_seconds)
    }

    pub fn past_due_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.past_due_grace_seconds).unwrap_or(i64::MAX))
    }

    pub fn horizon(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.max_schedule_horizon_days))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    /// Reject configurations the scheduler cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::new("max_attempts", "must be at least 1"));
        }
        if self.backoff_base_seconds == 0 {
            return Err(ConfigError::new("backoff_base_seconds", "must be positive"));
        }
        if self.backoff_cap_seconds > MAX_BACKOFF_CAP_SECONDS {
            return Err(ConfigError::new(
                "backoff_cap_seconds",
                format!("must be at most {} (30 days)", MAX_BACKOFF_CAP_SECONDS),
            ));
        }
        if self.backoff_cap_seconds < self.backoff_base_seconds {
            return Err(ConfigError::new(
                "backoff_cap_seconds",
                format!(
                    "must be at least backoff_base_seconds ({})",
                    self.backoff_base_seconds
                ),
            ));
        }
        if self.min_interval_per_destination_ms == 0 {
            return Err(ConfigError::new(
                "min_interval_per_destination_ms",
                "must be positive",
            ));
        }
        if self.dispatch_parallelism == Some(0) {
            return Err(ConfigError::new("dispatch_parallelism", "must be positive"));
        }
        if self.attempt_timeout_seconds == 0 {
            return Err(ConfigError::new("attempt_timeout_seconds", "must be positive"));
        }
        if self.past_due_grace_seconds > i64::MAX as u64 / 1000 {
            return Err(ConfigError::new("past_due_grace_seconds", "is too large"));
        }
        if self.max_schedule_horizon_days == 0 || self.max_schedule_horizon_days > 100_000 {
            return Err(ConfigError::new(
                "max_schedule_horizon_days",
                "must be between 1 and 100000",
            ));
        }
        if self.retention_days == 0 || self.retention_days > 100_000 {
            return Err(ConfigError::new("retention_days", "must be between 1 and 100000"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_interval(), Duration::from_secs(1));
        assert_eq!(config.horizon(), chrono::Duration::days(365));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"max_attempts": 5, "dispatch_parallelism": 4}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.dispatch_parallelism, Some(4));
        assert_eq!(config.backoff_base_seconds, 60);
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let config = SchedulerConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "max_attempts");
    }

    #[test]
    fn test_rejects_cap_below_base() {
        let config = SchedulerConfig {
            backoff_base_seconds: 120,
            backoff_cap_seconds: 60,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "backoff_cap_seconds");
    }

    #[test]
    fn test_rejects_zero_interval() {
        let config = SchedulerConfig {
            min_interval_per_destination_ms: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().field,
            "min_interval_per_destination_ms"
        );
    }

    #[test]
    fn test_rejects_unbounded_cap() {
        let config = SchedulerConfig {
            backoff_cap_seconds: u64::MAX,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "backoff_cap_seconds");

        let config = SchedulerConfig {
            backoff_cap_seconds: MAX_BACKOFF_CAP_SECONDS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_parallelism() {
        let config = SchedulerConfig {
            dispatch_parallelism: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
