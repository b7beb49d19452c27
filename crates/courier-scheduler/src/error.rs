//! Error types for the scheduler.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{DestinationId, ErrorClass, ItemId, JobId};

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The requested due time is further in the past than the grace tolerance allows.
    #[error("due time {due_time} is in the past (now {now})")]
    PastDue {
        due_time: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    /// The requested due time is beyond the scheduling horizon.
    #[error("due time {due_time} is more than {horizon_days} days ahead")]
    TooFarAhead {
        due_time: DateTime<Utc>,
        horizon_days: u32,
    },

    /// Another job is already pending or executing for the item.
    #[error("item {item_id} already has an active job: {job_id}")]
    DuplicateJob { item_id: ItemId, job_id: JobId },

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Content item not found.
    #[error("content item not found: {0}")]
    ItemNotFound(ItemId),

    /// A lifecycle rule was violated.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// The backing store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The scheduler configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Violations of the content-item and schedule lifecycle rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// The requested status change is not in the allowed transition table.
    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: &'static str,
        to: &'static str,
    },

    /// The payload failed validation.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A destination was referenced that the item does not target.
    #[error("destination {destination} is not a target of item {item_id}")]
    UnknownDestination {
        item_id: ItemId,
        destination: DestinationId,
    },

    /// An item or job was given no destinations.
    #[error("at least one destination is required")]
    EmptyDestinations,
}

/// Errors reported by job and content stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record not found.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A record with the same identity already exists.
    #[error("record already exists: {0}")]
    Conflict(String),

    /// The write contradicts the stored record's state.
    #[error("write rejected: {0}")]
    Rejected(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether repeating the same write may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Unavailable(_))
    }
}

/// Invalid scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub(crate) fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors returned by a [`Transport`](crate::Transport) for a single delivery.
///
/// Every variant is either transient (eligible for a retry through a new
/// schedule) or permanent (recorded and never retried); see [`DeliveryError::class`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The destination is throttling us.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited { retry_after_secs: Option<u64> },

    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// The attempt did not finish within its deadline.
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    /// The destination reported a temporary outage.
    #[error("destination unavailable: {0}")]
    Unavailable(String),

    /// The destination no longer exists.
    #[error("destination not found: {0}")]
    NotFound(String),

    /// We are no longer allowed to deliver to the destination.
    #[error("not authorized for destination: {0}")]
    Forbidden(String),

    /// The destination refused the payload itself.
    #[error("payload rejected: {0}")]
    Rejected(String),
}

impl DeliveryError {
    /// Classify this error as transient or permanent.
    pub fn class(&self) -> ErrorClass {
        match self {
            DeliveryError::RateLimited { .. }
            | DeliveryError::Network(_)
            | DeliveryError::Timeout(_)
            | DeliveryError::Unavailable(_) => ErrorClass::Transient,
            DeliveryError::NotFound(_)
            | DeliveryError::Forbidden(_)
            | DeliveryError::Rejected(_) => ErrorClass::Permanent,
        }
    }

    /// Whether a later attempt may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_display() {
        let with = DeliveryError::RateLimited {
            retry_after_secs: Some(5),
        };
        assert_eq!(with.to_string(), "rate limited (retry after 5s)");

        let without = DeliveryError::RateLimited {
            retry_after_secs: None,
        };
        assert_eq!(without.to_string(), "rate limited");
    }

    #[test]
    fn test_delivery_error_taxonomy() {
        assert!(DeliveryError::RateLimited { retry_after_secs: None }.is_transient());
        assert!(DeliveryError::Network("reset".into()).is_transient());
        assert!(DeliveryError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(DeliveryError::Unavailable("502".into()).is_transient());

        assert!(!DeliveryError::NotFound("gone".into()).is_transient());
        assert!(!DeliveryError::Forbidden("kicked".into()).is_transient());
        assert_eq!(
            DeliveryError::Rejected("too long".into()).class(),
            ErrorClass::Permanent
        );
    }
}
