//! Content items, schedules, and their lifecycle rules.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ModelError;

/// Maximum length of a text body, in characters.
pub const MAX_TEXT_CHARS: usize = 4096;

/// Maximum length of a media caption, in characters.
pub const MAX_CAPTION_CHARS: usize = 1024;

/// Smallest media group a destination accepts.
pub const MIN_MEDIA_GROUP: usize = 2;

/// Largest media group a destination accepts.
pub const MAX_MEDIA_GROUP: usize = 10;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Opaque content item identifier.
    ItemId
);
string_id!(
    /// Opaque schedule (job) identifier.
    JobId
);
string_id!(
    /// Opaque identifier of an external delivery target.
    DestinationId
);
string_id!(
    /// Transport-issued reference to a delivered message.
    DeliveryRef
);

impl ItemId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Kind of a referenced media object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
    Animation,
    Voice,
    VideoNote,
}

impl MediaKind {
    /// Whether this kind may appear inside a media group.
    pub fn groupable(self) -> bool {
        matches!(
            self,
            MediaKind::Photo | MediaKind::Video | MediaKind::Audio | MediaKind::Document
        )
    }
}

/// Reference to media already held by the transport (e.g. an uploaded file id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub reference: String,
}

impl MediaRef {
    pub fn new(kind: MediaKind, reference: impl Into<String>) -> Self {
        Self {
            kind,
            reference: reference.into(),
        }
    }
}

/// Transport-agnostic content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Plain text message.
    Text { body: String },
    /// A single media object with an optional caption.
    MediaReference {
        media: MediaRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    /// An album of media objects delivered together.
    MediaGroup {
        media: Vec<MediaRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl Payload {
    /// Build a validated text payload.
    pub fn text(body: impl Into<String>) -> Result<Self, ModelError> {
        let payload = Payload::Text { body: body.into() };
        payload.validate()?;
        Ok(payload)
    }

    /// Build a validated single-media payload.
    pub fn media(media: MediaRef, caption: Option<String>) -> Result<Self, ModelError> {
        let payload = Payload::MediaReference { media, caption };
        payload.validate()?;
        Ok(payload)
    }

    /// Build a validated media group payload.
    pub fn media_group(media: Vec<MediaRef>, caption: Option<String>) -> Result<Self, ModelError> {
        let payload = Payload::MediaGroup { media, caption };
        payload.validate()?;
        Ok(payload)
    }

    /// Check the payload against the per-kind limits.
    ///
    /// Payloads read back from a store bypass the constructors, so items
    /// re-validate on creation.
    pub fn validate(&self) -> Result<(), ModelError> {
        match self {
            Payload::Text { body } => {
                if body.trim().is_empty() {
                    return Err(ModelError::InvalidPayload("text body is empty".into()));
                }
                let len = body.chars().count();
                if len > MAX_TEXT_CHARS {
                    return Err(ModelError::InvalidPayload(format!(
                        "text body is {} characters, limit is {}",
                        len, MAX_TEXT_CHARS
                    )));
                }
            }
            Payload::MediaReference { media, caption } => {
                validate_media_ref(media)?;
                validate_caption(caption.as_deref())?;
            }
            Payload::MediaGroup { media, caption } => {
                if media.len() < MIN_MEDIA_GROUP || media.len() > MAX_MEDIA_GROUP {
                    return Err(ModelError::InvalidPayload(format!(
                        "media group has {} entries, expected {}..={}",
                        media.len(),
                        MIN_MEDIA_GROUP,
                        MAX_MEDIA_GROUP
                    )));
                }
                for entry in media {
                    validate_media_ref(entry)?;
                    if !entry.kind.groupable() {
                        return Err(ModelError::InvalidPayload(format!(
                            "{:?} cannot be part of a media group",
                            entry.kind
                        )));
                    }
                }
                validate_caption(caption.as_deref())?;
            }
        }
        Ok(())
    }

    /// Short tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text { .. } => "text",
            Payload::MediaReference { .. } => "media_reference",
            Payload::MediaGroup { .. } => "media_group",
        }
    }
}

fn validate_media_ref(media: &MediaRef) -> Result<(), ModelError> {
    if media.reference.trim().is_empty() {
        return Err(ModelError::InvalidPayload("media reference is empty".into()));
    }
    Ok(())
}

fn validate_caption(caption: Option<&str>) -> Result<(), ModelError> {
    if let Some(caption) = caption {
        let len = caption.chars().count();
        if len > MAX_CAPTION_CHARS {
            return Err(ModelError::InvalidPayload(format!(
                "caption is {} characters, limit is {}",
                len, MAX_CAPTION_CHARS
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Delivery outcomes
// =============================================================================

/// Whether a failed delivery may succeed on a later attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Last recorded delivery failure for one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl DeliveryFailure {
    pub fn from_error(error: &crate::DeliveryError, at: DateTime<Utc>) -> Self {
        Self {
            class: error.class(),
            message: error.to_string(),
            at,
        }
    }
}

// =============================================================================
// Content item
// =============================================================================

/// Lifecycle status of a content item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Draft,
    Scheduled,
    Publishing,
    Published,
    Failed,
    Deleted,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Draft => "draft",
            ItemStatus::Scheduled => "scheduled",
            ItemStatus::Publishing => "publishing",
            ItemStatus::Published => "published",
            ItemStatus::Failed => "failed",
            ItemStatus::Deleted => "deleted",
        }
    }

    /// Whether the transition table allows moving from `self` to `next`.
    ///
    /// `Publishing -> Publishing` is allowed so that a retry round or a
    /// requeued crash recovery can re-enter publishing idempotently.
    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        match (self, next) {
            (Deleted, _) => false,
            (Publishing, Deleted) => false,
            (_, Deleted) => true,
            (Draft, Scheduled) => true,
            (Scheduled, Draft) => true,
            (Scheduled, Publishing) => true,
            (Publishing, Publishing | Published | Failed) => true,
            _ => false,
        }
    }

    /// Whether delivery results may be attached in this status.
    pub fn accepts_results(self) -> bool {
        matches!(
            self,
            ItemStatus::Publishing | ItemStatus::Published | ItemStatus::Failed
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of payload intended for delivery to one or more destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: ItemId,
    pub status: ItemStatus,
    pub destinations: BTreeSet<DestinationId>,
    pub payload: Payload,
    /// Destination -> transport reference, for destinations that succeeded.
    #[serde(default)]
    pub delivery_results: BTreeMap<DestinationId, DeliveryRef>,
    /// Destination -> last failure, for destinations that have not succeeded.
    #[serde(default)]
    pub delivery_failures: BTreeMap<DestinationId, DeliveryFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl ContentItem {
    /// Create a new draft item.
    pub fn draft(
        payload: Payload,
        destinations: impl IntoIterator<Item = DestinationId>,
        now: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        payload.validate()?;
        let destinations: BTreeSet<_> = destinations.into_iter().collect();
        if destinations.is_empty() {
            return Err(ModelError::EmptyDestinations);
        }

        Ok(Self {
            id: ItemId::generate(),
            status: ItemStatus::Draft,
            destinations,
            payload,
            delivery_results: BTreeMap::new(),
            delivery_failures: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            published_at: None,
        })
    }

    pub fn can_schedule(&self) -> bool {
        self.status.can_transition_to(ItemStatus::Scheduled)
    }

    pub fn can_delete(&self) -> bool {
        self.status.can_transition_to(ItemStatus::Deleted)
    }

    /// Move to `next`, or fail with [`ModelError::InvalidTransition`] leaving
    /// the item untouched.
    pub fn transition(&mut self, next: ItemStatus, now: DateTime<Utc>) -> Result<(), ModelError> {
        if !self.status.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                entity: "item",
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        self.status = next;
        self.updated_at = now;
        if next == ItemStatus::Published {
            self.published_at = Some(now);
        }
        Ok(())
    }

    /// Enter publishing from wherever a due job may find the item.
    ///
    /// A draft item is promoted through `scheduled` first: this happens when a
    /// crash separated persisting the job from persisting the item.
    pub fn begin_publishing(&mut self, now: DateTime<Utc>) -> Result<(), ModelError> {
        if self.status == ItemStatus::Draft {
            self.transition(ItemStatus::Scheduled, now)?;
        }
        self.transition(ItemStatus::Publishing, now)
    }

    /// Record a successful delivery to `destination`.
    pub fn record_delivery(
        &mut self,
        destination: DestinationId,
        delivery_ref: DeliveryRef,
        now: DateTime<Utc>,
    ) -> Result<(), ModelError> {
        self.check_result_target(&destination)?;
        self.delivery_failures.remove(&destination);
        self.delivery_results.insert(destination, delivery_ref);
        self.updated_at = now;
        Ok(())
    }

    /// Record the latest failed delivery to `destination`.
    pub fn record_failure(
        &mut self,
        destination: DestinationId,
        failure: DeliveryFailure,
        now: DateTime<Utc>,
    ) -> Result<(), ModelError> {
        self.check_result_target(&destination)?;
        self.delivery_failures.insert(destination, failure);
        self.updated_at = now;
        Ok(())
    }

    /// Destinations without a recorded delivery.
    pub fn undelivered(&self) -> BTreeSet<DestinationId> {
        self.destinations
            .iter()
            .filter(|d| !self.delivery_results.contains_key(*d))
            .cloned()
            .collect()
    }

    /// Whether every destination has a recorded delivery.
    pub fn fully_delivered(&self) -> bool {
        self.destinations
            .iter()
            .all(|d| self.delivery_results.contains_key(d))
    }

    fn check_result_target(&self, destination: &DestinationId) -> Result<(), ModelError> {
        if !self.destinations.contains(destination) {
            return Err(ModelError::UnknownDestination {
                item_id: self.id.clone(),
                destination: destination.clone(),
            });
        }
        if !self.status.accepts_results() {
            return Err(ModelError::InvalidTransition {
                entity: "item",
                from: self.status.as_str(),
                to: "delivery result",
            });
        }
        Ok(())
    }
}

// =============================================================================
// Schedule (job)
// =============================================================================

/// Current status of a schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its due time.
    #[default]
    Pending,
    /// A dispatch round is in flight.
    Executing,
    /// Every targeted destination succeeded.
    Executed,
    /// Gave up, or handed the remaining work to a retry job.
    Failed,
    /// Cancelled before it ran.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Executing => "executing",
            JobStatus::Executed => "executed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Executing | Cancelled)
                | (Executing, Executed | Failed | Pending)
                | (Failed, Cancelled)
        )
    }

    /// Pending or executing; at most one such job exists per item.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Executing)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Executed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a schedule does when it comes due.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Fan the item out to the job's destinations.
    #[default]
    Deliver,
    /// Delete the item.
    Delete,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Deliver => "deliver",
            JobKind::Delete => "delete",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What startup reconciliation did with an interrupted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Back to pending, due immediately.
    Requeued,
    /// The interrupted attempt was the last one allowed.
    Exhausted,
}

/// A persisted "act on this item at this time" record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: JobId,
    /// Weak reference to the content item.
    pub item_id: ItemId,
    #[serde(default)]
    pub kind: JobKind,
    /// When the job becomes due (UTC).
    pub due_time: DateTime<Utc>,
    pub status: JobStatus,
    /// Zero-based index of this attempt.
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Destinations this job targets; narrows on retry. Empty for deletions.
    pub destinations: BTreeSet<DestinationId>,
    /// Last error per destination, kept for display once the job fails.
    #[serde(default)]
    pub last_errors: BTreeMap<DestinationId, DeliveryFailure>,
    /// The job this one retries, if any.
    #[serde(default)]
    pub retry_of: Option<JobId>,
    /// The job that took over the remaining destinations, if any.
    #[serde(default)]
    pub retried_by: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Create a new pending job for a first attempt.
    pub fn new(
        item_id: ItemId,
        destinations: BTreeSet<DestinationId>,
        due_time: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::generate(),
            item_id,
            kind: JobKind::Deliver,
            due_time,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts,
            destinations,
            last_errors: BTreeMap::new(),
            retry_of: None,
            retried_by: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Create a pending job that deletes the item at `due_time`.
    pub fn deletion(
        item_id: ItemId,
        due_time: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: JobKind::Delete,
            ..Self::new(item_id, BTreeSet::new(), due_time, max_attempts, now)
        }
    }

    pub fn can_cancel(&self) -> bool {
        self.status.can_transition_to(JobStatus::Cancelled)
    }

    /// Whether another attempt fits within `max_attempts`.
    pub fn can_retry(&self) -> bool {
        self.attempt_count.saturating_add(1) < self.max_attempts
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), ModelError> {
        self.transition(JobStatus::Executing, now)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), ModelError> {
        self.transition(JobStatus::Executed, now)?;
        self.last_errors.clear();
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn fail(
        &mut self,
        errors: BTreeMap<DestinationId, DeliveryFailure>,
        now: DateTime<Utc>,
    ) -> Result<(), ModelError> {
        self.transition(JobStatus::Failed, now)?;
        self.last_errors = errors;
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), ModelError> {
        self.transition(JobStatus::Cancelled, now)?;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Build the follow-up job for the destinations that are still outstanding.
    pub fn retry(&self, destinations: BTreeSet<DestinationId>, due_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let mut next = Schedule::new(
            self.item_id.clone(),
            destinations,
            due_time,
            self.max_attempts,
            now,
        );
        next.attempt_count = self.attempt_count + 1;
        next.retry_of = Some(self.id.clone());
        next
    }

    /// Reconcile a job found `executing` at startup.
    ///
    /// The interrupted attempt counts: `attempt_count` grows by exactly one.
    /// If that leaves no attempt, the job fails instead of returning to pending.
    pub fn recover_interrupted(
        &mut self,
        remaining: BTreeSet<DestinationId>,
        now: DateTime<Utc>,
    ) -> Result<Recovery, ModelError> {
        if self.status != JobStatus::Executing {
            return Err(ModelError::InvalidTransition {
                entity: "job",
                from: self.status.as_str(),
                to: JobStatus::Pending.as_str(),
            });
        }

        let exhausted = !self.can_retry();
        self.attempt_count = (self.attempt_count + 1).min(self.max_attempts);

        if exhausted {
            self.status = JobStatus::Failed;
            self.finished_at = Some(now);
            self.updated_at = now;
            return Ok(Recovery::Exhausted);
        }

        if !remaining.is_empty() {
            self.destinations = remaining;
        }
        self.status = JobStatus::Pending;
        self.due_time = now;
        self.started_at = None;
        self.updated_at = now;
        Ok(Recovery::Requeued)
    }

    fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<(), ModelError> {
        // Back to pending only happens through recover_interrupted.
        if !self.status.can_transition_to(next) || next == JobStatus::Pending {
            return Err(ModelError::InvalidTransition {
                entity: "job",
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}
