//! Durable storage for schedules and content items.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::{MemoryContentStore, MemoryJobStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::StoreError;
use crate::types::{
    ContentItem, DeliveryFailure, DeliveryRef, DestinationId, ItemId, ItemStatus, JobId, Schedule,
};

/// Persistence for schedules.
///
/// A job's status must be durable before the scheduler acts on it, so every
/// write completes before the corresponding call returns.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job; fails with [`StoreError::Conflict`] if the id exists.
    async fn insert(&self, job: &Schedule) -> Result<(), StoreError>;

    async fn get(&self, id: &JobId) -> Result<Option<Schedule>, StoreError>;

    /// Persist the job's status and bookkeeping fields.
    ///
    /// Fails with [`StoreError::Rejected`] if the stored status cannot move to
    /// the new one.
    async fn update_status(&self, job: &Schedule) -> Result<(), StoreError>;

    async fn find_pending(&self) -> Result<Vec<Schedule>, StoreError>;

    async fn find_executing(&self) -> Result<Vec<Schedule>, StoreError>;

    async fn find_by_item(&self, item_id: &ItemId) -> Result<Vec<Schedule>, StoreError>;

    /// All jobs, oldest first.
    async fn list(&self) -> Result<Vec<Schedule>, StoreError>;

    /// Remove a job; returns whether it existed.
    async fn delete(&self, id: &JobId) -> Result<bool, StoreError>;
}

/// Persistence for content items.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn insert(&self, item: &ContentItem) -> Result<(), StoreError>;

    async fn get(&self, id: &ItemId) -> Result<Option<ContentItem>, StoreError>;

    /// Move the item to `status` along its transition table; `published_at`
    /// is stamped on `Published`. Illegal moves fail with
    /// [`StoreError::Rejected`].
    async fn update_status(
        &self,
        id: &ItemId,
        status: ItemStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Record a successful delivery, clearing any failure for that destination.
    ///
    /// Only targets of the item are accepted, and only once it is publishing.
    async fn record_delivery_result(
        &self,
        id: &ItemId,
        destination: &DestinationId,
        delivery_ref: &DeliveryRef,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn record_delivery_failure(
        &self,
        id: &ItemId,
        destination: &DestinationId,
        failure: &DeliveryFailure,
    ) -> Result<(), StoreError>;
}

/// Apply a status change to a stored item through its transition table.
///
/// Re-applying the current status is a no-op, so a retried write is safe.
pub(crate) fn apply_status(
    item: &mut ContentItem,
    status: ItemStatus,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    if item.status == status {
        return Ok(());
    }
    let applied = match status {
        ItemStatus::Publishing => item.begin_publishing(at),
        _ => item.transition(status, at),
    };
    applied.map_err(|e| StoreError::Rejected(e.to_string()))
}

/// Apply a delivery success to a stored item.
pub(crate) fn apply_result(
    item: &mut ContentItem,
    destination: &DestinationId,
    delivery_ref: &DeliveryRef,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    item.record_delivery(destination.clone(), delivery_ref.clone(), at)
        .map_err(|e| StoreError::Rejected(e.to_string()))
}

/// Apply a delivery failure to a stored item.
pub(crate) fn apply_failure(
    item: &mut ContentItem,
    destination: &DestinationId,
    failure: &DeliveryFailure,
) -> Result<(), StoreError> {
    item.record_failure(destination.clone(), failure.clone(), failure.at)
        .map_err(|e| StoreError::Rejected(e.to_string()))
}

/// Overwrite a stored job, refusing writes that move it backwards.
///
/// Another process sharing the store may have cancelled the job since it was
/// read; its status only moves along the job transition table.
pub(crate) fn apply_job(stored: &mut Schedule, job: &Schedule) -> Result<(), StoreError> {
    if stored.status != job.status && !stored.status.can_transition_to(job.status) {
        return Err(StoreError::Rejected(format!(
            "job {} is {}, cannot become {}",
            job.id, stored.status, job.status
        )));
    }
    *stored = job.clone();
    Ok(())
}
