//! In-process stores backed by concurrent maps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{ContentStore, JobStore, apply_failure, apply_job, apply_result, apply_status};
use crate::StoreError;
use crate::types::{
    ContentItem, DeliveryFailure, DeliveryRef, DestinationId, ItemId, ItemStatus, JobId, JobStatus,
    Schedule,
};

/// Volatile job store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: DashMap<JobId, Schedule>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(&self, keep: impl Fn(&Schedule) -> bool) -> Vec<Schedule> {
        let mut jobs: Vec<Schedule> = self
            .jobs
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Schedule) -> Result<(), StoreError> {
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(job.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &JobId) -> Result<Option<Schedule>, StoreError> {
        Ok(self.jobs.get(id).map(|job| job.value().clone()))
    }

    async fn update_status(&self, job: &Schedule) -> Result<(), StoreError> {
        match self.jobs.get_mut(&job.id) {
            Some(mut stored) => apply_job(stored.value_mut(), job),
            None => Err(StoreError::NotFound(job.id.to_string())),
        }
    }

    async fn find_pending(&self) -> Result<Vec<Schedule>, StoreError> {
        Ok(self.collect(|job| job.status == JobStatus::Pending))
    }

    async fn find_executing(&self) -> Result<Vec<Schedule>, StoreError> {
        Ok(self.collect(|job| job.status == JobStatus::Executing))
    }

    async fn find_by_item(&self, item_id: &ItemId) -> Result<Vec<Schedule>, StoreError> {
        Ok(self.collect(|job| &job.item_id == item_id))
    }

    async fn list(&self) -> Result<Vec<Schedule>, StoreError> {
        Ok(self.collect(|_| true))
    }

    async fn delete(&self, id: &JobId) -> Result<bool, StoreError> {
        Ok(self.jobs.remove(id).is_some())
    }
}

/// Volatile content store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    items: DashMap<ItemId, ContentItem>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` to a copy and keep it only if `f` succeeds.
    fn modify(
        &self,
        id: &ItemId,
        f: impl FnOnce(&mut ContentItem) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        match self.items.get_mut(id) {
            Some(mut item) => {
                let mut next = item.value().clone();
                f(&mut next)?;
                *item = next;
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn insert(&self, item: &ContentItem) -> Result<(), StoreError> {
        match self.items.entry(item.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(item.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(item.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &ItemId) -> Result<Option<ContentItem>, StoreError> {
        Ok(self.items.get(id).map(|item| item.value().clone()))
    }

    async fn update_status(
        &self,
        id: &ItemId,
        status: ItemStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.modify(id, |item| apply_status(item, status, at))
    }

    async fn record_delivery_result(
        &self,
        id: &ItemId,
        destination: &DestinationId,
        delivery_ref: &DeliveryRef,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.modify(id, |item| apply_result(item, destination, delivery_ref, at))
    }

    async fn record_delivery_failure(
        &self,
        id: &ItemId,
        destination: &DestinationId,
        failure: &DeliveryFailure,
    ) -> Result<(), StoreError> {
        self.modify(id, |item| apply_failure(item, destination, failure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;
    use std::collections::BTreeSet;

    fn job_for(item: &str) -> Schedule {
        Schedule::new(
            ItemId::from(item),
            BTreeSet::from([DestinationId::from("x")]),
            Utc::now(),
            3,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_insert_conflict() {
        let store = MemoryJobStore::new();
        let job = job_for("a");
        store.insert(&job).await.unwrap();
        assert!(matches!(
            store.insert(&job).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_status_queries() {
        let store = MemoryJobStore::new();
        let pending = job_for("a");
        let mut running = job_for("b");
        running.start(Utc::now()).unwrap();
        store.insert(&pending).await.unwrap();
        store.insert(&running).await.unwrap();

        let found = store.find_pending().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, pending.id);

        let found = store.find_executing().await.unwrap();
        assert_eq!(found[0].id, running.id);

        assert_eq!(store.find_by_item(&"b".into()).await.unwrap().len(), 1);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_unknown_job() {
        let store = MemoryJobStore::new();
        assert!(matches!(
            store.update_status(&job_for("a")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryJobStore::new();
        let job = job_for("a");
        store.insert(&job).await.unwrap();
        assert!(store.delete(&job.id).await.unwrap());
        assert!(!store.delete(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_job_write_rejected() {
        let store = MemoryJobStore::new();
        let job = job_for("a");
        store.insert(&job).await.unwrap();

        let mut cancelled = job.clone();
        cancelled.cancel(Utc::now()).unwrap();
        store.update_status(&cancelled).await.unwrap();

        let mut started = job.clone();
        started.start(Utc::now()).unwrap();
        assert!(matches!(
            store.update_status(&started).await,
            Err(StoreError::Rejected(_))
        ));
        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_item_results_and_status() {
        let store = MemoryContentStore::new();
        let now = Utc::now();
        let item = ContentItem::draft(
            Payload::text("hi").unwrap(),
            [DestinationId::from("x")],
            now,
        )
        .unwrap();
        store.insert(&item).await.unwrap();

        store
            .update_status(&item.id, ItemStatus::Scheduled, now)
            .await
            .unwrap();
        store
            .update_status(&item.id, ItemStatus::Publishing, now)
            .await
            .unwrap();
        store
            .record_delivery_result(&item.id, &"x".into(), &"m-1".into(), now)
            .await
            .unwrap();
        store
            .update_status(&item.id, ItemStatus::Published, now)
            .await
            .unwrap();

        let stored = store.get(&item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Published);
        assert_eq!(stored.published_at, Some(now));
        assert_eq!(
            stored.delivery_results.get(&DestinationId::from("x")),
            Some(&DeliveryRef::from("m-1"))
        );
    }

    #[tokio::test]
    async fn test_item_guards_leave_item_untouched() {
        let store = MemoryContentStore::new();
        let now = Utc::now();
        let item = ContentItem::draft(
            Payload::text("hi").unwrap(),
            [DestinationId::from("x")],
            now,
        )
        .unwrap();
        store.insert(&item).await.unwrap();

        // Results only attach once the item is publishing.
        assert!(matches!(
            store
                .record_delivery_result(&item.id, &"x".into(), &"m-1".into(), now)
                .await,
            Err(StoreError::Rejected(_))
        ));
        assert!(matches!(
            store.update_status(&item.id, ItemStatus::Published, now).await,
            Err(StoreError::Rejected(_))
        ));
        // Draft to publishing goes through scheduled.
        store
            .update_status(&item.id, ItemStatus::Publishing, now)
            .await
            .unwrap();
        assert!(matches!(
            store
                .record_delivery_result(&item.id, &"y".into(), &"m-1".into(), now)
                .await,
            Err(StoreError::Rejected(_))
        ));

        let stored = store.get(&item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Publishing);
        assert!(stored.delivery_results.is_empty());
    }
}
