//! A single-file JSON store for jobs and items.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ContentStore, JobStore, apply_failure, apply_job, apply_result, apply_status};
use crate::StoreError;
use crate::types::{
    ContentItem, DeliveryFailure, DeliveryRef, DestinationId, ItemId, ItemStatus, JobId, JobStatus,
    Schedule,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    jobs: BTreeMap<JobId, Schedule>,
    #[serde(default)]
    items: BTreeMap<ItemId, ContentItem>,
}

/// Where the document lives and the sibling file used to lock it.
#[derive(Debug)]
struct Paths {
    document: PathBuf,
    lock: PathBuf,
    tmp: PathBuf,
}

impl Paths {
    fn new(document: PathBuf) -> Self {
        let sibling = |suffix: &str| {
            let mut path = document.clone().into_os_string();
            path.push(suffix);
            PathBuf::from(path)
        };
        Self {
            lock: sibling(".lock"),
            tmp: sibling(".tmp"),
            document,
        }
    }

    fn lock_file(&self) -> Result<File, StoreError> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock)?)
    }

    fn load(&self) -> Result<Document, StoreError> {
        match std::fs::read(&self.document) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to the temporary sibling and rename it into place, so a crash
    /// leaves either the old or the new document on disk.
    fn save(&self, doc: &Document) -> Result<usize, StoreError> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        std::fs::write(&self.tmp, &bytes)?;
        std::fs::rename(&self.tmp, &self.document)?;
        Ok(bytes.len())
    }
}

/// Durable store that keeps both jobs and items in one JSON document.
///
/// Nothing is cached: every call re-reads the document under an advisory lock
/// on `<path>.lock`, shared for reads and exclusive for read-modify-write. A
/// daemon and CLI invocations can therefore share one file, and a write made
/// by one process is never clobbered by another's stale copy.
#[derive(Debug)]
pub struct FileStore {
    paths: Arc<Paths>,
    /// Keeps this handle's writers off the blocking pool while one waits.
    writer: Mutex<()>,
}

impl FileStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let store = Self {
            paths: Arc::new(Paths::new(path)),
            writer: Mutex::new(()),
        };
        let (jobs, items) = store.read(|doc| (doc.jobs.len(), doc.items.len())).await?;
        info!(path = %store.path().display(), jobs, items, "opened store");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.paths.document
    }

    async fn read<T>(
        &self,
        f: impl FnOnce(Document) -> T + Send + 'static,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
    {
        let paths = Arc::clone(&self.paths);
        tokio::task::spawn_blocking(move || {
            let lock = paths.lock_file()?;
            fs2::FileExt::lock_shared(&lock)?;
            let doc = paths.load()?;
            fs2::FileExt::unlock(&lock)?;
            Ok(f(doc))
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }

    /// Load the latest document, apply `f` and persist the result, all under
    /// the exclusive lock. Nothing is written if `f` fails.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Document) -> Result<T, StoreError> + Send + 'static,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
    {
        let _writer = self.writer.lock().await;
        let paths = Arc::clone(&self.paths);
        tokio::task::spawn_blocking(move || {
            let lock = paths.lock_file()?;
            fs2::FileExt::lock_exclusive(&lock)?;
            let mut doc = paths.load()?;
            let out = f(&mut doc)?;
            let bytes = paths.save(&doc)?;
            // The lock is released when `lock` drops.
            debug!(path = %paths.document.display(), bytes, "persisted store");
            Ok(out)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }

    async fn modify_item(
        &self,
        id: &ItemId,
        f: impl FnOnce(&mut ContentItem) -> Result<(), StoreError> + Send + 'static,
    ) -> Result<(), StoreError> {
        let id = id.clone();
        self.mutate(move |doc| match doc.items.get_mut(&id) {
            Some(item) => f(item),
            None => Err(StoreError::NotFound(id.to_string())),
        })
        .await
    }

    async fn jobs_where(
        &self,
        keep: impl Fn(&Schedule) -> bool + Send + 'static,
    ) -> Result<Vec<Schedule>, StoreError> {
        self.read(move |doc| {
            let mut jobs: Vec<Schedule> = doc.jobs.into_values().filter(|j| keep(j)).collect();
            jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            jobs
        })
        .await
    }
}

#[async_trait]
impl JobStore for FileStore {
    async fn insert(&self, job: &Schedule) -> Result<(), StoreError> {
        let job = job.clone();
        self.mutate(move |doc| {
            if doc.jobs.contains_key(&job.id) {
                return Err(StoreError::Conflict(job.id.to_string()));
            }
            doc.jobs.insert(job.id.clone(), job);
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &JobId) -> Result<Option<Schedule>, StoreError> {
        let id = id.clone();
        self.read(move |mut doc| doc.jobs.remove(&id)).await
    }

    async fn update_status(&self, job: &Schedule) -> Result<(), StoreError> {
        let job = job.clone();
        self.mutate(move |doc| match doc.jobs.get_mut(&job.id) {
            Some(stored) => apply_job(stored, &job),
            None => Err(StoreError::NotFound(job.id.to_string())),
        })
        .await
    }

    async fn find_pending(&self) -> Result<Vec<Schedule>, StoreError> {
        self.jobs_where(|j| j.status == JobStatus::Pending).await
    }

    async fn find_executing(&self) -> Result<Vec<Schedule>, StoreError> {
        self.jobs_where(|j| j.status == JobStatus::Executing).await
    }

    async fn find_by_item(&self, item_id: &ItemId) -> Result<Vec<Schedule>, StoreError> {
        let item_id = item_id.clone();
        self.jobs_where(move |j| j.item_id == item_id).await
    }

    async fn list(&self) -> Result<Vec<Schedule>, StoreError> {
        self.jobs_where(|_| true).await
    }

    async fn delete(&self, id: &JobId) -> Result<bool, StoreError> {
        let id = id.clone();
        self.mutate(move |doc| Ok(doc.jobs.remove(&id).is_some()))
            .await
    }
}

#[async_trait]
impl ContentStore for FileStore {
    async fn insert(&self, item: &ContentItem) -> Result<(), StoreError> {
        let item = item.clone();
        self.mutate(move |doc| {
            if doc.items.contains_key(&item.id) {
                return Err(StoreError::Conflict(item.id.to_string()));
            }
            doc.items.insert(item.id.clone(), item);
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &ItemId) -> Result<Option<ContentItem>, StoreError> {
        let id = id.clone();
        self.read(move |mut doc| doc.items.remove(&id)).await
    }

    async fn update_status(
        &self,
        id: &ItemId,
        status: ItemStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.modify_item(id, move |item| apply_status(item, status, at))
            .await
    }

    async fn record_delivery_result(
        &self,
        id: &ItemId,
        destination: &DestinationId,
        delivery_ref: &DeliveryRef,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let destination = destination.clone();
        let delivery_ref = delivery_ref.clone();
        self.modify_item(id, move |item| {
            apply_result(item, &destination, &delivery_ref, at)
        })
        .await
    }

    async fn record_delivery_failure(
        &self,
        id: &ItemId,
        destination: &DestinationId,
        failure: &DeliveryFailure,
    ) -> Result<(), StoreError> {
        let destination = destination.clone();
        let failure = failure.clone();
        self.modify_item(id, move |item| apply_failure(item, &destination, &failure))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn sample_item() -> ContentItem {
        ContentItem::draft(
            Payload::text("hello").unwrap(),
            [DestinationId::from("x"), DestinationId::from("y")],
            Utc::now(),
        )
        .unwrap()
    }

    fn sample_job(item: &ContentItem) -> Schedule {
        Schedule::new(
            item.id.clone(),
            item.destinations.clone(),
            Utc::now(),
            3,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_open_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("nested/courier.json"))
            .await
            .unwrap();
        assert!(JobStore::list(&store).await.unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("courier.json");
        let item = sample_item();
        let mut job = sample_job(&item);

        {
            let store = FileStore::open(&path).await.unwrap();
            ContentStore::insert(&store, &item).await.unwrap();
            JobStore::insert(&store, &job).await.unwrap();
            job.start(Utc::now()).unwrap();
            JobStore::update_status(&store, &job).await.unwrap();
            ContentStore::update_status(&store, &item.id, ItemStatus::Publishing, Utc::now())
                .await
                .unwrap();
            store
                .record_delivery_result(&item.id, &"x".into(), &"m-1".into(), Utc::now())
                .await
                .unwrap();
        }

        let store = FileStore::open(&path).await.unwrap();
        let executing = store.find_executing().await.unwrap();
        assert_eq!(executing.len(), 1);
        assert_eq!(executing[0].id, job.id);

        let stored = ContentStore::get(&store, &item.id).await.unwrap().unwrap();
        assert_eq!(
            stored.delivery_results.keys().cloned().collect::<BTreeSet<_>>(),
            BTreeSet::from([DestinationId::from("x")])
        );
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("courier.json"))
            .await
            .unwrap();
        let item = sample_item();
        ContentStore::insert(&store, &item).await.unwrap();
        assert!(matches!(
            ContentStore::insert(&store, &item).await,
            Err(StoreError::Conflict(_))
        ));
        let missing = ItemId::from("missing");
        assert!(matches!(
            ContentStore::update_status(&store, &missing, ItemStatus::Failed, Utc::now()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("courier.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(matches!(
            FileStore::open(&path).await,
            Err(StoreError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_job() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("courier.json"))
            .await
            .unwrap();
        let item = sample_item();
        let job = sample_job(&item);
        JobStore::insert(&store, &job).await.unwrap();
        assert!(store.delete(&job.id).await.unwrap());
        assert!(JobStore::get(&store, &job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handles_share_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("courier.json");
        let daemon = FileStore::open(&path).await.unwrap();
        let cli = FileStore::open(&path).await.unwrap();

        let first = sample_item();
        let job = sample_job(&first);
        ContentStore::insert(&daemon, &first).await.unwrap();
        JobStore::insert(&daemon, &job).await.unwrap();

        // The second handle sees the first handle's writes and keeps them.
        let second = sample_item();
        ContentStore::insert(&cli, &second).await.unwrap();
        assert!(JobStore::get(&cli, &job.id).await.unwrap().is_some());

        // A later write through the first handle keeps the second's item.
        ContentStore::update_status(&daemon, &first.id, ItemStatus::Scheduled, Utc::now())
            .await
            .unwrap();

        let reopened = FileStore::open(&path).await.unwrap();
        assert!(ContentStore::get(&reopened, &first.id).await.unwrap().is_some());
        assert!(ContentStore::get(&reopened, &second.id).await.unwrap().is_some());
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_job_write_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("courier.json");
        let daemon = FileStore::open(&path).await.unwrap();
        let cli = FileStore::open(&path).await.unwrap();

        let item = sample_item();
        let job = sample_job(&item);
        JobStore::insert(&daemon, &job).await.unwrap();

        let mut cancelled = job.clone();
        cancelled.cancel(Utc::now()).unwrap();
        JobStore::update_status(&cli, &cancelled).await.unwrap();

        // The daemon's copy is still pending; starting it must not undo the cancel.
        let mut started = job.clone();
        started.start(Utc::now()).unwrap();
        assert!(matches!(
            JobStore::update_status(&daemon, &started).await,
            Err(StoreError::Rejected(_))
        ));
        let stored = JobStore::get(&daemon, &job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_from_two_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("courier.json");
        let a = Arc::new(FileStore::open(&path).await.unwrap());
        let b = Arc::new(FileStore::open(&path).await.unwrap());

        let mut tasks = Vec::new();
        for i in 0..10 {
            let store = if i % 2 == 0 { Arc::clone(&a) } else { Arc::clone(&b) };
            tasks.push(tokio::spawn(async move {
                let item = sample_item();
                ContentStore::insert(store.as_ref(), &item).await.unwrap();
                JobStore::insert(store.as_ref(), &sample_job(&item)).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(a.list().await.unwrap().len(), 10);
    }
}
