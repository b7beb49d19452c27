//! Durable delivery scheduler.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::dispatcher::{DispatchResult, Dispatcher};
use crate::retry::RetryPolicy;
use crate::store::{ContentStore, JobStore};
use crate::throttle::Throttle;
use crate::transport::Transport;
use crate::types::{
    ContentItem, DeliveryFailure, DestinationId, ItemId, ItemStatus, JobId, JobKind, JobStatus,
    Payload, Recovery, Schedule,
};
use crate::{ModelError, SchedulerConfig, SchedulerError, StoreError};

/// Longest the loop sleeps before re-reading the clock.
const MAX_SLEEP_SECS: u64 = 60;

/// How long a due job waits when its item is mid-delivery, and how far past a
/// pending delivery a deletion is pushed back.
const BUSY_DEFER_SECS: i64 = 1;

/// What to look up with [`Scheduler::get_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusQuery {
    Item(ItemId),
    Job(JobId),
}

/// An item together with every job that targeted it.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub item: Option<ContentItem>,
    pub jobs: Vec<Schedule>,
}

/// In-memory timer registry. Owned by one scheduler instance.
#[derive(Debug, Default)]
struct TimerState {
    /// Min-ordered by due time. Entries whose id is not in `armed` are stale.
    queue: BinaryHeap<Reverse<(DateTime<Utc>, JobId)>>,
    armed: HashSet<JobId>,
    /// Items with a dispatch round in progress.
    in_flight: HashSet<ItemId>,
    /// Jobs this instance is currently executing.
    running: HashSet<JobId>,
    /// Startup reconciliation has run.
    reconciled: bool,
}

impl TimerState {
    /// Drop stale heads so `peek` reflects a live job.
    fn prune(&mut self) {
        while let Some(Reverse((_, head))) = self.queue.peek() {
            if self.armed.contains(head) {
                break;
            }
            self.queue.pop();
        }
    }

    fn next_due(&mut self) -> Option<DateTime<Utc>> {
        self.prune();
        self.queue.peek().map(|Reverse((at, _))| *at)
    }

    /// Pop every live job due at or before `now`.
    fn take_due(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut due = Vec::new();
        while let Some(at) = self.next_due() {
            if at > now {
                break;
            }
            if let Some(Reverse((_, id))) = self.queue.pop() {
                self.armed.remove(&id);
                due.push(id);
            }
        }
        due
    }
}

/// A due job this instance has taken: its id is running and its item in flight.
enum Claim {
    Deliver(Schedule, ContentItem),
    /// The item may already be gone.
    Delete(Schedule, Option<ContentItem>),
    /// The job can never run.
    Abandon(Schedule, String),
}

impl Claim {
    fn job(&self) -> &Schedule {
        match self {
            Claim::Deliver(job, _) | Claim::Delete(job, _) | Claim::Abandon(job, _) => job,
        }
    }
}

/// Schedules content items for delivery and drives them to completion.
pub struct Scheduler {
    config: SchedulerConfig,
    policy: RetryPolicy,
    jobs: Arc<dyn JobStore>,
    items: Arc<dyn ContentStore>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    state: Mutex<TimerState>,
    wake: Notify,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(
        config: SchedulerConfig,
        jobs: Arc<dyn JobStore>,
        items: Arc<dyn ContentStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;

        let throttle = Arc::new(Throttle::new(config.min_interval()));
        let dispatcher = Dispatcher::new(
            transport,
            throttle,
            config.dispatch_parallelism,
            config.attempt_timeout(),
        );

        Ok(Self {
            policy: RetryPolicy::from_config(&config),
            config,
            jobs,
            items,
            dispatcher,
            clock: Arc::new(SystemClock),
            state: Mutex::new(TimerState::default()),
            wake: Notify::new(),
        })
    }

    /// Replace the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // =========================================================================
    // Item API
    // =========================================================================

    /// Create a draft content item.
    #[tracing::instrument(skip_all, fields(kind = payload.kind()))]
    pub async fn create_item(
        &self,
        payload: Payload,
        destinations: impl IntoIterator<Item = DestinationId>,
    ) -> Result<ItemId, SchedulerError> {
        let item = ContentItem::draft(payload, destinations, self.clock.now())?;
        self.items.insert(&item).await?;
        info!(
            item_id = %item.id,
            destinations = item.destinations.len(),
            "created item"
        );
        Ok(item.id)
    }

    /// Delete an item, cancelling its pending jobs. Refused while publishing.
    ///
    /// The item is held in flight while its jobs are cancelled, so none of
    /// them can start in between.
    #[tracing::instrument(skip_all, fields(item_id = %item_id))]
    pub async fn delete_item(&self, item_id: &ItemId) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock().await;
            if state.in_flight.contains(item_id) {
                return Err(ModelError::InvalidTransition {
                    entity: "item",
                    from: ItemStatus::Publishing.as_str(),
                    to: ItemStatus::Deleted.as_str(),
                }
                .into());
            }

            let mut item = self
                .items
                .get(item_id)
                .await?
                .ok_or_else(|| SchedulerError::ItemNotFound(item_id.clone()))?;
            item.transition(ItemStatus::Deleted, now)?;
            state.in_flight.insert(item_id.clone());
        }

        let retired = self.retire_item(item_id, now).await;

        let mut state = self.state.lock().await;
        state.in_flight.remove(item_id);
        for job_id in retired? {
            state.armed.remove(&job_id);
        }
        info!("deleted item");
        Ok(())
    }

    // =========================================================================
    // Scheduling API
    // =========================================================================

    /// Schedule delivery of an item to `destinations` at `due_time`.
    #[tracing::instrument(skip_all, fields(item_id = %item_id, due_time = %due_time))]
    pub async fn schedule(
        &self,
        item_id: &ItemId,
        destinations: impl IntoIterator<Item = DestinationId>,
        due_time: DateTime<Utc>,
    ) -> Result<JobId, SchedulerError> {
        let destinations: BTreeSet<DestinationId> = destinations.into_iter().collect();
        let now = self.clock.now();

        self.check_due_time(due_time, now)?;
        if destinations.is_empty() {
            return Err(ModelError::EmptyDestinations.into());
        }

        let mut state = self.state.lock().await;

        let mut item = self
            .items
            .get(item_id)
            .await?
            .ok_or_else(|| SchedulerError::ItemNotFound(item_id.clone()))?;

        if let Some(unknown) = destinations.iter().find(|d| !item.destinations.contains(*d)) {
            return Err(ModelError::UnknownDestination {
                item_id: item_id.clone(),
                destination: unknown.clone(),
            }
            .into());
        }

        self.ensure_no_active(item_id, JobKind::Deliver).await?;
        item.transition(ItemStatus::Scheduled, now)?;

        // Job first: a crash before the item update leaves a draft item with a
        // pending job, which the fire path promotes.
        let job = Schedule::new(
            item_id.clone(),
            destinations,
            due_time,
            self.policy.max_attempts,
            now,
        );
        self.jobs.insert(&job).await?;
        self.items
            .update_status(item_id, ItemStatus::Scheduled, now)
            .await?;
        self.arm(&mut state, due_time, job.id.clone());

        info!(
            job_id = %job.id,
            destinations = job.destinations.len(),
            "scheduled job"
        );
        Ok(job.id)
    }

    /// Schedule deletion of an item at `due_time`.
    ///
    /// The item keeps its status until then. A deletion that comes due while
    /// the item is publishing waits for the delivery to settle.
    #[tracing::instrument(skip_all, fields(item_id = %item_id, due_time = %due_time))]
    pub async fn schedule_deletion(
        &self,
        item_id: &ItemId,
        due_time: DateTime<Utc>,
    ) -> Result<JobId, SchedulerError> {
        let now = self.clock.now();
        self.check_due_time(due_time, now)?;

        let mut state = self.state.lock().await;

        let item = self
            .items
            .get(item_id)
            .await?
            .ok_or_else(|| SchedulerError::ItemNotFound(item_id.clone()))?;
        if item.status == ItemStatus::Deleted {
            return Err(ModelError::InvalidTransition {
                entity: "item",
                from: ItemStatus::Deleted.as_str(),
                to: ItemStatus::Deleted.as_str(),
            }
            .into());
        }

        self.ensure_no_active(item_id, JobKind::Delete).await?;

        let job = Schedule::deletion(item_id.clone(), due_time, self.policy.max_attempts, now);
        self.jobs.insert(&job).await?;
        self.arm(&mut state, due_time, job.id.clone());

        info!(job_id = %job.id, "scheduled deletion");
        Ok(job.id)
    }

    /// Cancel a job that has not started executing.
    ///
    /// Returns `false` when the job is unknown or past the point of
    /// cancellation; an executing job always runs to completion.
    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    pub async fn cancel(&self, job_id: &JobId) -> Result<bool, SchedulerError> {
        let mut state = self.state.lock().await;

        if state.running.contains(job_id) {
            info!("job is already starting");
            return Ok(false);
        }
        let Some(mut job) = self.jobs.get(job_id).await? else {
            info!("cancel requested for unknown job");
            return Ok(false);
        };
        if !job.can_cancel() {
            info!(status = %job.status, "job cannot be cancelled");
            return Ok(false);
        }

        let was_pending = job.status == JobStatus::Pending;
        let now = self.clock.now();
        job.cancel(now)?;
        self.jobs.update_status(&job).await?;
        state.armed.remove(job_id);

        // Cancelling a deletion leaves the item as it is.
        if was_pending && job.kind == JobKind::Deliver {
            if let Some(item) = self.items.get(&job.item_id).await? {
                // A pending job on a publishing item is a retry; dropping it ends the item.
                let next = match item.status {
                    ItemStatus::Scheduled => Some(ItemStatus::Draft),
                    ItemStatus::Publishing => Some(ItemStatus::Failed),
                    _ => None,
                };
                if let Some(next) = next {
                    self.items.update_status(&item.id, next, now).await?;
                }
            }
        }

        info!(item_id = %job.item_id, kind = %job.kind, "cancelled job");
        Ok(true)
    }

    /// Arm a timer for every pending job, reconciling interrupted jobs first.
    ///
    /// Returns how many jobs were newly armed; jobs already armed on this
    /// instance are not counted again.
    #[tracing::instrument(skip(self))]
    pub async fn restore_all(&self) -> Result<usize, SchedulerError> {
        let mut state = self.state.lock().await;

        if !state.reconciled {
            self.reconcile(&mut state).await?;
            state.reconciled = true;
        }

        let pending = self.jobs.find_pending().await?;
        let mut armed = 0;
        for job in pending {
            if self.arm(&mut state, job.due_time, job.id.clone()) {
                debug!(job_id = %job.id, due_time = %job.due_time, "armed restored job");
                armed += 1;
            }
        }

        if armed > 0 {
            info!(armed, "restored pending jobs");
        } else {
            debug!("no new pending jobs");
        }
        Ok(armed)
    }

    /// Look up an item or job, along with every job for that item.
    pub async fn get_status(&self, query: &StatusQuery) -> Result<StatusReport, SchedulerError> {
        let item_id = match query {
            StatusQuery::Item(id) => id.clone(),
            StatusQuery::Job(id) => {
                self.jobs
                    .get(id)
                    .await?
                    .ok_or_else(|| SchedulerError::JobNotFound(id.clone()))?
                    .item_id
            }
        };

        let item = self.items.get(&item_id).await?;
        if item.is_none() && matches!(query, StatusQuery::Item(_)) {
            return Err(SchedulerError::ItemNotFound(item_id));
        }
        let jobs = self.jobs.find_by_item(&item_id).await?;
        Ok(StatusReport { item, jobs })
    }

    /// All jobs, oldest first.
    pub async fn list_jobs(&self) -> Result<Vec<Schedule>, SchedulerError> {
        Ok(self.jobs.list().await?)
    }

    /// Delete finished jobs whose terminal timestamp is older than `older_than`.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self, older_than: chrono::Duration) -> Result<usize, SchedulerError> {
        let _state = self.state.lock().await;
        let cutoff = self.clock.now() - older_than;

        let mut removed = 0;
        for job in self.jobs.list().await? {
            let finished = job.finished_at.unwrap_or(job.updated_at);
            if job.status.is_terminal() && finished < cutoff && self.jobs.delete(&job.id).await? {
                removed += 1;
            }
        }

        info!(removed, cutoff = %cutoff, "cleaned up finished jobs");
        Ok(removed)
    }

    /// [`cleanup`](Self::cleanup) with the configured retention window.
    pub async fn cleanup_expired(&self) -> Result<usize, SchedulerError> {
        self.cleanup(self.config.retention()).await
    }

    // =========================================================================
    // Loop
    // =========================================================================

    /// Run the scheduler loop until shutdown is signalled.
    ///
    /// Due jobs run as independent tasks. On shutdown no new job is fired and
    /// the loop waits for in-flight jobs to persist their outcome.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("scheduler starting");
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            if *shutdown_rx.borrow() {
                info!("scheduler shutting down");
                break;
            }

            let now = self.clock.now();
            let (due, next) = {
                let mut state = self.state.lock().await;
                let due = state.take_due(now);
                (due, state.next_due())
            };

            for job_id in due {
                let this = Arc::clone(&self);
                tasks.spawn(async move { this.fire(job_id).await });
            }

            let sleep_for = next.map(|at| {
                (at - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(Duration::from_secs(MAX_SLEEP_SECS))
            });

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        info!("shutdown channel closed");
                        break;
                    }
                }
                _ = self.wake.notified() => {
                    debug!("timer re-armed");
                }
                _ = sleep_or_idle(sleep_for) => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "job task panicked");
                    }
                }
            }
        }

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "waiting for in-flight jobs");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "job task panicked");
            }
        }

        info!("scheduler shut down gracefully");
    }

    async fn fire(&self, job_id: JobId) {
        if let Err(e) = self.execute(&job_id).await {
            error!(job_id = %job_id, error = %e, "job execution failed");
        }
    }

    /// Execute one due job. Only the claim holds the timer lock; store writes
    /// and dispatch run without it.
    #[tracing::instrument(skip_all, fields(job_id = %job_id))]
    async fn execute(&self, job_id: &JobId) -> Result<(), SchedulerError> {
        let Some(claim) = self.claim(job_id).await? else {
            return Ok(());
        };
        let item_id = claim.job().item_id.clone();

        let outcome = match claim {
            Claim::Deliver(job, item) => self.deliver(job, item).await,
            Claim::Delete(job, item) => self.delete_due(job, item).await,
            Claim::Abandon(job, reason) => self.abandon(job, &reason).await,
        };

        let mut state = self.state.lock().await;
        state.in_flight.remove(&item_id);
        state.running.remove(job_id);
        outcome
    }

    /// Decide what a due job does, deferring it if its item is busy.
    async fn claim(&self, job_id: &JobId) -> Result<Option<Claim>, SchedulerError> {
        let mut state = self.state.lock().await;

        let Some(job) = self.jobs.get(job_id).await? else {
            debug!("armed job no longer exists");
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            debug!(status = %job.status, "skipping job that is no longer pending");
            return Ok(None);
        }

        let now = self.clock.now();
        if state.in_flight.contains(&job.item_id) {
            let retry_at = now + chrono::Duration::seconds(BUSY_DEFER_SECS);
            debug!(item_id = %job.item_id, "item busy, deferring job");
            self.arm(&mut state, retry_at, job.id.clone());
            return Ok(None);
        }

        let item = self.items.get(&job.item_id).await?;
        let claim = match (job.kind, item) {
            (JobKind::Deliver, None) => Claim::Abandon(job, "item no longer exists".to_string()),
            (JobKind::Deliver, Some(item)) => {
                let mut next = item.clone();
                match next.begin_publishing(now) {
                    Ok(()) => Claim::Deliver(job, item),
                    Err(e) => Claim::Abandon(job, e.to_string()),
                }
            }
            (JobKind::Delete, Some(item)) if item.status == ItemStatus::Publishing => {
                match self.delivery_settles_at(&item.id, now).await? {
                    Some(retry_at) => {
                        debug!(item_id = %item.id, retry_at = %retry_at, "item publishing, deferring deletion");
                        self.arm(&mut state, retry_at, job.id.clone());
                        return Ok(None);
                    }
                    None => Claim::Abandon(job, "item is publishing with no active delivery".to_string()),
                }
            }
            (JobKind::Delete, item) => Claim::Delete(job, item),
        };

        state.in_flight.insert(claim.job().item_id.clone());
        state.running.insert(claim.job().id.clone());
        Ok(Some(claim))
    }

    /// When a deletion blocked by a publishing item should look again: just
    /// after the item's earliest active delivery job is due.
    async fn delivery_settles_at(
        &self,
        item_id: &ItemId,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let due = self
            .jobs
            .find_by_item(item_id)
            .await?
            .into_iter()
            .filter(|j| j.kind == JobKind::Deliver && j.status.is_active())
            .map(|j| j.due_time.max(now))
            .min();
        Ok(due.map(|at| at + chrono::Duration::seconds(BUSY_DEFER_SECS)))
    }

    /// Persist the claimed job as executing. `false` if another writer has
    /// moved it on since it was read.
    async fn start_claimed(
        &self,
        job: &mut Schedule,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        job.start(now)?;
        match self.save_job(job).await {
            Ok(()) => Ok(true),
            Err(StoreError::Rejected(reason)) => {
                info!(%reason, "job changed in the store, skipping");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn deliver(&self, mut job: Schedule, item: ContentItem) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        if !self.start_claimed(&mut job, now).await? {
            return Ok(());
        }
        self.save_item_status(&item.id, ItemStatus::Publishing, now)
            .await?;

        info!(
            item_id = %job.item_id,
            attempt = job.attempt_count,
            destinations = job.destinations.len(),
            "firing job"
        );
        let result = self.dispatcher.dispatch(&item.payload, &job.destinations).await;
        self.finish(job, result).await
    }

    async fn delete_due(
        &self,
        mut job: Schedule,
        item: Option<ContentItem>,
    ) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        if !self.start_claimed(&mut job, now).await? {
            return Ok(());
        }

        let cancelled = match item {
            Some(item) if item.status != ItemStatus::Deleted => {
                let cancelled = self.retire_item(&item.id, now).await?;
                info!(item_id = %item.id, cancelled = cancelled.len(), "deleted item on schedule");
                cancelled
            }
            _ => {
                info!(item_id = %job.item_id, "item already gone, nothing to delete");
                Vec::new()
            }
        };

        job.complete(now)?;
        self.save_job(&job).await?;

        let mut state = self.state.lock().await;
        for job_id in &cancelled {
            state.armed.remove(job_id);
        }
        Ok(())
    }

    /// Cancel a due job that can never run, so it does not stay pending.
    async fn abandon(&self, mut job: Schedule, reason: &str) -> Result<(), SchedulerError> {
        job.cancel(self.clock.now())?;
        self.save_job(&job).await?;
        warn!(item_id = %job.item_id, kind = %job.kind, %reason, "job cannot run, cancelled");
        Ok(())
    }

    /// Persist a dispatch round and apply the retry decision.
    async fn finish(&self, mut job: Schedule, result: DispatchResult) -> Result<(), SchedulerError> {
        let now = self.clock.now();

        for (destination, delivery_ref) in &result.succeeded {
            let (items, item_id) = (&self.items, &job.item_id);
            self.persist("delivery result", move || {
                items.record_delivery_result(item_id, destination, delivery_ref, now)
            })
            .await?;
        }

        let failures: BTreeMap<DestinationId, DeliveryFailure> = result
            .failed
            .iter()
            .map(|(dest, err)| (dest.clone(), DeliveryFailure::from_error(err, now)))
            .collect();
        for (destination, failure) in &failures {
            let (items, item_id) = (&self.items, &job.item_id);
            self.persist("delivery failure", move || {
                items.record_delivery_failure(item_id, destination, failure)
            })
            .await?;
        }

        if result.is_complete() {
            job.complete(now)?;
            self.save_job(&job).await?;

            let published = self
                .items
                .get(&job.item_id)
                .await?
                .is_some_and(|item| item.fully_delivered());
            let status = if published {
                ItemStatus::Published
            } else {
                ItemStatus::Failed
            };
            self.save_item_status(&job.item_id, status, now).await?;
            info!(
                item_id = %job.item_id,
                attempt = job.attempt_count,
                item_status = %status,
                "job executed"
            );
            return Ok(());
        }

        let transient = result.transient_failures();
        let decision = self.policy.next_attempt(job.attempt_count);

        if !transient.is_empty() && decision.should_retry {
            let due = chrono::Duration::from_std(decision.delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(now + self.config.horizon());
            let retry = job.retry(transient, due, now);

            // Retry row first: a crash in between leaves the old job executing
            // with its successor already durable, which reconciliation detects.
            let jobs = &self.jobs;
            let retry_ref = &retry;
            self.persist("retry job", move || jobs.insert(retry_ref))
                .await?;
            job.retried_by = Some(retry.id.clone());
            job.fail(failures, now)?;
            self.save_job(&job).await?;
            {
                let mut state = self.state.lock().await;
                self.arm(&mut state, due, retry.id.clone());
            }

            warn!(
                item_id = %job.item_id,
                retry_job_id = %retry.id,
                attempt = retry.attempt_count,
                delay_secs = decision.delay.as_secs(),
                destinations = ?retry.destinations,
                "delivery incomplete, scheduled retry"
            );
            return Ok(());
        }

        job.fail(failures, now)?;
        self.save_job(&job).await?;
        self.save_item_status(&job.item_id, ItemStatus::Failed, now)
            .await?;
        error!(
            item_id = %job.item_id,
            attempt = job.attempt_count,
            failed = ?result.failed.keys().collect::<Vec<_>>(),
            "delivery failed, giving up"
        );
        Ok(())
    }

    /// Settle jobs left `executing` by a previous process.
    ///
    /// Runs under the timer lock before any job is armed; a failed write fails
    /// `restore_all`.
    async fn reconcile(&self, state: &mut TimerState) -> Result<(), SchedulerError> {
        let executing = self.jobs.find_executing().await?;
        let now = self.clock.now();

        for mut job in executing {
            if state.running.contains(&job.id) {
                continue;
            }

            let item = self.items.get(&job.item_id).await?;

            if job.kind == JobKind::Delete {
                match item {
                    Some(item) if item.status != ItemStatus::Deleted => {
                        let recovery = job.recover_interrupted(BTreeSet::new(), now)?;
                        self.jobs.update_status(&job).await?;
                        info!(job_id = %job.id, ?recovery, "recovered interrupted deletion");
                    }
                    _ => {
                        job.complete(now)?;
                        self.jobs.update_status(&job).await?;
                        info!(job_id = %job.id, "interrupted deletion had already finished");
                    }
                }
                continue;
            }

            let siblings = self.jobs.find_by_item(&job.item_id).await?;
            if let Some(successor) = siblings
                .iter()
                .find(|j| j.retry_of.as_ref() == Some(&job.id))
            {
                job.retried_by = Some(successor.id.clone());
                job.fail(BTreeMap::new(), now)?;
                self.jobs.update_status(&job).await?;
                info!(job_id = %job.id, retry_job_id = %successor.id, "interrupted job already superseded");
                continue;
            }

            let Some(item) = item else {
                job.fail(BTreeMap::new(), now)?;
                self.jobs.update_status(&job).await?;
                warn!(job_id = %job.id, item_id = %job.item_id, "interrupted job lost its item");
                continue;
            };

            let remaining: BTreeSet<DestinationId> = item
                .undelivered()
                .intersection(&job.destinations)
                .cloned()
                .collect();

            if remaining.is_empty() {
                job.complete(now)?;
                self.jobs.update_status(&job).await?;
                if item.status == ItemStatus::Publishing {
                    let status = if item.fully_delivered() {
                        ItemStatus::Published
                    } else {
                        ItemStatus::Failed
                    };
                    self.items.update_status(&item.id, status, now).await?;
                }
                info!(job_id = %job.id, "interrupted job had already delivered everything");
                continue;
            }

            match job.recover_interrupted(remaining, now)? {
                Recovery::Requeued => {
                    self.jobs.update_status(&job).await?;
                    info!(
                        job_id = %job.id,
                        attempt = job.attempt_count,
                        destinations = job.destinations.len(),
                        "requeued interrupted job"
                    );
                }
                Recovery::Exhausted => {
                    self.jobs.update_status(&job).await?;
                    if item.status == ItemStatus::Publishing {
                        self.items
                            .update_status(&item.id, ItemStatus::Failed, now)
                            .await?;
                    }
                    error!(
                        job_id = %job.id,
                        attempt = job.attempt_count,
                        "interrupted job was on its last attempt"
                    );
                }
            }
        }

        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn check_due_time(&self, due_time: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if due_time < now - self.config.past_due_grace() {
            return Err(SchedulerError::PastDue { due_time, now });
        }
        if due_time > now + self.config.horizon() {
            return Err(SchedulerError::TooFarAhead {
                due_time,
                horizon_days: self.config.max_schedule_horizon_days,
            });
        }
        Ok(())
    }

    /// Refuse a second active job of `kind` for the item.
    async fn ensure_no_active(&self, item_id: &ItemId, kind: JobKind) -> Result<(), SchedulerError> {
        let existing = self.jobs.find_by_item(item_id).await?;
        match existing.iter().find(|j| j.kind == kind && j.status.is_active()) {
            Some(active) => Err(SchedulerError::DuplicateJob {
                item_id: item_id.clone(),
                job_id: active.id.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Cancel the item's pending jobs and mark it deleted. Returns the
    /// cancelled job ids so the caller can disarm them.
    async fn retire_item(
        &self,
        item_id: &ItemId,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, SchedulerError> {
        let mut cancelled = Vec::new();
        for mut job in self.jobs.find_by_item(item_id).await? {
            if job.status != JobStatus::Pending {
                continue;
            }
            job.cancel(now)?;
            self.save_job(&job).await?;
            info!(job_id = %job.id, kind = %job.kind, "cancelled job of deleted item");
            cancelled.push(job.id);
        }

        self.save_item_status(item_id, ItemStatus::Deleted, now)
            .await?;
        Ok(cancelled)
    }

    /// Arm a timer for `job_id`. Returns `false` if it is already armed or running.
    fn arm(&self, state: &mut TimerState, due: DateTime<Utc>, job_id: JobId) -> bool {
        if state.armed.contains(&job_id) || state.running.contains(&job_id) {
            return false;
        }

        let head = state.next_due();
        state.armed.insert(job_id.clone());
        state.queue.push(Reverse((due, job_id)));

        if head.is_none_or(|head| due < head) {
            self.wake.notify_one();
        }
        true
    }

    async fn save_job(&self, job: &Schedule) -> Result<(), StoreError> {
        let jobs = &self.jobs;
        self.persist("job status", move || jobs.update_status(job))
            .await
    }

    async fn save_item_status(
        &self,
        item_id: &ItemId,
        status: ItemStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let items = &self.items;
        self.persist("item status", move || items.update_status(item_id, status, at))
            .await
    }

    /// Run a store write, retrying transient failures on the retry curve.
    ///
    /// Gives up after `max_attempts` tries in total. Only used off the timer
    /// lock; calls that hold it write once and return the error to the caller.
    async fn persist<F, Fut>(&self, what: &'static str, mut write: F) -> Result<(), StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        let mut backoff = self.policy.backoff();
        let mut tries: u32 = 0;
        loop {
            match write().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    tries += 1;
                    let delay = backoff
                        .next_backoff()
                        .filter(|_| tries < self.policy.max_attempts);
                    let Some(delay) = delay else {
                        error!(what, error = %e, tries, "store write failed, giving up");
                        return Err(e);
                    };
                    warn!(
                        what,
                        error = %e,
                        tries,
                        delay_secs = delay.as_secs(),
                        "store write failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn sleep_or_idle(duration: Option<Duration>) {
    match duration {
        Some(duration) => sleep(duration).await,
        None => std::future::pending().await,
    }
}
