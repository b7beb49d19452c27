//! Store management commands.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use miette::{Result, miette};
use tracing::info;

use courier_scheduler::{
    DestinationId, FileStore, ItemId, JobId, MediaKind, MediaRef, Payload, Scheduler,
    SchedulerConfig, StatusQuery,
};
use courier_webhook::{Url, WebhookTransport};

/// Open the store at `path` and build a scheduler over it.
pub async fn open(
    path: &Path,
    config: SchedulerConfig,
    routes: Vec<(DestinationId, Url)>,
) -> Result<Scheduler> {
    let store = Arc::new(
        FileStore::open(path)
            .await
            .map_err(|e| miette!("failed to open store {}: {}", path.display(), e))?,
    );
    let transport = Arc::new(
        WebhookTransport::new(routes, config.attempt_timeout())
            .map_err(|e| miette!("{}", e))?,
    );

    Scheduler::new(config, store.clone(), store, transport).map_err(|e| miette!("{}", e))
}

/// Arguments of `courier schedule`.
#[derive(Debug, Default)]
pub struct ScheduleRequest {
    pub text: Option<String>,
    pub media: Vec<String>,
    pub caption: Option<String>,
    pub to: Vec<String>,
    pub at: Option<String>,
    pub in_seconds: Option<u64>,
    pub delete_after_hours: Option<u32>,
}

/// Ids created by `courier schedule`.
#[derive(Debug, serde::Serialize)]
pub struct Scheduled {
    pub item_id: ItemId,
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_job_id: Option<JobId>,
}

pub async fn schedule(
    path: &Path,
    config: SchedulerConfig,
    request: ScheduleRequest,
) -> Result<()> {
    let scheduler = open(path, config, Vec::new()).await?;
    let scheduled = schedule_with(&scheduler, request, Utc::now()).await?;
    print_json(&scheduled)
}

async fn schedule_with(
    scheduler: &Scheduler,
    request: ScheduleRequest,
    now: DateTime<Utc>,
) -> Result<Scheduled> {
    let payload = build_payload(request.text, &request.media, request.caption)?;
    let due_time = due_time(request.at.as_deref(), request.in_seconds, now)?;
    let destinations: Vec<DestinationId> =
        request.to.into_iter().map(DestinationId::from).collect();

    let item_id = scheduler
        .create_item(payload, destinations.clone())
        .await
        .map_err(|e| miette!("{}", e))?;
    let job_id = scheduler
        .schedule(&item_id, destinations, due_time)
        .await
        .map_err(|e| miette!("{}", e))?;

    info!(item_id = %item_id, job_id = %job_id, due_time = %due_time, "scheduled delivery");

    let deletion_job_id = match request.delete_after_hours {
        Some(hours) => {
            let delete_at = due_time
                .checked_add_signed(chrono::Duration::hours(i64::from(hours)))
                .ok_or_else(|| miette!("--delete-after-hours is too large"))?;
            let deletion = scheduler
                .schedule_deletion(&item_id, delete_at)
                .await
                .map_err(|e| miette!("{}", e))?;
            info!(item_id = %item_id, job_id = %deletion, delete_at = %delete_at, "scheduled deletion");
            Some(deletion)
        }
        None => None,
    };

    Ok(Scheduled {
        item_id,
        job_id,
        deletion_job_id,
    })
}

pub async fn cancel(path: &Path, config: SchedulerConfig, job_id: &str) -> Result<()> {
    let scheduler = open(path, config, Vec::new()).await?;
    let cancelled = scheduler
        .cancel(&JobId::from(job_id))
        .await
        .map_err(|e| miette!("{}", e))?;

    print_json(&serde_json::json!({
        "job_id": job_id,
        "cancelled": cancelled,
    }))
}

/// Delete an item now, or schedule its deletion when a time is given.
pub async fn delete(
    path: &Path,
    config: SchedulerConfig,
    item_id: &str,
    at: Option<String>,
    in_seconds: Option<u64>,
) -> Result<()> {
    let scheduler = open(path, config, Vec::new()).await?;
    let item_id = ItemId::from(item_id);

    if at.is_none() && in_seconds.is_none() {
        scheduler
            .delete_item(&item_id)
            .await
            .map_err(|e| miette!("{}", e))?;
        return print_json(&serde_json::json!({
            "item_id": item_id,
            "deleted": true,
        }));
    }

    let delete_at = due_time(at.as_deref(), in_seconds, Utc::now())?;
    let job_id = scheduler
        .schedule_deletion(&item_id, delete_at)
        .await
        .map_err(|e| miette!("{}", e))?;
    print_json(&serde_json::json!({
        "item_id": item_id,
        "job_id": job_id,
        "delete_at": delete_at,
    }))
}

pub async fn status(
    path: &Path,
    config: SchedulerConfig,
    item: Option<String>,
    job: Option<String>,
) -> Result<()> {
    let query = match (item, job) {
        (Some(item), _) => StatusQuery::Item(ItemId::from(item)),
        (None, Some(job)) => StatusQuery::Job(JobId::from(job)),
        (None, None) => return Err(miette!("either --item or --job is required")),
    };

    let scheduler = open(path, config, Vec::new()).await?;
    let report = scheduler
        .get_status(&query)
        .await
        .map_err(|e| miette!("{}", e))?;
    print_json(&report)
}

pub async fn jobs(path: &Path, config: SchedulerConfig) -> Result<()> {
    let scheduler = open(path, config, Vec::new()).await?;
    let jobs = scheduler.list_jobs().await.map_err(|e| miette!("{}", e))?;
    print_json(&jobs)
}

pub async fn cleanup(
    path: &Path,
    config: SchedulerConfig,
    older_than_days: Option<u32>,
) -> Result<()> {
    let scheduler = open(path, config, Vec::new()).await?;
    let removed = match older_than_days {
        Some(days) => scheduler.cleanup(chrono::Duration::days(i64::from(days))).await,
        None => scheduler.cleanup_expired().await,
    }
    .map_err(|e| miette!("{}", e))?;

    print_json(&serde_json::json!({ "removed": removed }))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).map_err(|e| miette!("{}", e))?;
    println!("{}", out);
    Ok(())
}

/// Build a payload from `--text` or one or more `--media KIND:REF`.
fn build_payload(
    text: Option<String>,
    media: &[String],
    caption: Option<String>,
) -> Result<Payload> {
    let payload = match (text, media) {
        (Some(text), []) => Payload::text(text),
        (None, [single]) => Payload::media(parse_media(single)?, caption),
        (None, many) if many.len() > 1 => {
            let refs = many
                .iter()
                .map(|m| parse_media(m))
                .collect::<Result<Vec<_>>>()?;
            Payload::media_group(refs, caption)
        }
        (None, _) => return Err(miette!("either --text or --media is required")),
        (Some(_), _) => return Err(miette!("--text cannot be combined with --media")),
    };
    payload.map_err(|e| miette!("{}", e))
}

fn parse_media(spec: &str) -> Result<MediaRef> {
    let (kind, reference) = spec
        .split_once(':')
        .ok_or_else(|| miette!("media must be KIND:REF, got '{}'", spec))?;

    let kind = match kind {
        "photo" => MediaKind::Photo,
        "video" => MediaKind::Video,
        "audio" => MediaKind::Audio,
        "document" => MediaKind::Document,
        "animation" => MediaKind::Animation,
        "voice" => MediaKind::Voice,
        "video_note" => MediaKind::VideoNote,
        other => return Err(miette!("unknown media kind '{}'", other)),
    };
    Ok(MediaRef::new(kind, reference))
}

fn due_time(
    at: Option<&str>,
    in_seconds: Option<u64>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    match (at, in_seconds) {
        (Some(at), _) => DateTime::parse_from_rfc3339(at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| miette!("invalid --at '{}': {}", at, e)),
        (None, Some(secs)) => {
            let secs = i64::try_from(secs).map_err(|_| miette!("--in is too large"))?;
            chrono::Duration::try_seconds(secs)
                .and_then(|d| now.checked_add_signed(d))
                .ok_or_else(|| miette!("--in is too large"))
        }
        (None, None) => Ok(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_scheduler::{ItemStatus, JobKind, JobStatus};
    use tempfile::TempDir;

    #[test]
    fn test_parse_media() {
        let media = parse_media("photo:AgAD123").unwrap();
        assert_eq!(media, MediaRef::new(MediaKind::Photo, "AgAD123"));
        assert!(parse_media("photo").is_err());
        assert!(parse_media("hologram:x").is_err());
    }

    #[test]
    fn test_build_payload_shapes() {
        assert!(matches!(
            build_payload(Some("hi".into()), &[], None).unwrap(),
            Payload::Text { .. }
        ));
        assert!(matches!(
            build_payload(None, &["video:v1".into()], Some("cap".into())).unwrap(),
            Payload::MediaReference { .. }
        ));
        assert!(matches!(
            build_payload(None, &["photo:a".into(), "photo:b".into()], None).unwrap(),
            Payload::MediaGroup { .. }
        ));
        assert!(build_payload(None, &[], None).is_err());
    }

    #[test]
    fn test_due_time() {
        let now = Utc::now();
        assert_eq!(due_time(None, None, now).unwrap(), now);
        assert_eq!(
            due_time(None, Some(90), now).unwrap(),
            now + chrono::Duration::seconds(90)
        );
        let at = due_time(Some("2030-01-02T03:04:05+02:00"), None, now).unwrap();
        assert_eq!(at.to_rfc3339(), "2030-01-02T01:04:05+00:00");
        assert!(due_time(Some("tomorrow"), None, now).is_err());
    }

    #[tokio::test]
    async fn test_schedule_then_cancel_through_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("courier.json");

        let Scheduled {
            item_id, job_id, ..
        } = {
            let scheduler = open(&path, SchedulerConfig::default(), Vec::new())
                .await
                .unwrap();
            let request = ScheduleRequest {
                text: Some("hello".into()),
                to: vec!["news".into(), "alerts".into()],
                in_seconds: Some(3600),
                ..Default::default()
            };
            schedule_with(&scheduler, request, Utc::now()).await.unwrap()
        };

        // A fresh process sees the persisted job and can cancel it.
        let scheduler = open(&path, SchedulerConfig::default(), Vec::new())
            .await
            .unwrap();
        assert_eq!(scheduler.restore_all().await.unwrap(), 1);
        assert!(scheduler.cancel(&job_id).await.unwrap());

        let report = scheduler
            .get_status(&StatusQuery::Item(item_id))
            .await
            .unwrap();
        assert_eq!(report.item.unwrap().status, ItemStatus::Draft);
        assert_eq!(report.jobs[0].status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_schedule_with_deletion() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("courier.json");
        let scheduler = open(&path, SchedulerConfig::default(), Vec::new())
            .await
            .unwrap();

        let now = Utc::now();
        let request = ScheduleRequest {
            text: Some("flash sale".into()),
            to: vec!["news".into()],
            in_seconds: Some(60),
            delete_after_hours: Some(24),
            ..Default::default()
        };
        let scheduled = schedule_with(&scheduler, request, now).await.unwrap();
        let deletion = scheduled.deletion_job_id.unwrap();

        let report = scheduler
            .get_status(&StatusQuery::Job(deletion.clone()))
            .await
            .unwrap();
        let job = report.jobs.iter().find(|j| j.id == deletion).unwrap();
        assert_eq!(job.kind, JobKind::Delete);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(
            job.due_time,
            now + chrono::Duration::seconds(60) + chrono::Duration::hours(24)
        );
        assert_eq!(report.jobs.len(), 2);
    }

    #[tokio::test]
    async fn test_running_daemon_picks_up_cli_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("courier.json");
        let daemon = open(&path, SchedulerConfig::default(), Vec::new())
            .await
            .unwrap();
        assert_eq!(daemon.restore_all().await.unwrap(), 0);

        let cli = open(&path, SchedulerConfig::default(), Vec::new())
            .await
            .unwrap();
        let request = ScheduleRequest {
            text: Some("hello".into()),
            to: vec!["news".into()],
            in_seconds: Some(3600),
            ..Default::default()
        };
        let scheduled = schedule_with(&cli, request, Utc::now()).await.unwrap();

        // The daemon's rescan arms the job the CLI wrote.
        assert_eq!(daemon.restore_all().await.unwrap(), 1);

        // A cancel through the CLI sticks even though the daemon has it armed.
        assert!(cli.cancel(&scheduled.job_id).await.unwrap());
        assert!(!daemon.cancel(&scheduled.job_id).await.unwrap());
        let report = daemon
            .get_status(&StatusQuery::Job(scheduled.job_id.clone()))
            .await
            .unwrap();
        assert_eq!(report.jobs[0].status, JobStatus::Cancelled);
        assert_eq!(report.item.unwrap().status, ItemStatus::Draft);
    }
}
