//! Courier: scheduled fan-out delivery
//!
//! Main binary with subcommands:
//! - `run`: restore pending jobs and deliver until Ctrl-C
//! - `schedule`: create an item and schedule its delivery
//! - `cancel`, `delete`, `status`, `jobs`, `cleanup`: inspect and manage the store
//!
//! Management commands edit the store file directly, under the same file lock
//! the daemon uses. A running daemon rescans the store and arms new jobs.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier_scheduler::SchedulerConfig;

mod commands;
mod daemon;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Scheduled fan-out delivery", long_about = None)]
struct Cli {
    /// Path of the JSON store holding items and jobs
    #[arg(long, global = true, env = "COURIER_STORE", default_value = "courier.json")]
    store: PathBuf,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Scheduler tunables. Unset options keep their defaults.
#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// Total delivery attempts per item, including the first
    #[arg(long, global = true, env = "COURIER_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Delay before the first retry, in seconds
    #[arg(long, global = true, env = "COURIER_BACKOFF_BASE_SECONDS")]
    backoff_base_seconds: Option<u64>,

    /// Upper bound on any retry delay, in seconds
    #[arg(long, global = true, env = "COURIER_BACKOFF_CAP_SECONDS")]
    backoff_cap_seconds: Option<u64>,

    /// Minimum spacing between sends to one destination, in milliseconds
    #[arg(long, global = true, env = "COURIER_MIN_INTERVAL_MS")]
    min_interval_ms: Option<u64>,

    /// Concurrent deliveries per fan-out round (unbounded when unset)
    #[arg(long, global = true, env = "COURIER_DISPATCH_PARALLELISM")]
    dispatch_parallelism: Option<usize>,

    /// How far in the past a due time may be, in seconds
    #[arg(long, global = true, env = "COURIER_PAST_DUE_GRACE_SECONDS")]
    past_due_grace_seconds: Option<u64>,

    /// Deadline for a single delivery, in seconds
    #[arg(long, global = true, env = "COURIER_ATTEMPT_TIMEOUT_SECONDS")]
    attempt_timeout_seconds: Option<u64>,

    /// How far ahead a delivery may be scheduled, in days
    #[arg(long, global = true, env = "COURIER_MAX_SCHEDULE_HORIZON_DAYS")]
    max_schedule_horizon_days: Option<u32>,

    /// Age after which finished jobs are purged, in days
    #[arg(long, global = true, env = "COURIER_RETENTION_DAYS")]
    retention_days: Option<u32>,
}

impl ConfigArgs {
    fn into_config(self) -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        if let Some(v) = self.max_attempts {
            config.max_attempts = v;
        }
        if let Some(v) = self.backoff_base_seconds {
            config.backoff_base_seconds = v;
        }
        if let Some(v) = self.backoff_cap_seconds {
            config.backoff_cap_seconds = v;
        }
        if let Some(v) = self.min_interval_ms {
            config.min_interval_per_destination_ms = v;
        }
        if self.dispatch_parallelism.is_some() {
            config.dispatch_parallelism = self.dispatch_parallelism;
        }
        if let Some(v) = self.past_due_grace_seconds {
            config.past_due_grace_seconds = v;
        }
        if let Some(v) = self.attempt_timeout_seconds {
            config.attempt_timeout_seconds = v;
        }
        if let Some(v) = self.max_schedule_horizon_days {
            config.max_schedule_horizon_days = v;
        }
        if let Some(v) = self.retention_days {
            config.retention_days = v;
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Restore pending jobs and deliver them until interrupted
    Run {
        /// Webhook route, NAME=URL (repeatable)
        #[arg(long = "destination", env = "COURIER_DESTINATIONS", value_delimiter = ',')]
        destinations: Vec<String>,

        /// How often to look for jobs added by other processes, in seconds
        #[arg(
            long,
            env = "COURIER_RESCAN_SECONDS",
            default_value_t = 5,
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        rescan_seconds: u64,
    },

    /// Create a content item and schedule its delivery
    Schedule {
        /// Text body
        #[arg(long, conflicts_with = "media")]
        text: Option<String>,

        /// Media reference, KIND:REF (repeat for a media group)
        #[arg(long)]
        media: Vec<String>,

        /// Caption for media
        #[arg(long, requires = "media")]
        caption: Option<String>,

        /// Destination name (repeatable)
        #[arg(long = "to", required = true)]
        to: Vec<String>,

        /// Due time as RFC 3339 (default: now)
        #[arg(long, conflicts_with = "in_seconds")]
        at: Option<String>,

        /// Due time as seconds from now
        #[arg(long = "in")]
        in_seconds: Option<u64>,

        /// Also delete the item this many hours after the due time
        #[arg(long)]
        delete_after_hours: Option<u32>,
    },

    /// Cancel a pending or failed job
    Cancel {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },

    /// Delete a content item now, or schedule its deletion
    Delete {
        #[arg(value_name = "ITEM_ID")]
        item_id: String,

        /// Delete at this RFC 3339 time instead of now
        #[arg(long, conflicts_with = "in_seconds")]
        at: Option<String>,

        /// Delete this many seconds from now
        #[arg(long = "in")]
        in_seconds: Option<u64>,
    },

    /// Show an item and its jobs
    Status {
        /// Look up by item id
        #[arg(long, conflicts_with = "job", required_unless_present = "job")]
        item: Option<String>,

        /// Look up by job id
        #[arg(long)]
        job: Option<String>,
    },

    /// List every job in the store
    Jobs,

    /// Purge finished jobs older than the retention window
    Cleanup {
        /// Override the retention window, in days
        #[arg(long)]
        older_than_days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "courier=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.config.into_config();
    let store = cli.store;

    match cli.command {
        Commands::Run {
            destinations,
            rescan_seconds,
        } => {
            let rescan = std::time::Duration::from_secs(rescan_seconds);
            daemon::run(&store, config, &destinations, rescan).await
        }

        Commands::Schedule {
            text,
            media,
            caption,
            to,
            at,
            in_seconds,
            delete_after_hours,
        } => {
            let request = commands::ScheduleRequest {
                text,
                media,
                caption,
                to,
                at,
                in_seconds,
                delete_after_hours,
            };
            commands::schedule(&store, config, request).await
        }

        Commands::Cancel { job_id } => commands::cancel(&store, config, &job_id).await,

        Commands::Delete {
            item_id,
            at,
            in_seconds,
        } => commands::delete(&store, config, &item_id, at, in_seconds).await,

        Commands::Status { item, job } => commands::status(&store, config, item, job).await,

        Commands::Jobs => commands::jobs(&store, config).await,

        Commands::Cleanup { older_than_days } => {
            commands::cleanup(&store, config, older_than_days).await
        }
    }
}
