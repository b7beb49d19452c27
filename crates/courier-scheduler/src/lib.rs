//! Durable fan-out delivery scheduler for Courier.
//!
//! This crate provides a persistent scheduler that:
//! - Delivers a content item to many destinations at a scheduled time
//! - Survives crashes and restarts, requeueing interrupted deliveries
//! - Retries transient failures through new, narrowed schedules with
//!   capped exponential backoff
//! - Spaces sends per destination with a throttle
//! - Deletes items at a scheduled time

mod clock;
mod config;
mod dispatcher;
mod error;
mod retry;
mod scheduler;
pub mod store;
mod throttle;
mod transport;
mod types;

pub use clock::{Clock, SystemClock, TokioClock};
pub use config::SchedulerConfig;
pub use dispatcher::{DispatchResult, Dispatcher};
pub use error::{ConfigError, DeliveryError, ModelError, SchedulerError, StoreError};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{Scheduler, StatusQuery, StatusReport};
pub use store::{ContentStore, FileStore, JobStore, MemoryContentStore, MemoryJobStore};
pub use throttle::Throttle;
pub use transport::Transport;
pub use types::{
    ContentItem, DeliveryFailure, DeliveryRef, DestinationId, ErrorClass, ItemId, ItemStatus,
    JobId, JobKind, JobStatus, MAX_CAPTION_CHARS, MAX_MEDIA_GROUP, MAX_TEXT_CHARS, MIN_MEDIA_GROUP,
    MediaKind, MediaRef, Payload, Recovery, Schedule,
};
