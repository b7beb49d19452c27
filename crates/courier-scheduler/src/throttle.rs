//! Per-destination send spacing.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::types::DestinationId;

/// Enforces a minimum interval between consecutive sends to one destination.
///
/// Destinations are independent: waiting on one never delays another. Callers
/// for the same destination queue on that destination's slot and are released
/// one interval apart.
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    slots: DashMap<DestinationId, Arc<Mutex<Option<Instant>>>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            slots: DashMap::new(),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until a send to `destination` is allowed, then claim the slot.
    pub async fn acquire(&self, destination: &DestinationId) {
        // Clone the slot out so no map shard lock is held across the await.
        let slot = self
            .slots
            .entry(destination.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let mut last = slot.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            if ready_at > Instant::now() {
                debug!(
                    destination = %destination,
                    wait_ms = ready_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "throttling send"
                );
                sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
