//! Fan-out of one payload to many destinations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use tracing::{debug, warn};

use crate::DeliveryError;
use crate::throttle::Throttle;
use crate::transport::Transport;
use crate::types::{DeliveryRef, DestinationId, Payload};

/// Per-destination outcome of one fan-out round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchResult {
    pub succeeded: BTreeMap<DestinationId, DeliveryRef>,
    pub failed: BTreeMap<DestinationId, DeliveryError>,
}

impl DispatchResult {
    /// Whether every targeted destination succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Destinations whose failure may clear up on a later attempt.
    pub fn transient_failures(&self) -> BTreeSet<DestinationId> {
        self.failed
            .iter()
            .filter(|(_, err)| err.is_transient())
            .map(|(dest, _)| dest.clone())
            .collect()
    }
}

/// Sends a payload to a set of destinations concurrently, through the throttle.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    throttle: Arc<Throttle>,
    parallelism: Option<usize>,
    attempt_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        throttle: Arc<Throttle>,
        parallelism: Option<usize>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            throttle,
            parallelism,
            attempt_timeout,
        }
    }

    /// Deliver `payload` to every destination in `destinations`.
    ///
    /// Every destination gets exactly one attempt. A failure for one never
    /// prevents attempts on the others, and the call returns only after all
    /// attempts have finished.
    #[tracing::instrument(skip(self, payload), fields(kind = payload.kind(), count = destinations.len()))]
    pub async fn dispatch(
        &self,
        payload: &Payload,
        destinations: &BTreeSet<DestinationId>,
    ) -> DispatchResult {
        let limit = self.parallelism.unwrap_or(destinations.len()).max(1);

        let outcomes: Vec<(DestinationId, Result<DeliveryRef, DeliveryError>)> =
            stream::iter(destinations.iter().cloned())
                .map(|destination| async move {
                    let outcome = self.deliver_one(&destination, payload).await;
                    (destination, outcome)
                })
                .buffer_unordered(limit)
                .collect()
                .await;

        let mut result = DispatchResult::default();
        for (destination, outcome) in outcomes {
            match outcome {
                Ok(delivery_ref) => {
                    result.succeeded.insert(destination, delivery_ref);
                }
                Err(e) => {
                    result.failed.insert(destination, e);
                }
            }
        }
        result
    }

    async fn deliver_one(
        &self,
        destination: &DestinationId,
        payload: &Payload,
    ) -> Result<DeliveryRef, DeliveryError> {
        self.throttle.acquire(destination).await;

        let outcome = match tokio::time::timeout(
            self.attempt_timeout,
            self.transport.deliver(destination, payload),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(DeliveryError::Timeout(self.attempt_timeout)),
        };

        match &outcome {
            Ok(delivery_ref) => {
                debug!(destination = %destination, delivery_ref = %delivery_ref, "delivered")
            }
            Err(e) => warn!(
                destination = %destination,
                error = %e,
                transient = e.is_transient(),
                "delivery failed"
            ),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers from a fixed table; unknown destinations succeed.
    #[derive(Default)]
    struct TableTransport {
        failures: HashMap<String, DeliveryError>,
        hang: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for TableTransport {
        async fn deliver(
            &self,
            destination: &DestinationId,
            _payload: &Payload,
        ) -> Result<DeliveryRef, DeliveryError> {
            self.calls.lock().unwrap().push(destination.to_string());
            if self.hang.iter().any(|d| d == destination.as_str()) {
                std::future::pending::<()>().await;
            }
            match self.failures.get(destination.as_str()) {
                Some(err) => Err(err.clone()),
                None => Ok(DeliveryRef::new(format!("ref-{}", destination))),
            }
        }
    }

    fn dests(names: &[&str]) -> BTreeSet<DestinationId> {
        names.iter().map(|n| DestinationId::from(*n)).collect()
    }

    fn dispatcher(transport: Arc<TableTransport>, parallelism: Option<usize>) -> Dispatcher {
        Dispatcher::new(
            transport,
            Arc::new(Throttle::new(Duration::from_millis(10))),
            parallelism,
            Duration::from_secs(30),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_destinations_attempted_once() {
        let transport = Arc::new(TableTransport {
            failures: HashMap::from([(
                "b".to_string(),
                DeliveryError::Forbidden("kicked".into()),
            )]),
            ..Default::default()
        });
        let payload = Payload::text("hi").unwrap();
        let result = dispatcher(transport.clone(), None)
            .dispatch(&payload, &dests(&["a", "b", "c"]))
            .await;

        assert_eq!(result.succeeded.len(), 2);
        assert_eq!(result.failed.len(), 1);
        assert!(!result.is_complete());
        assert!(result.transient_failures().is_empty());

        let mut calls = transport.calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(calls, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_collected() {
        let transport = Arc::new(TableTransport {
            failures: HashMap::from([
                (
                    "a".to_string(),
                    DeliveryError::RateLimited {
                        retry_after_secs: Some(3),
                    },
                ),
                ("b".to_string(), DeliveryError::NotFound("gone".into())),
            ]),
            ..Default::default()
        });
        let payload = Payload::text("hi").unwrap();
        let result = dispatcher(transport, Some(1))
            .dispatch(&payload, &dests(&["a", "b", "c"]))
            .await;

        assert_eq!(result.transient_failures(), dests(&["a"]));
        assert_eq!(result.succeeded.keys().cloned().collect::<BTreeSet<_>>(), dests(&["c"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_destination_times_out() {
        let transport = Arc::new(TableTransport {
            hang: vec!["slow".to_string()],
            ..Default::default()
        });
        let payload = Payload::text("hi").unwrap();
        let result = dispatcher(transport, None)
            .dispatch(&payload, &dests(&["fast", "slow"]))
            .await;

        assert!(result.succeeded.contains_key(&DestinationId::from("fast")));
        assert_eq!(
            result.failed.get(&DestinationId::from("slow")),
            Some(&DeliveryError::Timeout(Duration::from_secs(30)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_destination_set() {
        let transport = Arc::new(TableTransport::default());
        let payload = Payload::text("hi").unwrap();
        let result = dispatcher(transport, None)
            .dispatch(&payload, &BTreeSet::new())
            .await;
        assert!(result.is_complete());
        assert!(result.succeeded.is_empty());
    }
}
