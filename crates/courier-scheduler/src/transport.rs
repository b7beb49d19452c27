//! The delivery seam between the scheduler and the outside world.

use async_trait::async_trait;

use crate::DeliveryError;
use crate::types::{DeliveryRef, DestinationId, Payload};

/// Sends a payload to a single destination.
///
/// Implementations classify failures through [`DeliveryError`]; the scheduler
/// retries only transient ones.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(
        &self,
        destination: &DestinationId,
        payload: &Payload,
    ) -> Result<DeliveryRef, DeliveryError>;
}
