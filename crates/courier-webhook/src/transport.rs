//! Webhook delivery.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use courier_scheduler::{DeliveryError, DeliveryRef, DestinationId, Payload, Transport};

use crate::WebhookError;

/// Delivers payloads by POSTing them to a per-destination URL.
pub struct WebhookTransport {
    http: Client,
    routes: HashMap<DestinationId, Url>,
    timeout: Duration,
}

#[derive(Serialize)]
struct DeliveryRequest<'a> {
    destination: &'a DestinationId,
    payload: &'a Payload,
}

impl WebhookTransport {
    /// Create a transport for `routes`. `timeout` bounds each request.
    pub fn new(
        routes: impl IntoIterator<Item = (DestinationId, Url)>,
        timeout: Duration,
    ) -> Result<Self, WebhookError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            routes: routes.into_iter().collect(),
            timeout,
        })
    }

    fn classify_request_error(&self, err: reqwest::Error) -> DeliveryError {
        if err.is_timeout() {
            DeliveryError::Timeout(self.timeout)
        } else {
            DeliveryError::Network(err.to_string())
        }
    }

    /// Destinations this transport can reach.
    pub fn destinations(&self) -> impl Iterator<Item = &DestinationId> {
        self.routes.keys()
    }
}

/// Parse a `NAME=URL` route.
pub fn parse_route(route: &str) -> Result<(DestinationId, Url), WebhookError> {
    let invalid = |reason: &str| WebhookError::InvalidRoute {
        route: route.to_string(),
        reason: reason.to_string(),
    };

    let (name, url) = route
        .split_once('=')
        .ok_or_else(|| invalid("expected NAME=URL"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(invalid("destination name is empty"));
    }

    let url = Url::parse(url.trim()).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("URL must use http or https"));
    }
    Ok((DestinationId::from(name), url))
}

#[async_trait]
impl Transport for WebhookTransport {
    async fn deliver(
        &self,
        destination: &DestinationId,
        payload: &Payload,
    ) -> Result<DeliveryRef, DeliveryError> {
        let url = self
            .routes
            .get(destination)
            .ok_or_else(|| DeliveryError::NotFound(format!("no route for {}", destination)))?;

        let response = self
            .http
            .post(url.clone())
            .json(&DeliveryRequest {
                destination,
                payload,
            })
            .send()
            .await
            .map_err(|e| self.classify_request_error(e))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(DeliveryError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = if text.is_empty() {
                status.to_string()
            } else {
                format!("{}: {}", status, text)
            };
            return Err(classify_status(status, detail));
        }

        // The body is optional; fall back to a local reference.
        let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
        let delivery_ref = match body.get("id") {
            Some(serde_json::Value::String(id)) => DeliveryRef::new(id.clone()),
            Some(serde_json::Value::Number(id)) => DeliveryRef::new(id.to_string()),
            _ => DeliveryRef::new(Uuid::new_v4().to_string()),
        };

        debug!(destination = %destination, status = %status, delivery_ref = %delivery_ref, "webhook accepted");
        Ok(delivery_ref)
    }
}

fn classify_status(status: StatusCode, detail: String) -> DeliveryError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => DeliveryError::NotFound(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DeliveryError::Forbidden(detail),
        StatusCode::REQUEST_TIMEOUT => DeliveryError::Unavailable(detail),
        s if s.is_server_error() => DeliveryError::Unavailable(detail),
        _ => DeliveryError::Rejected(detail),
    }
}
