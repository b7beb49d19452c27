//! Error types for the webhook transport.

use thiserror::Error;

/// Errors that can occur while configuring the webhook transport.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// A route was not of the form `NAME=URL`, or its URL is invalid.
    #[error("invalid route '{route}': {reason}")]
    InvalidRoute { route: String, reason: String },
}
