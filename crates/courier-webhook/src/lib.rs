//! HTTP webhook transport for Courier.
//!
//! Each destination maps to a URL. A delivery is a JSON `POST` of the
//! destination id and payload; the HTTP outcome is mapped onto the
//! transient/permanent delivery error taxonomy.

mod error;
mod transport;

pub use error::WebhookError;
pub use reqwest::Url;
pub use transport::{WebhookTransport, parse_route};
