//! REST backend access: the HTTP client, the endpoint table and the response
//! envelope conventions of the back-office API.

mod client;
pub mod endpoints;
mod envelope;
mod error;

pub use client::ApiClient;
pub use envelope::{backend_message, Envelope, Page};
pub use error::ApiError;

/// Query parameters for a request. Scalars are sent as-is, `null` is skipped.
pub type Params = serde_json::Map<String, serde_json::Value>;
