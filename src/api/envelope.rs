//! Response shapes shared by the back-office endpoints.
//!
//! Most endpoints wrap their payload as `{ success, message, data }` and list
//! endpoints return a paginator inside `data`. Nothing here is enforced on
//! responses; callers opt in when they want typed access.

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;

/// `{ success, message, data }` wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T = Value> {
  #[serde(default)]
  pub success: Option<bool>,
  #[serde(default)]
  pub message: Option<String>,
  #[serde(default = "Option::default")]
  pub data: Option<T>,
}

impl<T: DeserializeOwned> Envelope<T> {
  /// Interpret a raw payload as an envelope.
  pub fn from_value(value: &Value) -> serde_json::Result<Self> {
    serde_json::from_value(value.clone())
  }

  /// The backend reported failure explicitly.
  pub fn is_failure(&self) -> bool {
    self.success == Some(false)
  }
}

/// Paginated collection as returned by list endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
  #[serde(default = "Vec::new")]
  pub data: Vec<T>,
  #[serde(default = "first_page")]
  pub current_page: u64,
  #[serde(default = "first_page")]
  pub last_page: u64,
  #[serde(default)]
  pub per_page: Option<u64>,
  #[serde(default)]
  pub total: Option<u64>,
}

fn first_page() -> u64 {
  1
}

impl<T> Page<T> {
  pub fn has_next(&self) -> bool {
    self.current_page < self.last_page
  }
}

impl<T: DeserializeOwned> Page<T> {
  /// Find the paginator in a payload: either the payload itself or its `data` field.
  pub fn from_payload(value: &Value) -> Option<Self> {
    let candidate = match value.get("current_page") {
      Some(_) => value,
      None => value.get("data").filter(|d| d.get("current_page").is_some())?,
    };
    serde_json::from_value(candidate.clone()).ok()
  }
}

/// Extract the human-readable `message` of an error body, if it has one.
pub fn backend_message(body: &[u8]) -> Option<String> {
  let value: Value = serde_json::from_slice(body).ok()?;
  value
    .get("message")
    .and_then(Value::as_str)
    .map(str::trim)
    .filter(|m| !m.is_empty())
    .map(String::from)
}
