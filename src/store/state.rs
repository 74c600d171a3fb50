//! Request lifecycle types shared by the slice and the dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::Params;

/// The state of one cached key
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RequestStatus {
  /// Never fetched
  #[default]
  Idle,
  /// Latest dispatch for this key has not settled
  Pending,
  /// Latest accepted fetch succeeded
  Fulfilled,
  /// Latest accepted fetch failed
  Rejected(String),
}

impl RequestStatus {
  pub fn is_pending(&self) -> bool {
    matches!(self, RequestStatus::Pending)
  }

  pub fn is_fulfilled(&self) -> bool {
    matches!(self, RequestStatus::Fulfilled)
  }

  pub fn is_rejected(&self) -> bool {
    matches!(self, RequestStatus::Rejected(_))
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      RequestStatus::Rejected(e) => Some(e),
      _ => None,
    }
  }
}

/// Which response is kept when fetches for the same key overlap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolvePolicy {
  /// Whichever response settles last is stored, regardless of dispatch order
  #[default]
  LastResolved,
  /// Responses older than the key's latest dispatch are discarded
  LatestDispatched,
}

/// A fetch to run and the key to store its payload under
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
  pub url: String,
  pub item_key: String,
  pub params: Params,
}

impl FetchRequest {
  pub fn new(url: impl Into<String>, item_key: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      item_key: item_key.into(),
      params: Params::new(),
    }
  }

  /// Add a query parameter.
  pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.params.insert(key.into(), value.into());
    self
  }

  pub fn with_params(mut self, params: Params) -> Self {
    self.params = params;
    self
  }
}

/// Notification published by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
  Pending { key: String, seq: u64 },
  Fulfilled { key: String, seq: u64 },
  Rejected { key: String, seq: u64, message: String },
  /// A response arrived after a newer dispatch for the same key
  Discarded { key: String, seq: u64 },
  Cancelled { key: String, seq: u64 },
}

impl StoreEvent {
  pub fn key(&self) -> &str {
    match self {
      StoreEvent::Pending { key, .. }
      | StoreEvent::Fulfilled { key, .. }
      | StoreEvent::Rejected { key, .. }
      | StoreEvent::Discarded { key, .. }
      | StoreEvent::Cancelled { key, .. } => key,
    }
  }
}
