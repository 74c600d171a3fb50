//! The in-memory cache slice.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;

use super::state::{FetchRequest, RequestStatus, ResolvePolicy};

/// Identifies one dispatch while it is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
  pub key: String,
  pub seq: u64,
}

/// What happened to a settling response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  /// Written to the slice
  Applied,
  /// Superseded by a newer dispatch (or the key was cleared) and dropped
  Discarded,
}

/// Cached state for one item key
#[derive(Debug, Clone, Default)]
pub struct Entry {
  data: Option<Value>,
  fetched_at: Option<DateTime<Utc>>,
  settled: RequestStatus,
  awaiting_latest: bool,
  created_seq: u64,
  latest_seq: u64,
  in_flight: usize,
  last_request: Option<FetchRequest>,
}

impl Entry {
  /// Payload of the last accepted success
  pub fn data(&self) -> Option<&Value> {
    self.data.as_ref()
  }

  pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
    self.fetched_at
  }

  pub fn status(&self) -> RequestStatus {
    if self.awaiting_latest {
      RequestStatus::Pending
    } else {
      self.settled.clone()
    }
  }

  /// Dispatches for this key that have not settled yet
  pub fn in_flight(&self) -> usize {
    self.in_flight
  }

  pub fn last_request(&self) -> Option<&FetchRequest> {
    self.last_request.as_ref()
  }
}

/// Keyed response cache plus request state.
///
/// `loading` and `error` are process-wide: every dispatch flips the same
/// flag, so `loading` reflects whichever request settled last. Use
/// [`Slice::any_pending`] or [`Entry::status`] for an accurate view.
#[derive(Debug, Default)]
pub struct Slice {
  entries: HashMap<String, Entry>,
  loading: bool,
  error: Option<String>,
  policy: ResolvePolicy,
  next_seq: u64,
}

impl Slice {
  pub fn new(policy: ResolvePolicy) -> Self {
    Self {
      policy,
      ..Self::default()
    }
  }

  pub fn policy(&self) -> ResolvePolicy {
    self.policy
  }

  /// Record the start of a dispatch.
  pub fn begin(&mut self, request: &FetchRequest) -> Ticket {
    self.next_seq += 1;
    let seq = self.next_seq;

    let entry = self
      .entries
      .entry(request.item_key.clone())
      .or_insert_with(|| Entry {
        created_seq: seq,
        ..Entry::default()
      });
    entry.latest_seq = seq;
    entry.awaiting_latest = true;
    entry.in_flight += 1;
    entry.last_request = Some(request.clone());

    self.loading = true;

    Ticket {
      key: request.item_key.clone(),
      seq,
    }
  }

  /// Store a successful payload, replacing whatever the key held.
  pub fn fulfill(&mut self, ticket: &Ticket, payload: Value) -> Outcome {
    self.loading = false;

    let policy = self.policy;
    let Some(entry) = self.settle(ticket) else {
      return Outcome::Discarded;
    };
    if !accepts(policy, entry, ticket) {
      return Outcome::Discarded;
    }

    entry.data = Some(payload);
    entry.fetched_at = Some(Utc::now());
    entry.settled = RequestStatus::Fulfilled;
    Outcome::Applied
  }

  /// Record a failure. The key's data is left untouched.
  pub fn reject(&mut self, ticket: &Ticket, message: String) -> Outcome {
    self.loading = false;

    let policy = self.policy;
    let Some(entry) = self.settle(ticket) else {
      return Outcome::Discarded;
    };
    if !accepts(policy, entry, ticket) {
      return Outcome::Discarded;
    }

    entry.settled = RequestStatus::Rejected(message.clone());
    self.error = Some(message);
    Outcome::Applied
  }

  /// Forget a dispatch that will never settle.
  pub fn cancel(&mut self, ticket: &Ticket) {
    self.settle(ticket);
    self.loading = self.any_pending();
  }

  fn settle(&mut self, ticket: &Ticket) -> Option<&mut Entry> {
    let entry = self.entries.get_mut(&ticket.key)?;
    // Entry recreated after clear(); this ticket belongs to the old one.
    if ticket.seq < entry.created_seq || entry.in_flight == 0 {
      return None;
    }
    entry.in_flight -= 1;
    if ticket.seq == entry.latest_seq {
      entry.awaiting_latest = false;
    }
    Some(entry)
  }

  pub fn entry(&self, key: &str) -> Option<&Entry> {
    self.entries.get(key)
  }

  pub fn data(&self, key: &str) -> Option<&Value> {
    self.entries.get(key).and_then(Entry::data)
  }

  /// Deserialize the payload stored under `key`.
  pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> serde_json::Result<Option<T>> {
    self
      .data(key)
      .map(|value| T::deserialize(value))
      .transpose()
  }

  pub fn status(&self, key: &str) -> RequestStatus {
    self.entries.get(key).map(Entry::status).unwrap_or_default()
  }

  pub fn last_request(&self, key: &str) -> Option<&FetchRequest> {
    self.entries.get(key).and_then(Entry::last_request)
  }

  /// Global loading flag
  pub fn loading(&self) -> bool {
    self.loading
  }

  /// Message of the most recent accepted failure, for any key
  pub fn error(&self) -> Option<&str> {
    self.error.as_deref()
  }

  pub fn clear_error(&mut self) {
    self.error = None;
  }

  /// Whether any dispatch, for any key, is still in flight.
  pub fn any_pending(&self) -> bool {
    self.entries.values().any(|e| e.in_flight > 0)
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.entries.keys().map(String::as_str)
  }

  /// Drop every entry and reset the flags. In-flight responses are discarded.
  pub fn clear(&mut self) {
    self.entries.clear();
    self.loading = false;
    self.error = None;
  }
}

fn accepts(policy: ResolvePolicy, entry: &Entry, ticket: &Ticket) -> bool {
  match policy {
    ResolvePolicy::LastResolved => true,
    ResolvePolicy::LatestDispatched => ticket.seq == entry.latest_seq,
  }
}
