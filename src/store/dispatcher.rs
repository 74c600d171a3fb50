//! Request dispatcher: runs fetches and records their outcome in the slice.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ApiError, Params};

use super::slice::{Outcome, Slice, Ticket};
use super::state::{FetchRequest, RequestStatus, ResolvePolicy, StoreEvent};

/// Something that can perform backend requests.
///
/// Implemented by [`crate::api::ApiClient`]; tests plug in scripted stubs.
pub trait Fetch: Send + Sync + 'static {
  fn request(
    &self,
    method: Method,
    path: &str,
    params: Option<&Params>,
    body: Option<&Value>,
  ) -> impl Future<Output = Result<Value, ApiError>> + Send;

  /// GET a collection.
  fn fetch(&self, path: &str, params: &Params) -> impl Future<Output = Result<Value, ApiError>> + Send {
    self.request(Method::GET, path, Some(params), None)
  }
}

#[derive(Debug, Error)]
pub enum DispatchError {
  #[error("fetch for '{key}' failed: {source}")]
  Api {
    key: String,
    #[source]
    source: ApiError,
  },

  /// The response arrived after a newer dispatch for the same key
  #[error("response for '{key}' was superseded by a newer request")]
  Superseded { key: String },

  #[error("fetch for '{key}' was cancelled")]
  Cancelled { key: String },

  #[error("no request has been dispatched for '{key}'")]
  UnknownKey { key: String },

  #[error("{method} {path} failed: {source}")]
  Mutation {
    method: Method,
    path: String,
    #[source]
    source: ApiError,
  },
}

impl DispatchError {
  /// Underlying API error, if the backend call itself failed.
  pub fn api_error(&self) -> Option<&ApiError> {
    match self {
      Self::Api { source, .. } | Self::Mutation { source, .. } => Some(source),
      _ => None,
    }
  }
}

/// Ticket of a dispatch that has not settled yet.
///
/// Cancels the ticket on drop unless disarmed, so an aborted task or a
/// dropped dispatch future never leaves its key pending.
struct InFlight {
  ticket: Ticket,
  slice: Arc<Mutex<Slice>>,
  events: broadcast::Sender<StoreEvent>,
  armed: bool,
}

impl Drop for InFlight {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    self
      .slice
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .cancel(&self.ticket);
    debug!(key = %self.ticket.key, seq = self.ticket.seq, "dispatch cancelled");
    let _ = self.events.send(StoreEvent::Cancelled {
      key: self.ticket.key.clone(),
      seq: self.ticket.seq,
    });
  }
}

const EVENT_CAPACITY: usize = 256;

/// Dispatches fetches and owns the shared cache slice.
///
/// Cloning is cheap; clones share the slice and the event channel.
pub struct Dispatcher<F: Fetch> {
  fetcher: Arc<F>,
  slice: Arc<Mutex<Slice>>,
  events: broadcast::Sender<StoreEvent>,
}

impl<F: Fetch> Clone for Dispatcher<F> {
  fn clone(&self) -> Self {
    Self {
      fetcher: Arc::clone(&self.fetcher),
      slice: Arc::clone(&self.slice),
      events: self.events.clone(),
    }
  }
}

impl<F: Fetch> Dispatcher<F> {
  pub fn new(fetcher: F, policy: ResolvePolicy) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      fetcher: Arc::new(fetcher),
      slice: Arc::new(Mutex::new(Slice::new(policy))),
      events,
    }
  }

  pub fn fetcher(&self) -> &F {
    &self.fetcher
  }

  /// Lock the slice for reading. Do not hold the guard across an await.
  pub fn slice(&self) -> MutexGuard<'_, Slice> {
    // Slice updates are single assignments; a panic mid-update leaves it usable.
    self.slice.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Receive lifecycle notifications for every key.
  pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
    self.events.subscribe()
  }

  fn emit(&self, event: StoreEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }

  /// Fetch `request.url` and store the payload under `request.item_key`.
  ///
  /// Returns the payload when it was stored. A response superseded by a newer
  /// dispatch for the same key is reported as [`DispatchError::Superseded`].
  pub async fn dispatch(&self, request: FetchRequest) -> Result<Value, DispatchError> {
    self.run(request, None).await
  }

  /// Like [`Dispatcher::dispatch`], abandoned when `cancel` fires first.
  ///
  /// A cancelled dispatch never writes to the slice.
  pub async fn dispatch_with_cancel(
    &self,
    request: FetchRequest,
    cancel: CancellationToken,
  ) -> Result<Value, DispatchError> {
    self.run(request, Some(cancel)).await
  }

  /// Dispatch on the runtime without waiting for the result.
  pub fn spawn(&self, request: FetchRequest) -> JoinHandle<Result<Value, DispatchError>> {
    let dispatcher = self.clone();
    tokio::spawn(async move { dispatcher.dispatch(request).await })
  }

  /// Spawned dispatch tied to a cancellation token (e.g. a screen's lifetime).
  pub fn spawn_with_cancel(
    &self,
    request: FetchRequest,
    cancel: CancellationToken,
  ) -> JoinHandle<Result<Value, DispatchError>> {
    let dispatcher = self.clone();
    tokio::spawn(async move { dispatcher.dispatch_with_cancel(request, cancel).await })
  }

  async fn run(
    &self,
    request: FetchRequest,
    cancel: Option<CancellationToken>,
  ) -> Result<Value, DispatchError> {
    let mut in_flight = InFlight {
      ticket: self.slice().begin(&request),
      slice: Arc::clone(&self.slice),
      events: self.events.clone(),
      armed: true,
    };
    let ticket = in_flight.ticket.clone();
    debug!(key = %ticket.key, seq = ticket.seq, url = %request.url, "dispatch");
    self.emit(StoreEvent::Pending {
      key: ticket.key.clone(),
      seq: ticket.seq,
    });

    let fetch = self.fetcher.fetch(&request.url, &request.params);
    let result = match cancel {
      Some(cancel) => {
        tokio::select! {
          biased;
          _ = cancel.cancelled() => None,
          result = fetch => Some(result),
        }
      }
      None => Some(fetch.await),
    };

    // Dropping `in_flight` while still armed records the cancellation.
    let Some(result) = result else {
      return Err(DispatchError::Cancelled { key: ticket.key });
    };
    in_flight.armed = false;

    match result {
      Ok(payload) => {
        let outcome = self.slice().fulfill(&ticket, payload.clone());
        self.finish(ticket, outcome, None)?;
        Ok(payload)
      }
      Err(source) => {
        let message = source.to_string();
        let outcome = self.slice().reject(&ticket, message.clone());
        self.finish(ticket.clone(), outcome, Some(message))?;
        Err(DispatchError::Api {
          key: ticket.key,
          source,
        })
      }
    }
  }

  /// Publish the settle event; a discarded outcome becomes `Superseded`.
  fn finish(
    &self,
    ticket: Ticket,
    outcome: Outcome,
    failure: Option<String>,
  ) -> Result<(), DispatchError> {
    let Ticket { key, seq } = ticket;

    match (outcome, failure) {
      (Outcome::Discarded, _) => {
        warn!(key = %key, seq, "discarding response superseded by a newer request");
        self.emit(StoreEvent::Discarded {
          key: key.clone(),
          seq,
        });
        Err(DispatchError::Superseded { key })
      }
      (Outcome::Applied, None) => {
        self.emit(StoreEvent::Fulfilled { key, seq });
        Ok(())
      }
      (Outcome::Applied, Some(message)) => {
        warn!(key = %key, seq, error = %message, "fetch rejected");
        self.emit(StoreEvent::Rejected { key, seq, message });
        Ok(())
      }
    }
  }

  /// Repeat the last request dispatched for `key`.
  pub async fn refetch(&self, key: &str) -> Result<Value, DispatchError> {
    let request = self
      .slice()
      .last_request(key)
      .cloned()
      .ok_or_else(|| DispatchError::UnknownKey {
        key: key.to_string(),
      })?;
    self.dispatch(request).await
  }

  /// Write through the backend directly, then refresh the listed keys.
  ///
  /// Refresh failures are recorded in the slice like any dispatch and do not
  /// fail the mutation.
  pub async fn mutate(
    &self,
    method: Method,
    path: &str,
    body: Option<&Value>,
    refresh: &[&str],
  ) -> Result<Value, DispatchError> {
    let response = self
      .fetcher
      .request(method.clone(), path, None, body)
      .await
      .map_err(|source| DispatchError::Mutation {
        method,
        path: path.to_string(),
        source,
      })?;

    let refreshed = join_all(refresh.iter().map(|key| self.refetch(key))).await;
    for (key, result) in refresh.iter().zip(refreshed) {
      if let Err(e) = result {
        warn!(key = %key, "refresh after mutation failed: {}", e);
      }
    }

    Ok(response)
  }

  /// Current payload under `key`.
  pub fn data(&self, key: &str) -> Option<Value> {
    self.slice().data(key).cloned()
  }

  /// Typed read of the payload under `key`.
  pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> serde_json::Result<Option<T>> {
    self.slice().get_as(key)
  }

  pub fn status(&self, key: &str) -> RequestStatus {
    self.slice().status(key)
  }

  pub fn loading(&self) -> bool {
    self.slice().loading()
  }

  pub fn error(&self) -> Option<String> {
    self.slice().error().map(String::from)
  }

  /// Drop every cached entry (logout).
  pub fn clear(&self) {
    self.slice().clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::StatusCode;
  use serde_json::json;
  use std::collections::{HashMap, VecDeque};
  use std::time::Duration;
  use tokio::sync::oneshot;

  type Reply = Result<Value, ApiError>;

  /// Fetch stub: each GET to a URL takes the next scripted reply for it.
  /// Replies are oneshot receivers so tests decide when each one settles.
  #[derive(Default)]
  struct Scripted {
    replies: Mutex<HashMap<String, VecDeque<oneshot::Receiver<Reply>>>>,
    writes: Mutex<Vec<(Method, String, Option<Value>)>>,
  }

  impl Scripted {
    fn gate(&self, url: &str) -> oneshot::Sender<Reply> {
      let (tx, rx) = oneshot::channel();
      self
        .replies
        .lock()
        .unwrap()
        .entry(url.to_string())
        .or_default()
        .push_back(rx);
      tx
    }

    fn ready(&self, url: &str, reply: Reply) {
      let _ = self.gate(url).send(reply);
    }
  }

  impl Fetch for Scripted {
    fn request(
      &self,
      method: Method,
      path: &str,
      _params: Option<&Params>,
      body: Option<&Value>,
    ) -> impl Future<Output = Result<Value, ApiError>> + Send {
      let rx = if method == Method::GET {
        self
          .replies
          .lock()
          .unwrap()
          .get_mut(path)
          .and_then(VecDeque::pop_front)
      } else {
        self
          .writes
          .lock()
          .unwrap()
          .push((method.clone(), path.to_string(), body.cloned()));
        None
      };
      let path = path.to_string();

      async move {
        match rx {
          Some(rx) => rx.await.unwrap_or_else(|_| Ok(Value::Null)),
          None if method == Method::GET => Err(not_found(&path)),
          None => Ok(json!({ "success": true })),
        }
      }
    }
  }

  fn not_found(path: &str) -> ApiError {
    ApiError::Status {
      method: Method::GET,
      path: path.to_string(),
      status: StatusCode::NOT_FOUND,
      message: "Not Found".to_string(),
    }
  }

  fn clients(page: u64) -> FetchRequest {
    FetchRequest::new("/api/clients", "clients").param("page", page)
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
  }

  #[tokio::test]
  async fn test_dispatch_stores_payload() {
    let dispatcher = Dispatcher::new(Scripted::default(), ResolvePolicy::default());
    dispatcher
      .fetcher()
      .ready("/api/clients", Ok(json!({ "data": [{ "id": 1 }] })));

    let payload = dispatcher.dispatch(clients(1)).await.unwrap();

    assert_eq!(payload, json!({ "data": [{ "id": 1 }] }));
    assert_eq!(dispatcher.data("clients"), Some(payload));
    assert_eq!(dispatcher.status("clients"), RequestStatus::Fulfilled);
    assert!(!dispatcher.loading());
  }

  #[tokio::test]
  async fn test_second_page_replaces_first() {
    let dispatcher = Dispatcher::new(Scripted::default(), ResolvePolicy::default());
    dispatcher.fetcher().ready("/api/clients", Ok(json!({ "page": 1 })));
    dispatcher.fetcher().ready("/api/clients", Ok(json!({ "page": 2 })));

    dispatcher.dispatch(clients(1)).await.unwrap();
    dispatcher.dispatch(clients(2)).await.unwrap();

    assert_eq!(dispatcher.data("clients"), Some(json!({ "page": 2 })));
  }

  #[tokio::test]
  async fn test_loading_true_while_pending() {
    let dispatcher = Dispatcher::new(Scripted::default(), ResolvePolicy::default());
    let gate = dispatcher.fetcher().gate("/api/clients");

    let handle = dispatcher.spawn(clients(1));
    settle().await;
    assert!(dispatcher.loading());
    assert_eq!(dispatcher.status("clients"), RequestStatus::Pending);

    gate.send(Ok(json!([]))).unwrap();
    handle.await.unwrap().unwrap();
    assert!(!dispatcher.loading());
  }

  #[tokio::test]
  async fn test_rejection_sets_error_and_keeps_data() {
    let dispatcher = Dispatcher::new(Scripted::default(), ResolvePolicy::default());
    dispatcher.fetcher().ready("/api/clients", Ok(json!([1])));
    dispatcher.dispatch(clients(1)).await.unwrap();

    // Nothing scripted for this URL: the stub answers 404
    let err = dispatcher
      .dispatch(FetchRequest::new("/api/nowhere", "clients"))
      .await
      .unwrap_err();

    let message = err.api_error().unwrap().to_string();
    assert_eq!(dispatcher.error(), Some(message));
    assert!(!dispatcher.loading());
    assert_eq!(dispatcher.data("clients"), Some(json!([1])));
    assert!(dispatcher.status("clients").is_rejected());
  }

  #[tokio::test]
  async fn test_default_policy_keeps_last_settled_response() {
    assert_eq!(ResolvePolicy::default(), ResolvePolicy::LastResolved);
    let dispatcher = Dispatcher::new(Scripted::default(), ResolvePolicy::default());
    let first = dispatcher.fetcher().gate("/api/clients");
    let second = dispatcher.fetcher().gate("/api/clients");

    let h1 = dispatcher.spawn(clients(1));
    settle().await;
    let h2 = dispatcher.spawn(clients(2));
    settle().await;

    second.send(Ok(json!("page 2"))).unwrap();
    h2.await.unwrap().unwrap();
    first.send(Ok(json!("page 1"))).unwrap();
    h1.await.unwrap().unwrap();

    assert_eq!(dispatcher.data("clients"), Some(json!("page 1")));
  }

  #[tokio::test]
  async fn test_latest_dispatched_out_of_order_keeps_newer_response() {
    let dispatcher = Dispatcher::new(Scripted::default(), ResolvePolicy::LatestDispatched);
    let mut events = dispatcher.subscribe();
    let first = dispatcher.fetcher().gate("/api/clients");
    let second = dispatcher.fetcher().gate("/api/clients");

    let h1 = dispatcher.spawn(clients(1));
    settle().await;
    let h2 = dispatcher.spawn(clients(2));
    settle().await;

    second.send(Ok(json!("page 2"))).unwrap();
    h2.await.unwrap().unwrap();
    first.send(Ok(json!("page 1"))).unwrap();
    let late = h1.await.unwrap();

    assert!(matches!(late, Err(DispatchError::Superseded { .. })));
    assert_eq!(dispatcher.data("clients"), Some(json!("page 2")));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
      seen.push(event);
    }
    assert!(seen.contains(&StoreEvent::Discarded {
      key: "clients".to_string(),
      seq: 1
    }));
    assert!(seen.contains(&StoreEvent::Fulfilled {
      key: "clients".to_string(),
      seq: 2
    }));
  }

  #[tokio::test]
  async fn test_cancel_leaves_cache_untouched() {
    let dispatcher = Dispatcher::new(Scripted::default(), ResolvePolicy::default());
    let gate = dispatcher.fetcher().gate("/api/clients");
    let cancel = CancellationToken::new();

    let handle = dispatcher.spawn_with_cancel(clients(1), cancel.clone());
    settle().await;
    cancel.cancel();

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(DispatchError::Cancelled { .. })));
    // The response arriving afterwards goes nowhere
    let _ = gate.send(Ok(json!("late")));
    settle().await;

    assert_eq!(dispatcher.data("clients"), None);
    assert_eq!(dispatcher.status("clients"), RequestStatus::Idle);
    assert!(!dispatcher.loading());
  }

  #[tokio::test]
  async fn test_aborted_task_releases_key() {
    let dispatcher = Dispatcher::new(Scripted::default(), ResolvePolicy::default());
    let mut events = dispatcher.subscribe();
    let _gate = dispatcher.fetcher().gate("/api/clients");

    let handle = dispatcher.spawn(clients(1));
    settle().await;
    assert!(dispatcher.slice().any_pending());

    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    assert!(!dispatcher.loading());
    assert!(!dispatcher.slice().any_pending());
    assert_eq!(dispatcher.status("clients"), RequestStatus::Idle);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
      seen.push(event);
    }
    assert!(seen.contains(&StoreEvent::Cancelled {
      key: "clients".to_string(),
      seq: 1
    }));

    // Later dispatches for the key settle normally
    dispatcher.fetcher().ready("/api/clients", Ok(json!(["fresh"])));
    dispatcher.dispatch(clients(2)).await.unwrap();
    assert_eq!(dispatcher.status("clients"), RequestStatus::Fulfilled);
    assert_eq!(dispatcher.slice().entry("clients").unwrap().in_flight(), 0);
    assert!(!dispatcher.slice().any_pending());
  }

  #[tokio::test]
  async fn test_dispatch_dropped_by_timeout_releases_key() {
    let dispatcher = Dispatcher::new(Scripted::default(), ResolvePolicy::default());
    let _gate = dispatcher.fetcher().gate("/api/clients");

    let timed_out =
      tokio::time::timeout(Duration::from_millis(20), dispatcher.dispatch(clients(1))).await;
    assert!(timed_out.is_err());

    assert!(!dispatcher.loading());
    assert!(!dispatcher.slice().any_pending());
    assert_eq!(dispatcher.status("clients"), RequestStatus::Idle);
  }

  #[tokio::test]
  async fn test_refetch_repeats_last_request() {
    let dispatcher = Dispatcher::new(Scripted::default(), ResolvePolicy::default());

    let err = dispatcher.refetch("clients").await.unwrap_err();
    assert!(matches!(err, DispatchError::UnknownKey { .. }));

    dispatcher.fetcher().ready("/api/clients", Ok(json!("first")));
    dispatcher.fetcher().ready("/api/clients", Ok(json!("again")));
    dispatcher.dispatch(clients(3)).await.unwrap();
    dispatcher.refetch("clients").await.unwrap();

    assert_eq!(dispatcher.data("clients"), Some(json!("again")));
    assert_eq!(dispatcher.slice().last_request("clients"), Some(&clients(3)));
  }

  #[tokio::test]
  async fn test_mutate_then_refresh() {
    let dispatcher = Dispatcher::new(Scripted::default(), ResolvePolicy::default());
    dispatcher.fetcher().ready("/api/clients", Ok(json!(["a"])));
    dispatcher.dispatch(clients(1)).await.unwrap();

    dispatcher.fetcher().ready("/api/clients", Ok(json!(["a", "b"])));
    let body = json!({ "nom": "b" });
    let response = dispatcher
      .mutate(Method::POST, "/api/clients", Some(&body), &["clients", "unknown"])
      .await
      .unwrap();

    assert_eq!(response, json!({ "success": true }));
    assert_eq!(dispatcher.data("clients"), Some(json!(["a", "b"])));

    let writes = dispatcher.fetcher().writes.lock().unwrap().clone();
    assert_eq!(
      writes,
      vec![(Method::POST, "/api/clients".to_string(), Some(body))]
    );
  }

  #[tokio::test]
  async fn test_keys_do_not_share_status() {
    let dispatcher = Dispatcher::new(Scripted::default(), ResolvePolicy::default());
    let stocks_gate = dispatcher.fetcher().gate("/api/stocks");
    dispatcher.fetcher().ready("/api/clients", Ok(json!([])));

    let stocks = dispatcher.spawn(FetchRequest::new("/api/stocks", "stocks"));
    settle().await;
    dispatcher.dispatch(clients(1)).await.unwrap();

    // The shared flag dropped with clients; stocks is still pending
    assert!(!dispatcher.loading());
    assert!(dispatcher.slice().any_pending());
    assert_eq!(dispatcher.status("stocks"), RequestStatus::Pending);

    stocks_gate.send(Ok(json!([1]))).unwrap();
    stocks.await.unwrap().unwrap();
    assert!(!dispatcher.slice().any_pending());
  }

  #[tokio::test]
  async fn test_typed_read() {
    #[derive(serde::Deserialize)]
    struct Row {
      id: u64,
    }

    let dispatcher = Dispatcher::new(Scripted::default(), ResolvePolicy::default());
    dispatcher
      .fetcher()
      .ready("/api/clients", Ok(json!([{ "id": 9 }])));
    dispatcher.dispatch(clients(1)).await.unwrap();

    let rows: Vec<Row> = dispatcher.get_as("clients").unwrap().unwrap();
    assert_eq!(rows[0].id, 9);
  }
}
