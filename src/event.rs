use tokio::sync::{broadcast, mpsc};

use crate::store::StoreEvent;

/// Application events
#[derive(Debug, Clone)]
pub enum Event {
  /// The backend answered 401; the session token has been cleared
  LoginRequired { route: String },
  /// Request lifecycle notification from the dispatcher
  Store(StoreEvent),
}

/// Collects events produced by the API client and the dispatcher
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Sender handed to producers (the API client, forwarding tasks)
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Forward dispatcher notifications into this handler.
  ///
  /// The forwarding task ends when the dispatcher is dropped or this handler is.
  pub fn forward_store(&self, mut store_rx: broadcast::Receiver<StoreEvent>) {
    let tx = self.tx.clone();

    tokio::spawn(async move {
      loop {
        match store_rx.recv().await {
          Ok(event) => {
            if tx.send(Event::Store(event)).is_err() {
              break;
            }
          }
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "store event forwarder lagged");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }

  /// Receive an already queued event without waiting
  pub fn try_next(&mut self) -> Option<Event> {
    self.rx.try_recv().ok()
  }
}
