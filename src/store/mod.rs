//! Keyed response cache and request dispatcher.
//!
//! Screens dispatch a [`FetchRequest`] naming an item key; the dispatcher
//! performs the fetch and records the payload under that key in the
//! [`Slice`], together with per-key status and the global loading/error
//! flags.

mod dispatcher;
mod slice;
mod state;

pub use dispatcher::{DispatchError, Dispatcher, Fetch};
pub use slice::{Entry, Outcome, Slice, Ticket};
pub use state::{FetchRequest, RequestStatus, ResolvePolicy, StoreEvent};
