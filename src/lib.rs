//! Data layer for the storedesk back-office dashboard.
//!
//! `api` talks to the REST backend, `store` keeps the keyed response cache
//! and request state that screens read from, `session` persists the bearer
//! token between runs.

pub mod api;
pub mod config;
pub mod event;
pub mod session;
pub mod store;
