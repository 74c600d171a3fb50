use std::future::Future;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ApiConfig;
use crate::event::Event;
use crate::session::SessionStore;
use crate::store::Fetch;

use super::envelope::backend_message;
use super::error::ApiError;
use super::Params;

/// Back-office API client
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: String,
  login_route: String,
  session: Arc<dyn SessionStore>,
  events: Option<mpsc::UnboundedSender<Event>>,
}

impl ApiClient {
  pub fn new(config: &ApiConfig, session: Arc<dyn SessionStore>) -> Result<Self> {
    Self::build(config, reqwest::Client::builder(), session)
  }

  fn build(
    config: &ApiConfig,
    builder: reqwest::ClientBuilder,
    session: Arc<dyn SessionStore>,
  ) -> Result<Self> {
    let http = builder
      .timeout(config.timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url: config.base_url.trim_end_matches('/').to_string(),
      login_route: config.login_route.clone(),
      session,
      events: None,
    })
  }

  /// Send `LoginRequired` to this channel when the backend answers 401.
  pub fn with_events(mut self, tx: mpsc::UnboundedSender<Event>) -> Self {
    self.events = Some(tx);
    self
  }

  /// Absolute URLs pass through, anything else is appended to the base URL.
  fn resolve(&self, path: &str) -> Result<Url, ApiError> {
    let raw = if path.starts_with("http://") || path.starts_with("https://") {
      path.to_string()
    } else {
      format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    };

    Url::parse(&raw).map_err(|source| ApiError::InvalidUrl { url: raw, source })
  }

  /// Perform one request and return the parsed JSON body.
  ///
  /// An empty 2xx body is returned as `Value::Null`.
  pub async fn call(
    &self,
    method: Method,
    path: &str,
    params: Option<&Params>,
    body: Option<&Value>,
  ) -> Result<Value, ApiError> {
    let url = self.resolve(path)?;

    let mut request = self.http.request(method.clone(), url);
    if let Some(params) = params {
      request = request.query(&query_pairs(params));
    }
    if let Some(token) = self.session.token() {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    debug!(%method, path, "api request");

    let response = request.send().await.map_err(|source| ApiError::Transport {
      path: path.to_string(),
      source,
    })?;
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED {
      self.expire_session(path);
      return Err(ApiError::Unauthorized {
        path: path.to_string(),
      });
    }

    let bytes = response.bytes().await.map_err(|source| ApiError::Transport {
      path: path.to_string(),
      source,
    })?;

    if !status.is_success() {
      let message = backend_message(&bytes)
        .or_else(|| status.canonical_reason().map(String::from))
        .unwrap_or_else(|| status.to_string());
      return Err(ApiError::Status {
        method,
        path: path.to_string(),
        status,
        message,
      });
    }

    if bytes.iter().all(u8::is_ascii_whitespace) {
      return Ok(Value::Null);
    }

    serde_json::from_slice(&bytes).map_err(|source| ApiError::Decode {
      path: path.to_string(),
      source,
    })
  }

  /// Tear down the local session and announce the login route.
  fn expire_session(&self, path: &str) {
    info!(path, route = %self.login_route, "session expired, login required");

    if let Err(e) = self.session.clear() {
      warn!("Failed to clear session token: {}", e);
    }

    if let Some(tx) = &self.events {
      let _ = tx.send(Event::LoginRequired {
        route: self.login_route.clone(),
      });
    }
  }

  pub async fn get(&self, path: &str, params: &Params) -> Result<Value, ApiError> {
    self.call(Method::GET, path, Some(params), None).await
  }

  /// GET and deserialize into a typed payload.
  pub async fn get_as<T: DeserializeOwned>(&self, path: &str, params: &Params) -> Result<T, ApiError> {
    let value = self.get(path, params).await?;
    serde_json::from_value(value).map_err(|source| ApiError::Decode {
      path: path.to_string(),
      source,
    })
  }

  pub async fn post(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
    self.call(Method::POST, path, None, Some(body)).await
  }

  pub async fn put(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
    self.call(Method::PUT, path, None, Some(body)).await
  }

  pub async fn patch(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
    self.call(Method::PATCH, path, None, Some(body)).await
  }

  pub async fn delete(&self, path: &str) -> Result<Value, ApiError> {
    self.call(Method::DELETE, path, None, None).await
  }
}

impl Fetch for ApiClient {
  fn request(
    &self,
    method: Method,
    path: &str,
    params: Option<&Params>,
    body: Option<&Value>,
  ) -> impl Future<Output = Result<Value, ApiError>> + Send {
    self.call(method, path, params, body)
  }
}

/// Flatten params into query pairs. Arrays repeat the key as `key[]`.
fn query_pairs(params: &Params) -> Vec<(String, String)> {
  let mut pairs = Vec::with_capacity(params.len());

  for (key, value) in params {
    match value {
      Value::Null => {}
      Value::Array(items) => {
        let key = format!("{}[]", key);
        pairs.extend(
          items
            .iter()
            .filter_map(scalar_to_string)
            .map(|v| (key.clone(), v)),
        );
      }
      other => {
        if let Some(v) = scalar_to_string(other) {
          pairs.push((key.clone(), v));
        }
      }
    }
  }

  pairs
}

fn scalar_to_string(value: &Value) -> Option<String> {
  match value {
    Value::Null => None,
    Value::String(s) => Some(s.clone()),
    Value::Bool(b) => Some(b.to_string()),
    Value::Number(n) => Some(n.to_string()),
    other => Some(other.to_string()),
  }
}
