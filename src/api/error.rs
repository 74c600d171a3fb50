use reqwest::StatusCode;
use thiserror::Error;

/// Failure of a single backend call.
#[derive(Debug, Error)]
pub enum ApiError {
  /// 401 from the backend; the session has already been torn down
  #[error("session expired while requesting {path}")]
  Unauthorized { path: String },

  #[error("{method} {path} failed with {status}: {message}")]
  Status {
    method: reqwest::Method,
    path: String,
    status: StatusCode,
    message: String,
  },

  #[error("request to {path} failed: {source}")]
  Transport {
    path: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("invalid response from {path}: {source}")]
  Decode {
    path: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("invalid request URL '{url}': {source}")]
  InvalidUrl {
    url: String,
    #[source]
    source: url::ParseError,
  },
}

impl ApiError {
  /// HTTP status carried by the error, if the backend answered at all.
  pub fn status(&self) -> Option<StatusCode> {
    match self {
      Self::Unauthorized { .. } => Some(StatusCode::UNAUTHORIZED),
      Self::Status { status, .. } => Some(*status),
      Self::Transport { source, .. } => source.status(),
      Self::Decode { .. } | Self::InvalidUrl { .. } => None,
    }
  }

  pub fn is_unauthorized(&self) -> bool {
    matches!(self, Self::Unauthorized { .. })
  }
}
