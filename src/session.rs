//! Bearer token persistence.
//!
//! The token is the only client-side state that survives a restart. The API
//! client reads it for every request and clears it when the backend answers
//! 401.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Storage for the session token.
pub trait SessionStore: Send + Sync {
  /// Current token, if logged in.
  fn token(&self) -> Option<String>;

  /// Replace the stored token.
  fn set_token(&self, token: &str) -> Result<()>;

  /// Forget the token (logout or expired session).
  fn clear(&self) -> Result<()>;
}

/// Token kept in a single file under the data directory.
pub struct FileSession {
  path: PathBuf,
}

impl FileSession {
  /// Open the token file at the default location.
  pub fn open() -> Result<Self> {
    Ok(Self::at(crate::config::data_dir()?.join("token")))
  }

  /// Use an explicit token file path.
  pub fn at(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl SessionStore for FileSession {
  fn token(&self) -> Option<String> {
    std::fs::read_to_string(&self.path)
      .ok()
      .map(|s| s.trim().to_string())
      .filter(|s| !s.is_empty())
  }

  fn set_token(&self, token: &str) -> Result<()> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create session directory: {}", e))?;
    }

    std::fs::write(&self.path, token.trim())
      .map_err(|e| eyre!("Failed to write token to {}: {}", self.path.display(), e))
  }

  fn clear(&self) -> Result<()> {
    match std::fs::remove_file(&self.path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(eyre!(
        "Failed to remove token file {}: {}",
        self.path.display(),
        e
      )),
    }
  }
}

/// In-memory token, for tests and for tokens passed through the environment.
#[derive(Default)]
pub struct MemorySession {
  token: Mutex<Option<String>>,
}

impl MemorySession {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_token(token: impl Into<String>) -> Self {
    Self {
      token: Mutex::new(Some(token.into())),
    }
  }
}

impl SessionStore for MemorySession {
  fn token(&self) -> Option<String> {
    self
      .token
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  fn set_token(&self, token: &str) -> Result<()> {
    *self.token.lock().map_err(|e| eyre!("Lock poisoned: {}", e))? = Some(token.to_string());
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    *self.token.lock().map_err(|e| eyre!("Lock poisoned: {}", e))? = None;
    Ok(())
  }
}
