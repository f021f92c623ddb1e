//! Durable session storage.
//!
//! The session is serialized as one fixed JSON record under a single storage
//! location. Readers must treat any failure (missing file, corrupt JSON) as
//! "no session"; that policy lives in `SessionStore::restore`, not here.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::Principal;
use crate::error::PersistError;

/// The durable session record: token, principal, expiry. Nothing else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredSession {
  pub token: String,
  pub principal: Principal,
  pub expires_at: DateTime<Utc>,
}

/// Storage backend for the session record.
pub trait SessionPersist: Send + Sync {
  fn save(&self, session: &StoredSession) -> Result<(), PersistError>;
  fn load(&self) -> Result<Option<StoredSession>, PersistError>;
  fn clear(&self) -> Result<(), PersistError>;
}

impl<P: SessionPersist + ?Sized> SessionPersist for std::sync::Arc<P> {
  fn save(&self, session: &StoredSession) -> Result<(), PersistError> {
    (**self).save(session)
  }

  fn load(&self) -> Result<Option<StoredSession>, PersistError> {
    (**self).load()
  }

  fn clear(&self) -> Result<(), PersistError> {
    (**self).clear()
  }
}

/// File-backed storage under the platform data directory.
pub struct FileSessionPersist {
  path: PathBuf,
}

impl FileSessionPersist {
  /// Store the session under the default location for `app_name`
  /// (`<data_dir>/<app_name>/session.json`).
  pub fn open(app_name: &str) -> Result<Self, PersistError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| PersistError::Malformed("could not determine data directory".to_string()))?;

    Ok(Self::at_path(data_dir.join(app_name).join("session.json")))
  }

  /// Store the session at an explicit path (used by tests).
  pub fn at_path(path: PathBuf) -> Self {
    Self { path }
  }
}

impl SessionPersist for FileSessionPersist {
  fn save(&self, session: &StoredSession) -> Result<(), PersistError> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(session).map_err(|e| PersistError::Malformed(e.to_string()))?;
    std::fs::write(&self.path, json)?;
    Ok(())
  }

  fn load(&self) -> Result<Option<StoredSession>, PersistError> {
    if !self.path.exists() {
      return Ok(None);
    }
    let contents = std::fs::read_to_string(&self.path)?;
    let session =
      serde_json::from_str(&contents).map_err(|e| PersistError::Malformed(e.to_string()))?;
    Ok(Some(session))
  }

  fn clear(&self) -> Result<(), PersistError> {
    if self.path.exists() {
      std::fs::remove_file(&self.path)?;
    }
    Ok(())
  }
}

/// In-memory storage for tests.
#[derive(Default)]
pub struct MemorySessionPersist {
  slot: Mutex<Option<StoredSession>>,
}

impl MemorySessionPersist {
  pub fn new() -> Self {
    Self::default()
  }
}

impl SessionPersist for MemorySessionPersist {
  fn save(&self, session: &StoredSession) -> Result<(), PersistError> {
    *self.slot.lock() = Some(session.clone());
    Ok(())
  }

  fn load(&self) -> Result<Option<StoredSession>, PersistError> {
    Ok(self.slot.lock().clone())
  }

  fn clear(&self) -> Result<(), PersistError> {
    *self.slot.lock() = None;
    Ok(())
  }
}
