//! Authentication session: state machine, durable persistence, expiry.

mod persist;
mod store;

pub use persist::{FileSessionPersist, MemorySessionPersist, SessionPersist, StoredSession};
pub use store::SessionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The authenticated identity and its granted capabilities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
  pub id: String,
  pub display_name: Option<String>,
  #[serde(default)]
  pub capabilities: BTreeSet<String>,
}

/// Position in the session state machine.
///
/// Anonymous → Authenticating → {Authenticated, Anonymous};
/// Authenticated → Expired → Anonymous; Authenticated → Anonymous (logout).
/// Expired is transient and always collapses to Anonymous.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionStatus {
  #[default]
  Anonymous,
  Authenticating,
  Authenticated,
  Expired,
}

/// Snapshot of the client's current authentication state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
  pub principal: Option<Principal>,
  pub credential_token: Option<String>,
  pub issued_at: Option<DateTime<Utc>>,
  pub expires_at: Option<DateTime<Utc>>,
  pub status: SessionStatus,
}

impl Session {
  pub fn anonymous() -> Self {
    Self::default()
  }

  /// Authenticated status also requires a token and an unexpired grant.
  pub fn is_authenticated(&self) -> bool {
    self.status == SessionStatus::Authenticated
      && self.credential_token.is_some()
      && self.expires_at.is_some_and(|at| Utc::now() < at)
  }
}

/// Credentials handed to the injected remote validator.
#[derive(Debug, Clone)]
pub struct Credentials {
  pub username: String,
  pub secret: String,
}

/// Successful outcome of remote credential validation.
#[derive(Debug, Clone)]
pub struct AuthGrant {
  pub principal: Principal,
  pub token: String,
  pub expires_at: DateTime<Utc>,
}
