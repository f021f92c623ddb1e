//! Session store: owns the state machine, the durable record, and the
//! expiry timer.

use chrono::Utc;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::persist::{SessionPersist, StoredSession};
use super::{AuthGrant, Credentials, Session, SessionStatus};
use crate::error::AuthError;

type EvictHook = Box<dyn Fn() + Send + Sync>;

/// Owner of the authentication session.
///
/// Cheap to clone; all clones share one session. The expiry timer runs on
/// the tokio runtime and performs logout-equivalent cleanup when it fires,
/// including invoking the eviction hook registered with [`on_evict`].
///
/// [`on_evict`]: SessionStore::on_evict
#[derive(Clone)]
pub struct SessionStore {
  inner: Arc<Inner>,
}

struct Inner {
  current: Mutex<Session>,
  persist: Box<dyn SessionPersist>,
  changes: watch::Sender<Session>,
  expiry_task: Mutex<Option<JoinHandle<()>>>,
  evict_hook: Mutex<Option<EvictHook>>,
}

impl SessionStore {
  pub fn new<P: SessionPersist + 'static>(persist: P) -> Self {
    let (changes, _) = watch::channel(Session::anonymous());
    Self {
      inner: Arc::new(Inner {
        current: Mutex::new(Session::anonymous()),
        persist: Box::new(persist),
        changes,
        expiry_task: Mutex::new(None),
        evict_hook: Mutex::new(None),
      }),
    }
  }

  /// Register the cleanup run on logout and expiry. The sync engine hooks in
  /// here to evict user-scoped cache entries.
  pub fn on_evict<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
    *self.inner.evict_hook.lock() = Some(Box::new(hook));
  }

  /// Observe session transitions.
  pub fn subscribe(&self) -> watch::Receiver<Session> {
    self.inner.changes.subscribe()
  }

  /// Validate credentials against the injected remote authenticator.
  ///
  /// Transitions Anonymous → Authenticating → Authenticated on success,
  /// persisting the durable record and arming the expiry timer. On any
  /// failure the status returns to Anonymous.
  pub async fn login<A, Fut>(
    &self,
    credentials: Credentials,
    authenticator: A,
  ) -> Result<Session, AuthError>
  where
    A: FnOnce(Credentials) -> Fut,
    Fut: Future<Output = Result<AuthGrant, AuthError>>,
  {
    self.set_session(Session {
      status: SessionStatus::Authenticating,
      ..Session::anonymous()
    });

    let grant = match authenticator(credentials).await {
      Ok(grant) => grant,
      Err(e) => {
        self.set_session(Session::anonymous());
        return Err(e);
      }
    };

    let now = Utc::now();
    if grant.expires_at <= now {
      self.set_session(Session::anonymous());
      return Err(AuthError::Expired);
    }

    let stored = StoredSession {
      token: grant.token.clone(),
      principal: grant.principal.clone(),
      expires_at: grant.expires_at,
    };
    if let Err(e) = self.inner.persist.save(&stored) {
      warn!("failed to persist session: {}", e);
    }

    let session = Session {
      principal: Some(grant.principal),
      credential_token: Some(grant.token),
      issued_at: Some(now),
      expires_at: Some(grant.expires_at),
      status: SessionStatus::Authenticated,
    };
    self.set_session(session.clone());
    self.arm_expiry(grant.expires_at);
    debug!(expires_at = %grant.expires_at, "session authenticated");

    Ok(session)
  }

  /// Drop the session: clears memory and durable state, disarms the timer,
  /// and runs the eviction hook.
  pub fn logout(&self) {
    self.disarm_expiry();
    if let Err(e) = self.inner.persist.clear() {
      warn!("failed to clear persisted session: {}", e);
    }
    self.set_session(Session::anonymous());
    self.run_evict_hook();
    debug!("session logged out");
  }

  /// Rebuild the session from durable storage at startup.
  ///
  /// Missing, malformed, or expired data resolves to Anonymous; this never
  /// fails. Valid unexpired data resolves to Authenticated with the timer
  /// armed for the remaining lifetime.
  pub fn restore(&self) -> Session {
    let stored = match self.inner.persist.load() {
      Ok(Some(stored)) => stored,
      Ok(None) => {
        self.set_session(Session::anonymous());
        return self.current();
      }
      Err(e) => {
        warn!("ignoring unreadable session record: {}", e);
        self.set_session(Session::anonymous());
        return self.current();
      }
    };

    let now = Utc::now();
    if stored.expires_at <= now {
      debug!("persisted session already expired");
      if let Err(e) = self.inner.persist.clear() {
        warn!("failed to clear expired session: {}", e);
      }
      self.set_session(Session::anonymous());
      return self.current();
    }

    let session = Session {
      principal: Some(stored.principal),
      credential_token: Some(stored.token),
      issued_at: Some(now),
      expires_at: Some(stored.expires_at),
      status: SessionStatus::Authenticated,
    };
    self.set_session(session);
    self.arm_expiry(stored.expires_at);
    self.current()
  }

  /// Snapshot of the current session.
  ///
  /// An Authenticated session whose expiry has passed on the wall clock is
  /// reported as Anonymous even if the timer has not fired yet; the timer
  /// still performs the real cleanup.
  pub fn current(&self) -> Session {
    let session = self.inner.current.lock().clone();
    if session.status == SessionStatus::Authenticated && !session.is_authenticated() {
      return Session::anonymous();
    }
    session
  }

  pub fn is_authenticated(&self) -> bool {
    self.current().is_authenticated()
  }

  fn set_session(&self, session: Session) {
    *self.inner.current.lock() = session.clone();
    self.inner.changes.send_replace(session);
  }

  fn run_evict_hook(&self) {
    if let Some(hook) = self.inner.evict_hook.lock().as_ref() {
      hook();
    }
  }

  fn arm_expiry(&self, expires_at: chrono::DateTime<Utc>) {
    self.disarm_expiry();

    let remaining = (expires_at - Utc::now())
      .to_std()
      .unwrap_or(std::time::Duration::ZERO);
    let inner = Arc::clone(&self.inner);

    let task = tokio::spawn(async move {
      tokio::time::sleep(remaining).await;
      Self::expire(&inner);
    });
    *self.inner.expiry_task.lock() = Some(task);
  }

  fn disarm_expiry(&self) {
    if let Some(task) = self.inner.expiry_task.lock().take() {
      task.abort();
    }
  }

  /// Timer body: Expired is observable for one transition, then collapses
  /// to Anonymous with logout-equivalent cleanup.
  fn expire(inner: &Arc<Inner>) {
    {
      let mut current = inner.current.lock();
      if current.status != SessionStatus::Authenticated {
        return;
      }
      current.status = SessionStatus::Expired;
      inner.changes.send_replace(current.clone());
    }
    debug!("session expired");

    if let Err(e) = inner.persist.clear() {
      warn!("failed to clear expired session: {}", e);
    }

    {
      let mut current = inner.current.lock();
      *current = Session::anonymous();
      inner.changes.send_replace(current.clone());
    }

    if let Some(hook) = inner.evict_hook.lock().as_ref() {
      hook();
    }
  }
}
