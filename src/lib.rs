//! Session & data synchronization engine for client applications.
//!
//! Inspired by TanStack Query, this crate pairs a cached, deduplicating data
//! layer with an authenticated session and a navigation guard:
//!
//! - [`SyncEngine`]: cache-first queries with stale-while-revalidate,
//!   capped-backoff retries, per-key fetch dedup, and optimistic mutations
//!   with rollback.
//! - [`RequestCache`]: the underlying keyed store, observable per key.
//! - [`SessionStore`]: login/logout/restore state machine with durable
//!   persistence and an expiry timer. Logout and expiry evict user-scoped
//!   cache entries.
//! - [`guard::evaluate`]: pure allow/redirect decision for navigation
//!   targets based on the current session.
//!
//! Transport is injected: queries take a `fetcher`, mutations a `mutator`,
//! and login an `authenticator`, each an async closure returning a typed
//! result. Rendering attaches through per-key cache subscriptions and the
//! session watch channel.
//!
//! # Example
//!
//! ```ignore
//! let engine = SyncEngine::new(EngineConfig::default());
//! let session = SessionStore::new(FileSessionPersist::open("myapp")?);
//! engine.bind_session(&session);
//! session.restore();
//!
//! let user = engine
//!   .query::<User, _, _>("user:1", move || api.fetch_user(1), QueryOptions::default())
//!   .resolved()
//!   .await?;
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod retry;
pub mod session;

pub use cache::{CacheEntry, EntryState, KeyScope, RequestCache, SubscriptionId};
pub use config::{ConfigError, EngineConfig};
pub use engine::{
  MutateOptions, MutationRecord, MutationStatus, QueryOptions, QueryResult, SyncEngine,
};
pub use error::{AuthError, FetchError, MutationError, PersistError};
pub use guard::{AccessRule, Decision, DenyReason, RedirectTarget};
pub use retry::RetryPolicy;
pub use session::{
  AuthGrant, Credentials, FileSessionPersist, MemorySessionPersist, Principal, Session,
  SessionPersist, SessionStatus, SessionStore, StoredSession,
};
