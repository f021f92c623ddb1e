//! Sync engine: fetch orchestration and optimistic mutation on top of the
//! request cache.
//!
//! The engine is the cache's only writer. Queries are cache-first: fresh
//! entries are served without a network call, stale entries are served
//! immediately while one background refresh runs, and concurrent callers for
//! the same key attach to a single in-flight fetch. Failed fetches are
//! retried with capped exponential backoff; an exhausted fetch caches its
//! error so callers don't hammer a failing endpoint.
//!
//! Mutations write an optimistic value into the cache before the remote
//! write resolves, and roll back to the pre-mutation snapshot on failure.
//! Mutations on the same key are strictly serialized in issue order.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{EntryState, KeyScope, RequestCache};
use crate::config::EngineConfig;
use crate::error::{FetchError, MutationError};
use crate::retry::RetryPolicy;
use crate::session::SessionStore;

type FetchOutcome = Result<Value, FetchError>;
type StoredFetcher = Arc<dyn Fn() -> BoxFuture<'static, FetchOutcome> + Send + Sync>;

/// Per-query overrides; unset fields fall back to the engine config.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
  pub stale_after: Option<chrono::Duration>,
  pub retry: Option<RetryPolicy>,
  pub timeout: Option<std::time::Duration>,
  pub scope: KeyScope,
}

/// Options for a mutation.
#[derive(Debug, Clone, Default)]
pub struct MutateOptions {
  /// Keys whose cached data depends on this mutation; they are invalidated
  /// after a successful commit.
  pub invalidates: Vec<String>,
  /// Scope override. When unset the entry keeps its current scope, so a
  /// mutation never strips the user tag off a user-scoped key.
  pub scope: Option<KeyScope>,
  pub timeout: Option<std::time::Duration>,
}

#[derive(Clone)]
struct ResolvedOptions {
  stale_after: chrono::Duration,
  retry: RetryPolicy,
  timeout: Option<std::time::Duration>,
  scope: KeyScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  Pending,
  Committed,
  RolledBack,
}

/// Bookkeeping for one mutation attempt. Exists only while the attempt runs.
#[derive(Debug, Clone)]
pub struct MutationRecord {
  pub id: u64,
  pub target_key: String,
  pub optimistic_value: Value,
  pub previous_value: Option<Value>,
  pub status: MutationStatus,
}

struct InFlight {
  tx: broadcast::Sender<FetchOutcome>,
  task: JoinHandle<()>,
}

/// What `query` hands back synchronously.
///
/// `value` is whatever the cache could serve immediately, fresh or stale;
/// `resolved()` awaits the terminal outcome of any in-flight fetch.
pub struct QueryResult<T> {
  pub value: Option<T>,
  /// Entry state observed at call time.
  pub state: EntryState,
  /// True when a stale value was served and a refresh runs in the background.
  pub revalidating: bool,
  /// The cached error, when the entry is in the `Error` state.
  pub error: Option<FetchError>,
  resolution: Resolution,
}

enum Resolution {
  /// Terminal at call time: fresh hit or cached error.
  Settled,
  /// Attached to the in-flight fetch for this key.
  Pending(broadcast::Receiver<FetchOutcome>),
}

impl<T: DeserializeOwned> QueryResult<T> {
  /// Wait for the fetch this query is attached to, or return the settled
  /// outcome. Cancellation of the underlying fetch yields
  /// [`FetchError::Aborted`].
  pub async fn resolved(self) -> Result<T, FetchError> {
    match self.resolution {
      Resolution::Pending(mut rx) => match rx.recv().await {
        Ok(Ok(value)) => decode(value),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(FetchError::Aborted),
      },
      Resolution::Settled => {
        if self.state == EntryState::Error {
          Err(self.error.unwrap_or(FetchError::Aborted))
        } else {
          self.value.ok_or(FetchError::Aborted)
        }
      }
    }
  }

  /// Whether anything is still in flight for this query.
  pub fn is_settled(&self) -> bool {
    matches!(self.resolution, Resolution::Settled)
  }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, FetchError> {
  serde_json::from_value(value).map_err(|e| FetchError::Decode(e.to_string()))
}

struct EngineInner {
  cache: RequestCache,
  config: EngineConfig,
  inflight: Mutex<HashMap<String, InFlight>>,
  /// Last fetcher seen per key, so invalidation can refetch for subscribers.
  fetchers: Mutex<HashMap<String, (StoredFetcher, ResolvedOptions)>>,
  mutation_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
  mutations: Mutex<HashMap<String, MutationRecord>>,
  next_mutation: AtomicU64,
}

/// Orchestrates fetching and mutation over the request cache.
///
/// Cheap to clone; all clones share state. Requires a tokio runtime.
#[derive(Clone)]
pub struct SyncEngine {
  inner: Arc<EngineInner>,
}

impl SyncEngine {
  pub fn new(config: EngineConfig) -> Self {
    Self {
      inner: Arc::new(EngineInner {
        cache: RequestCache::new(),
        config,
        inflight: Mutex::new(HashMap::new()),
        fetchers: Mutex::new(HashMap::new()),
        mutation_locks: Mutex::new(HashMap::new()),
        mutations: Mutex::new(HashMap::new()),
        next_mutation: AtomicU64::new(0),
      }),
    }
  }

  /// The underlying cache, for reads and subscriptions.
  pub fn cache(&self) -> &RequestCache {
    &self.inner.cache
  }

  /// Wire this engine's user-scoped eviction to a session store's logout
  /// and expiry cleanup.
  pub fn bind_session(&self, store: &SessionStore) {
    let engine = self.clone();
    store.on_evict(move || engine.evict_user_scoped());
  }

  /// Cache-first read of `key`.
  ///
  /// Fresh entries are returned without invoking `fetcher`. Missing, stale,
  /// or aged-out-error entries start (or attach to) one fetch, run under the
  /// retry policy; at most one fetch is in flight per key no matter how many
  /// callers ask. A still-fresh cached error is returned as-is so a failing
  /// endpoint isn't hammered until an invalidation or TTL elapse.
  pub fn query<T, F, Fut>(&self, key: &str, fetcher: F, options: QueryOptions) -> QueryResult<T>
  where
    T: Serialize + DeserializeOwned,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let resolved = self.resolve(options);
    let stored: StoredFetcher = Arc::new(move || {
      let fut = fetcher();
      async move {
        let value = fut.await?;
        serde_json::to_value(value).map_err(|e| FetchError::Decode(e.to_string()))
      }
      .boxed()
    });
    self
      .inner
      .fetchers
      .lock()
      .insert(key.to_string(), (stored.clone(), resolved.clone()));

    let entry = self.inner.cache.get(key);
    let now = Utc::now();
    let state = entry
      .as_ref()
      .map(|e| e.effective_state(now))
      .unwrap_or(EntryState::Empty);
    let current: Option<T> = entry
      .as_ref()
      .and_then(|e| e.value.clone())
      .and_then(|v| serde_json::from_value(v).ok());

    match state {
      EntryState::Fresh => QueryResult {
        value: current,
        state,
        revalidating: false,
        error: None,
        resolution: Resolution::Settled,
      },
      EntryState::Error if entry.as_ref().is_some_and(|e| !e.is_stale(now)) => QueryResult {
        value: current,
        state,
        revalidating: false,
        error: entry.and_then(|e| e.error),
        resolution: Resolution::Settled,
      },
      _ => {
        let rx = self.spawn_fetch(key, stored, resolved);
        let has_value = current.is_some();
        QueryResult {
          value: current,
          state: if has_value { state } else { EntryState::Loading },
          revalidating: has_value,
          error: None,
          resolution: Resolution::Pending(rx),
        }
      }
    }
  }

  /// Optimistically mutate `key`.
  ///
  /// The optimistic value is visible to subscribers before `mutator` (the
  /// remote write) runs. On success the value returned by the mutator is
  /// committed and dependent keys are invalidated; on failure the entry is
  /// rolled back to its pre-mutation snapshot and the error surfaced.
  /// Mutations on one key are applied strictly in issue order; conflict and
  /// validation failures are never auto-retried.
  pub async fn mutate<T, M, Fut>(
    &self,
    key: &str,
    optimistic: T,
    mutator: M,
    options: MutateOptions,
  ) -> Result<T, MutationError>
  where
    T: Serialize,
    M: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, MutationError>>,
  {
    let lock = {
      let mut locks = self.inner.mutation_locks.lock();
      Arc::clone(
        locks
          .entry(key.to_string())
          .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
      )
    };
    // Fair FIFO acquisition is what serializes same-key mutations
    let _guard = lock.lock().await;

    let optimistic_value = serde_json::to_value(&optimistic)
      .map_err(|e| MutationError::ValidationFailed(e.to_string()))?;

    // A racing fetch must not overwrite the optimistic value with older
    // server data
    self.cancel(key);

    let snapshot = self.inner.cache.get(key);
    let previous_value = snapshot.as_ref().and_then(|e| e.value.clone());
    let stale_after = snapshot
      .as_ref()
      .map(|e| e.stale_after)
      .unwrap_or_else(|| self.inner.config.stale_after());
    let scope = options
      .scope
      .unwrap_or_else(|| snapshot.as_ref().map(|e| e.scope).unwrap_or_default());

    let id = self.inner.next_mutation.fetch_add(1, Ordering::Relaxed);
    self.inner.mutations.lock().insert(
      key.to_string(),
      MutationRecord {
        id,
        target_key: key.to_string(),
        optimistic_value: optimistic_value.clone(),
        previous_value,
        status: MutationStatus::Pending,
      },
    );
    self
      .inner
      .cache
      .put(key, optimistic_value, stale_after, scope);

    let outcome = match options.timeout {
      Some(limit) => match tokio::time::timeout(limit, mutator()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(MutationError::Network("mutation timed out".to_string())),
      },
      None => mutator().await,
    };

    match outcome {
      Ok(committed) => {
        let committed_value = match serde_json::to_value(&committed) {
          Ok(v) => v,
          Err(e) => {
            self.rollback(key, snapshot);
            return Err(MutationError::ValidationFailed(e.to_string()));
          }
        };
        self
          .inner
          .cache
          .put(key, committed_value, stale_after, scope);
        self.inner.mutations.lock().remove(key);
        for dependent in &options.invalidates {
          self.invalidate(dependent);
        }
        debug!(key, "mutation committed");
        Ok(committed)
      }
      Err(e) => {
        self.rollback(key, snapshot);
        warn!(key, error = %e, "mutation rolled back");
        Err(e)
      }
    }
  }

  fn rollback(&self, key: &str, snapshot: Option<crate::cache::CacheEntry>) {
    if let Some(record) = self.inner.mutations.lock().get_mut(key) {
      record.status = MutationStatus::RolledBack;
    }
    self.inner.cache.restore(key, snapshot);
    self.inner.mutations.lock().remove(key);
  }

  /// The `Pending` mutation record for `key`, if one is in progress.
  pub fn pending_mutation(&self, key: &str) -> Option<MutationRecord> {
    self.inner.mutations.lock().get(key).cloned()
  }

  /// Abort the in-flight fetch for `key`, if any. The entry reverts to its
  /// last stable state; attached callers observe [`FetchError::Aborted`].
  pub fn cancel(&self, key: &str) {
    let removed = self.inner.inflight.lock().remove(key);
    if let Some(inflight) = removed {
      inflight.task.abort();
      self.inner.cache.revert_loading(key);
      debug!(key, "cancelled in-flight fetch");
    }
  }

  /// Force `key` stale; if it has subscribers and a known fetcher, a
  /// background refetch starts immediately. Idempotent.
  pub fn invalidate(&self, key: &str) {
    if !self.inner.cache.invalidate(key) {
      return;
    }
    self.maybe_refetch(key);
  }

  /// Invalidate every cached key matching the predicate.
  pub fn invalidate_where<P: Fn(&str) -> bool>(&self, predicate: P) {
    for key in self.inner.cache.invalidate_where(&predicate) {
      self.maybe_refetch(&key);
    }
  }

  /// Refetch an invalidated key in the background, but only when someone is
  /// watching it and a fetcher has been seen for it.
  fn maybe_refetch(&self, key: &str) {
    if self.inner.cache.subscriber_count(key) == 0 {
      return;
    }
    let registered = self.inner.fetchers.lock().get(key).cloned();
    if let Some((fetcher, options)) = registered {
      let _ = self.spawn_fetch(key, fetcher, options);
    }
  }

  /// Drop all user-scoped entries and their fetchers; in-flight fetches for
  /// those keys are aborted. Runs on logout and session expiry.
  pub fn evict_user_scoped(&self) {
    let evicted = self.inner.cache.evict_user_scoped();
    if evicted.is_empty() {
      return;
    }
    {
      let mut fetchers = self.inner.fetchers.lock();
      let mut inflight = self.inner.inflight.lock();
      for key in &evicted {
        fetchers.remove(key);
        if let Some(inflight) = inflight.remove(key) {
          inflight.task.abort();
        }
      }
    }
    debug!(count = evicted.len(), "evicted user-scoped cache entries");
  }

  /// Collect unsubscribed entries older than the configured max age, along
  /// with their registered fetchers and idle mutation locks.
  pub fn gc(&self) -> usize {
    let removed = self.inner.cache.gc(self.inner.config.gc_max_age());
    if removed.is_empty() {
      return 0;
    }
    {
      let mut fetchers = self.inner.fetchers.lock();
      let mut locks = self.inner.mutation_locks.lock();
      for key in &removed {
        fetchers.remove(key);
        // A lock with an outstanding Arc belongs to a mutation in progress
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
          locks.remove(key);
        }
      }
    }
    debug!(count = removed.len(), "garbage-collected cache entries");
    removed.len()
  }

  /// Drop everything: cache, in-flight fetches, registered fetchers, and
  /// mutation bookkeeping. Test-isolation hook.
  pub fn reset(&self) {
    {
      let mut inflight = self.inner.inflight.lock();
      for (_, inflight) in inflight.drain() {
        inflight.task.abort();
      }
    }
    self.inner.fetchers.lock().clear();
    self.inner.mutations.lock().clear();
    self.inner.mutation_locks.lock().clear();
    self.inner.cache.clear();
  }

  fn resolve(&self, options: QueryOptions) -> ResolvedOptions {
    let config = &self.inner.config;
    ResolvedOptions {
      stale_after: options.stale_after.unwrap_or_else(|| config.stale_after()),
      retry: options.retry.unwrap_or(config.retry),
      timeout: options.timeout.or_else(|| config.timeout()),
      scope: options.scope,
    }
  }

  /// Start a fetch for `key`, or attach to the one already in flight.
  fn spawn_fetch(
    &self,
    key: &str,
    fetcher: StoredFetcher,
    options: ResolvedOptions,
  ) -> broadcast::Receiver<FetchOutcome> {
    let mut inflight = self.inner.inflight.lock();
    if let Some(existing) = inflight.get(key) {
      // Dedup: at most one fetch per key, regardless of caller count
      return existing.tx.subscribe();
    }

    self
      .inner
      .cache
      .mark_loading(key, options.stale_after, options.scope);
    let (tx, rx) = broadcast::channel(1);
    let task = tokio::spawn(run_fetch(
      Arc::clone(&self.inner),
      key.to_string(),
      fetcher,
      options,
      tx.clone(),
    ));
    inflight.insert(key.to_string(), InFlight { tx, task });
    rx
  }
}

impl Default for SyncEngine {
  fn default() -> Self {
    Self::new(EngineConfig::default())
  }
}

/// Fetch task body: attempts under the retry policy, then writes the
/// terminal outcome into the cache and fans it out to attached callers.
async fn run_fetch(
  inner: Arc<EngineInner>,
  key: String,
  fetcher: StoredFetcher,
  options: ResolvedOptions,
  tx: broadcast::Sender<FetchOutcome>,
) {
  let policy = options.retry;
  let attempts = policy.max_attempts.max(1);
  let mut last_error = FetchError::Aborted;

  for attempt in 0..attempts {
    if attempt > 0 {
      tokio::time::sleep(policy.delay_for(attempt - 1)).await;
    }

    let outcome = match options.timeout {
      Some(limit) => match tokio::time::timeout(limit, fetcher()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(FetchError::Timeout),
      },
      None => fetcher().await,
    };

    match outcome {
      Ok(value) => {
        inner
          .cache
          .put(&key, value.clone(), options.stale_after, options.scope);
        inner.inflight.lock().remove(&key);
        let _ = tx.send(Ok(value));
        return;
      }
      Err(e) if e.is_retryable() && attempt + 1 < attempts => {
        warn!(%key, attempt, error = %e, "fetch attempt failed, retrying");
        last_error = e;
      }
      Err(e) => {
        last_error = e;
        break;
      }
    }
  }

  warn!(%key, error = %last_error, "fetch failed, caching error");
  inner.cache.set_error(&key, last_error.clone());
  inner.inflight.lock().remove(&key);
  let _ = tx.send(Err(last_error));
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::session::{AuthGrant, Credentials, MemorySessionPersist, Principal};
  use std::collections::BTreeSet;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  fn engine() -> SyncEngine {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
    SyncEngine::new(EngineConfig {
      retry: RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 10,
        max_delay_ms: 50,
      },
      ..EngineConfig::default()
    })
  }

  fn counted_fetcher(
    calls: &Arc<AtomicU32>,
    fail_first: u32,
  ) -> impl Fn() -> BoxFuture<'static, Result<String, FetchError>> + Send + Sync + 'static {
    let calls = calls.clone();
    move || {
      let n = calls.fetch_add(1, Ordering::SeqCst);
      async move {
        if n < fail_first {
          Err(FetchError::Network("connection reset".to_string()))
        } else {
          Ok(format!("result-{}", n))
        }
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_fetch_retries_until_success() {
    // Fails twice, succeeds on the third attempt
    let calls = Arc::new(AtomicU32::new(0));
    let engine = engine();

    let value = engine
      .query::<String, _, _>("user:1", counted_fetcher(&calls, 2), QueryOptions::default())
      .resolved()
      .await
      .unwrap();

    assert_eq!(value, "result-2");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let entry = engine.cache().get("user:1").unwrap();
    assert_eq!(entry.effective_state(Utc::now()), EntryState::Fresh);
  }

  #[tokio::test]
  async fn test_concurrent_queries_share_one_fetch() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();
    let engine = engine();

    let slow_fetcher = move || {
      let calls = calls_clone.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, FetchError>("shared".to_string())
      }
    };

    let first = engine.query::<String, _, _>("user:1", slow_fetcher.clone(), QueryOptions::default());
    let second = engine.query::<String, _, _>("user:1", slow_fetcher, QueryOptions::default());

    let (a, b) = tokio::join!(first.resolved(), second.resolved());
    assert_eq!(a.unwrap(), "shared");
    assert_eq!(b.unwrap(), "shared");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_fresh_hit_skips_the_network() {
    let calls = Arc::new(AtomicU32::new(0));
    let engine = engine();

    engine
      .query::<String, _, _>("k", counted_fetcher(&calls, 0), QueryOptions::default())
      .resolved()
      .await
      .unwrap();

    let hit = engine.query::<String, _, _>("k", counted_fetcher(&calls, 0), QueryOptions::default());
    assert!(hit.is_settled());
    assert_eq!(hit.state, EntryState::Fresh);
    assert_eq!(hit.value, Some("result-0".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stale_value_served_while_revalidating() {
    let calls = Arc::new(AtomicU32::new(0));
    let engine = engine();
    let options = QueryOptions {
      stale_after: Some(chrono::Duration::zero()),
      ..QueryOptions::default()
    };

    engine
      .query::<String, _, _>("k", counted_fetcher(&calls, 0), options.clone())
      .resolved()
      .await
      .unwrap();

    let stale = engine.query::<String, _, _>("k", counted_fetcher(&calls, 0), options);
    assert_eq!(stale.state, EntryState::Stale);
    assert!(stale.revalidating);
    assert_eq!(stale.value, Some("result-0".to_string()));

    let refreshed = stale.resolved().await.unwrap();
    assert_eq!(refreshed, "result-1");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_exhausted_retries_cache_the_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let engine = engine();

    let result = engine
      .query::<String, _, _>("k", counted_fetcher(&calls, 99), QueryOptions::default())
      .resolved()
      .await;
    assert!(matches!(result, Err(FetchError::Network(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // The cached error is served without touching the fetcher again
    let again = engine.query::<String, _, _>("k", counted_fetcher(&calls, 99), QueryOptions::default());
    assert!(again.is_settled());
    assert_eq!(again.state, EntryState::Error);
    assert!(matches!(again.resolved().await, Err(FetchError::Network(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Invalidation clears the error and allows a refetch
    engine.invalidate("k");
    let result = engine
      .query::<String, _, _>("k", counted_fetcher(&calls, 0), QueryOptions::default())
      .resolved()
      .await;
    assert!(result.is_ok());
  }

  #[tokio::test]
  async fn test_non_retryable_error_fails_fast() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();
    let engine = engine();

    let result = engine
      .query::<String, _, _>(
        "k",
        move || {
          calls_clone.fetch_add(1, Ordering::SeqCst);
          async {
            Err::<String, _>(FetchError::Server {
              code: 404,
              message: "not found".to_string(),
            })
          }
        },
        QueryOptions::default(),
      )
      .resolved()
      .await;

    assert!(matches!(result, Err(FetchError::Server { code: 404, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_timeout_counts_as_retryable_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();
    let engine = engine();
    let options = QueryOptions {
      timeout: Some(Duration::from_millis(20)),
      retry: Some(RetryPolicy {
        max_attempts: 2,
        base_delay_ms: 5,
        max_delay_ms: 10,
      }),
      ..QueryOptions::default()
    };

    let result = engine
      .query::<String, _, _>(
        "k",
        move || {
          let n = calls_clone.fetch_add(1, Ordering::SeqCst);
          async move {
            if n == 0 {
              // First attempt hangs past the timeout
              tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok("late".to_string())
          }
        },
        options,
      )
      .resolved()
      .await;

    assert_eq!(result.unwrap(), "late");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_cancel_reverts_and_aborts_callers() {
    let engine = engine();
    let pending = engine.query::<String, _, _>(
      "k",
      || async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok("never".to_string())
      },
      QueryOptions::default(),
    );

    engine.cancel("k");
    assert!(matches!(pending.resolved().await, Err(FetchError::Aborted)));
    let entry = engine.cache().get("k").unwrap();
    assert_eq!(entry.state, EntryState::Empty);
  }

  #[tokio::test]
  async fn test_invalidate_refetches_for_subscribers() {
    let calls = Arc::new(AtomicU32::new(0));
    let engine = engine();

    engine
      .query::<String, _, _>("k", counted_fetcher(&calls, 0), QueryOptions::default())
      .resolved()
      .await
      .unwrap();
    engine.cache().subscribe("k", |_, _| {});

    engine.invalidate("k");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let entry = engine.cache().get("k").unwrap();
    assert_eq!(entry.effective_state(Utc::now()), EntryState::Fresh);
  }

  #[tokio::test]
  async fn test_invalidate_without_subscribers_stays_stale() {
    let calls = Arc::new(AtomicU32::new(0));
    let engine = engine();

    engine
      .query::<String, _, _>("k", counted_fetcher(&calls, 0), QueryOptions::default())
      .resolved()
      .await
      .unwrap();

    engine.invalidate("k");
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.cache().get("k").unwrap().state, EntryState::Stale);
  }

  #[tokio::test]
  async fn test_mutation_commit_and_dependent_invalidation() {
    let engine = engine();
    engine.cache().put(
      "todo:5",
      serde_json::json!({"done": false}),
      chrono::Duration::seconds(60),
      KeyScope::Shared,
    );
    engine.cache().put(
      "todos",
      serde_json::json!([{"id": 5}]),
      chrono::Duration::seconds(60),
      KeyScope::Shared,
    );

    let committed = engine
      .mutate(
        "todo:5",
        serde_json::json!({"done": true}),
        || async { Ok(serde_json::json!({"done": true, "version": 2})) },
        MutateOptions {
          invalidates: vec!["todos".to_string()],
          ..MutateOptions::default()
        },
      )
      .await
      .unwrap();

    assert_eq!(committed["version"], 2);
    let entry = engine.cache().get("todo:5").unwrap();
    assert_eq!(entry.value.unwrap()["version"], 2);
    assert_eq!(engine.cache().get("todos").unwrap().state, EntryState::Stale);
    assert!(engine.pending_mutation("todo:5").is_none());
  }

  #[tokio::test]
  async fn test_mutation_rollback_restores_previous_value() {
    let engine = engine();
    engine.cache().put(
      "todo:5",
      serde_json::json!({"done": false}),
      chrono::Duration::seconds(60),
      KeyScope::Shared,
    );

    let result = engine
      .mutate(
        "todo:5",
        serde_json::json!({"done": true}),
        || async { Err::<Value, _>(MutationError::Conflict("version mismatch".to_string())) },
        MutateOptions::default(),
      )
      .await;

    assert!(matches!(result, Err(MutationError::Conflict(_))));
    let entry = engine.cache().get("todo:5").unwrap();
    assert_eq!(entry.value.unwrap()["done"], false);
    assert!(engine.pending_mutation("todo:5").is_none());
  }

  #[tokio::test]
  async fn test_optimistic_value_visible_before_commit() {
    let engine = engine();
    let observed = Arc::new(Mutex::new(Vec::new()));
    let observed_clone = observed.clone();
    engine.cache().subscribe("todo:5", move |_, entry| {
      if let Some(value) = &entry.value {
        observed_clone.lock().push(value["done"].clone());
      }
    });

    engine
      .mutate(
        "todo:5",
        serde_json::json!({"done": true}),
        || async {
          tokio::time::sleep(Duration::from_millis(20)).await;
          Ok(serde_json::json!({"done": true}))
        },
        MutateOptions::default(),
      )
      .await
      .unwrap();

    // Optimistic write first, commit second
    let observed = observed.lock();
    assert!(observed.len() >= 2);
    assert_eq!(observed[0], Value::from(true));
  }

  #[tokio::test]
  async fn test_same_key_mutations_apply_in_issue_order() {
    let engine = engine();
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = {
      let order = order.clone();
      engine.mutate(
        "k",
        Value::from(1),
        move || async move {
          // Slow first mutation must still commit before the second
          tokio::time::sleep(Duration::from_millis(50)).await;
          order.lock().push(1);
          Ok(Value::from(1))
        },
        MutateOptions::default(),
      )
    };
    let second = {
      let order = order.clone();
      engine.mutate(
        "k",
        Value::from(2),
        move || async move {
          order.lock().push(2);
          Ok(Value::from(2))
        },
        MutateOptions::default(),
      )
    };

    let (a, b) = tokio::join!(first, second);
    a.unwrap();
    b.unwrap();

    assert_eq!(*order.lock(), vec![1, 2]);
    // Last issued mutation wins
    assert_eq!(engine.cache().get("k").unwrap().value, Some(Value::from(2)));
  }

  #[tokio::test]
  async fn test_mutation_keeps_user_scope() {
    let engine = engine();
    let options = QueryOptions {
      scope: KeyScope::User,
      ..QueryOptions::default()
    };
    engine
      .query::<String, _, _>("me", || async { Ok("alice".to_string()) }, options)
      .resolved()
      .await
      .unwrap();

    engine
      .mutate(
        "me",
        Value::from("bob"),
        || async { Ok(Value::from("bob")) },
        MutateOptions::default(),
      )
      .await
      .unwrap();

    // The commit must not re-tag the entry Shared
    assert_eq!(engine.cache().get("me").unwrap().scope, KeyScope::User);
    engine.evict_user_scoped();
    assert!(engine.cache().get("me").is_none());
  }

  #[tokio::test]
  async fn test_gc_drops_engine_bookkeeping() {
    let calls = Arc::new(AtomicU32::new(0));
    let engine = SyncEngine::new(EngineConfig {
      gc_max_age_ms: 0,
      ..EngineConfig::default()
    });

    engine
      .query::<String, _, _>("k", counted_fetcher(&calls, 0), QueryOptions::default())
      .resolved()
      .await
      .unwrap();
    engine
      .mutate(
        "k",
        Value::from(1),
        || async { Ok(Value::from(1)) },
        MutateOptions::default(),
      )
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(engine.gc(), 1);
    assert!(engine.cache().get("k").is_none());
    assert!(!engine.inner.fetchers.lock().contains_key("k"));
    assert!(!engine.inner.mutation_locks.lock().contains_key("k"));
  }

  #[tokio::test]
  async fn test_session_expiry_evicts_user_scoped_entries() {
    let engine = engine();
    let store = SessionStore::new(MemorySessionPersist::new());
    engine.bind_session(&store);

    store
      .login(
        Credentials {
          username: "alice".to_string(),
          secret: "hunter2".to_string(),
        },
        |_| async {
          Ok(AuthGrant {
            principal: Principal {
              id: "u1".to_string(),
              display_name: None,
              capabilities: BTreeSet::new(),
            },
            token: "tok".to_string(),
            expires_at: Utc::now() + chrono::Duration::milliseconds(100),
          })
        },
      )
      .await
      .unwrap();

    let options = QueryOptions {
      scope: KeyScope::User,
      ..QueryOptions::default()
    };
    engine
      .query::<String, _, _>("me", || async { Ok("alice".to_string()) }, options)
      .resolved()
      .await
      .unwrap();
    assert!(engine.cache().get("me").is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!store.is_authenticated());
    assert!(engine.cache().get("me").is_none());
  }

  #[tokio::test]
  async fn test_reset_clears_everything() {
    let calls = Arc::new(AtomicU32::new(0));
    let engine = engine();

    engine
      .query::<String, _, _>("k", counted_fetcher(&calls, 0), QueryOptions::default())
      .resolved()
      .await
      .unwrap();
    engine.reset();

    assert!(engine.cache().get("k").is_none());
    assert!(engine.pending_mutation("k").is_none());
  }
}
