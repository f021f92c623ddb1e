//! In-memory request cache with per-key observers.
//!
//! The cache is shared state: the sync engine is its only writer, every other
//! component reads. Registered callbacks fire synchronously on each state
//! transition, which is the boundary to the rendering layer.

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::entry::{CacheEntry, EntryState, KeyScope};
use crate::error::FetchError;

/// Handle returned by `subscribe`, used to unsubscribe.
pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&str, &CacheEntry) + Send + Sync>;

/// Key/value store of fetched results with staleness and observer tracking.
#[derive(Default)]
pub struct RequestCache {
  entries: Mutex<HashMap<String, CacheEntry>>,
  subscribers: Mutex<HashMap<String, Vec<(SubscriptionId, Callback)>>>,
  next_subscription: AtomicU64,
}

impl RequestCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Get a snapshot of the entry for `key`, if one exists.
  pub fn get(&self, key: &str) -> Option<CacheEntry> {
    let entry = self.entries.lock().get(key).cloned()?;
    Some(self.with_subscriber_count(entry))
  }

  /// Store a fetched value: state becomes `Fresh`, `fetched_at` is now.
  pub fn put(&self, key: &str, value: Value, stale_after: Duration, scope: KeyScope) {
    let entry = {
      let mut entries = self.entries.lock();
      let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| CacheEntry::empty(key, stale_after));
      entry.value = Some(value);
      entry.fetched_at = Some(Utc::now());
      entry.stale_after = stale_after;
      entry.state = EntryState::Fresh;
      entry.error = None;
      entry.scope = scope;
      entry.clone()
    };
    self.notify(key, entry);
  }

  /// Mark a fetch as in flight. The previous value, if any, is kept so stale
  /// data remains servable while the refresh runs.
  pub fn mark_loading(&self, key: &str, stale_after: Duration, scope: KeyScope) {
    let entry = {
      let mut entries = self.entries.lock();
      let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| CacheEntry::empty(key, stale_after));
      entry.state = EntryState::Loading;
      entry.scope = scope;
      entry.clone()
    };
    self.notify(key, entry);
  }

  /// Record a terminal fetch failure on the entry.
  ///
  /// `fetched_at` is set so the error ages out of the cache on the same TTL
  /// as a value would, which is what stops retry storms.
  pub fn set_error(&self, key: &str, error: FetchError) {
    let entry = {
      let mut entries = self.entries.lock();
      let Some(entry) = entries.get_mut(key) else {
        return;
      };
      entry.state = EntryState::Error;
      entry.error = Some(error);
      entry.fetched_at = Some(Utc::now());
      entry.clone()
    };
    debug!(key, "cached fetch error");
    self.notify(key, entry);
  }

  /// Revert a `Loading` entry to its last stable state after a cancel.
  pub fn revert_loading(&self, key: &str) {
    let entry = {
      let mut entries = self.entries.lock();
      let Some(entry) = entries.get_mut(key) else {
        return;
      };
      if entry.state != EntryState::Loading {
        return;
      }
      entry.state = entry.stable_state(Utc::now());
      entry.clone()
    };
    self.notify(key, entry);
  }

  /// Force `key` stale. Fresh and Stale entries become Stale; a cached error
  /// is cleared so the next query refetches. Idempotent.
  ///
  /// Returns true if the entry exists (the engine uses this together with
  /// `subscriber_count` to decide whether to schedule a background refetch).
  pub fn invalidate(&self, key: &str) -> bool {
    let entry = {
      let mut entries = self.entries.lock();
      let Some(entry) = entries.get_mut(key) else {
        return false;
      };
      match entry.state {
        EntryState::Fresh | EntryState::Stale => entry.state = EntryState::Stale,
        EntryState::Error => {
          entry.error = None;
          entry.state = if entry.value.is_some() {
            EntryState::Stale
          } else {
            EntryState::Empty
          };
        }
        EntryState::Loading | EntryState::Empty => return true,
      }
      entry.clone()
    };
    self.notify(key, entry);
    true
  }

  /// Invalidate every key matching the predicate; returns the matched keys.
  pub fn invalidate_where<P: Fn(&str) -> bool>(&self, predicate: P) -> Vec<String> {
    let keys: Vec<String> = {
      let entries = self.entries.lock();
      entries.keys().filter(|k| predicate(k)).cloned().collect()
    };
    for key in &keys {
      self.invalidate(key);
    }
    keys
  }

  /// Remove the entry entirely. Observers see a final `Empty` transition.
  pub fn evict(&self, key: &str) {
    let removed = self.entries.lock().remove(key);
    if let Some(entry) = removed {
      debug!(key, "evicted cache entry");
      self.notify(key, CacheEntry::empty(key, entry.stale_after));
    }
  }

  /// Remove all user-scoped entries (logout / expiry path).
  ///
  /// Returns the evicted keys so the engine can drop their fetchers.
  pub fn evict_user_scoped(&self) -> Vec<String> {
    let keys: Vec<String> = {
      let entries = self.entries.lock();
      entries
        .values()
        .filter(|e| e.scope == KeyScope::User)
        .map(|e| e.key.clone())
        .collect()
    };
    for key in &keys {
      self.evict(key);
    }
    keys
  }

  /// Drop unsubscribed entries older than `max_age`. Loading entries are
  /// never collected. Returns the removed keys so the engine can drop its
  /// own per-key bookkeeping alongside.
  pub fn gc(&self, max_age: Duration) -> Vec<String> {
    let now = Utc::now();
    let subscribed: Vec<String> = {
      let subscribers = self.subscribers.lock();
      subscribers
        .iter()
        .filter(|(_, subs)| !subs.is_empty())
        .map(|(k, _)| k.clone())
        .collect()
    };
    let mut entries = self.entries.lock();
    let mut removed = Vec::new();
    entries.retain(|key, entry| {
      if entry.state == EntryState::Loading || subscribed.iter().any(|k| k == key) {
        return true;
      }
      let keep = match entry.fetched_at {
        Some(at) => now - at <= max_age,
        None => false,
      };
      if !keep {
        removed.push(key.clone());
      }
      keep
    });
    removed
  }

  /// Replace the entry with a snapshot taken before an optimistic write, or
  /// remove it if there was nothing cached.
  pub fn restore(&self, key: &str, snapshot: Option<CacheEntry>) {
    match snapshot {
      Some(entry) => {
        let entry = {
          let mut entries = self.entries.lock();
          entries.insert(key.to_string(), entry.clone());
          entry
        };
        self.notify(key, entry);
      }
      None => self.evict(key),
    }
  }

  /// Drop every entry and subscription. Test-isolation hook.
  pub fn clear(&self) {
    self.entries.lock().clear();
    self.subscribers.lock().clear();
  }

  /// Register an observer for one key. The callback runs synchronously on
  /// every state transition of that key and must not call back into the
  /// cache or engine.
  pub fn subscribe<F>(&self, key: &str, callback: F) -> SubscriptionId
  where
    F: Fn(&str, &CacheEntry) + Send + Sync + 'static,
  {
    let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
    self
      .subscribers
      .lock()
      .entry(key.to_string())
      .or_default()
      .push((id, Arc::new(callback)));
    id
  }

  pub fn unsubscribe(&self, key: &str, id: SubscriptionId) {
    let mut subscribers = self.subscribers.lock();
    if let Some(subs) = subscribers.get_mut(key) {
      subs.retain(|(sub_id, _)| *sub_id != id);
      if subs.is_empty() {
        subscribers.remove(key);
      }
    }
  }

  pub fn subscriber_count(&self, key: &str) -> usize {
    self.subscribers.lock().get(key).map_or(0, Vec::len)
  }

  fn with_subscriber_count(&self, mut entry: CacheEntry) -> CacheEntry {
    entry.subscriber_count = self.subscriber_count(&entry.key);
    entry
  }

  fn notify(&self, key: &str, entry: CacheEntry) {
    let callbacks: Vec<Callback> = {
      let subscribers = self.subscribers.lock();
      match subscribers.get(key) {
        Some(subs) => subs.iter().map(|(_, cb)| cb.clone()).collect(),
        None => return,
      }
    };
    let entry = self.with_subscriber_count(entry);
    for callback in callbacks {
      callback(key, &entry);
    }
  }
}
