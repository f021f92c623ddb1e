//! Cache entry types and staleness derivation.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::error::FetchError;

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
  /// No value has ever been stored for this key.
  Empty,
  /// A fetch is in flight; any held value is the previous one.
  Loading,
  /// The value is within its stale window.
  Fresh,
  /// The value is past its stale window but still servable.
  Stale,
  /// The last fetch exhausted its retries; the error is held on the entry.
  Error,
}

/// Whether a key belongs to the authenticated user.
///
/// User-scoped entries are evicted on logout and session expiry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyScope {
  #[default]
  Shared,
  User,
}

/// One cached unit of remote data.
///
/// Values are stored as `serde_json::Value` so entries of different shapes
/// share one store; typed access happens at the engine boundary.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub value: Option<Value>,
  pub fetched_at: Option<DateTime<Utc>>,
  pub stale_after: Duration,
  pub state: EntryState,
  pub error: Option<FetchError>,
  pub scope: KeyScope,
  /// Number of registered observers, filled in when the entry is handed out.
  pub subscriber_count: usize,
}

impl CacheEntry {
  pub(crate) fn empty(key: &str, stale_after: Duration) -> Self {
    Self {
      key: key.to_string(),
      value: None,
      fetched_at: None,
      stale_after,
      state: EntryState::Empty,
      error: None,
      scope: KeyScope::default(),
      subscriber_count: 0,
    }
  }

  /// True once `now - fetched_at` exceeds the stale window.
  pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
    match self.fetched_at {
      Some(at) => now - at > self.stale_after,
      None => true,
    }
  }

  /// State with age-based staleness applied.
  ///
  /// A `Fresh` entry past its window reports `Stale` without any sweeper
  /// having touched it; explicit states are reported as-is.
  pub fn effective_state(&self, now: DateTime<Utc>) -> EntryState {
    match self.state {
      EntryState::Fresh if self.is_stale(now) => EntryState::Stale,
      other => other,
    }
  }

  /// The stable state this entry reverts to when an in-flight fetch is
  /// cancelled: last value if present, held error otherwise, else empty.
  pub(crate) fn stable_state(&self, now: DateTime<Utc>) -> EntryState {
    if self.value.is_some() {
      if self.is_stale(now) {
        EntryState::Stale
      } else {
        EntryState::Fresh
      }
    } else if self.error.is_some() {
      EntryState::Error
    } else {
      EntryState::Empty
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fresh_entry_ages_into_stale() {
    let now = Utc::now();
    let entry = CacheEntry {
      value: Some(Value::from(1)),
      fetched_at: Some(now - Duration::seconds(10)),
      stale_after: Duration::seconds(5),
      state: EntryState::Fresh,
      ..CacheEntry::empty("k", Duration::seconds(5))
    };
    assert_eq!(entry.effective_state(now), EntryState::Stale);
  }

  #[test]
  fn test_fresh_entry_within_window() {
    let now = Utc::now();
    let entry = CacheEntry {
      value: Some(Value::from(1)),
      fetched_at: Some(now),
      state: EntryState::Fresh,
      ..CacheEntry::empty("k", Duration::seconds(5))
    };
    assert_eq!(entry.effective_state(now), EntryState::Fresh);
  }

  #[test]
  fn test_stable_state_prefers_value() {
    let now = Utc::now();
    let mut entry = CacheEntry {
      value: Some(Value::from(1)),
      fetched_at: Some(now),
      state: EntryState::Loading,
      error: Some(FetchError::Timeout),
      ..CacheEntry::empty("k", Duration::seconds(5))
    };
    assert_eq!(entry.stable_state(now), EntryState::Fresh);

    entry.value = None;
    assert_eq!(entry.stable_state(now), EntryState::Error);

    entry.error = None;
    assert_eq!(entry.stable_state(now), EntryState::Empty);
  }
}
