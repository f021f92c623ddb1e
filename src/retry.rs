//! Exponential backoff policy for fetch retries.

use serde::Deserialize;
use std::time::Duration;

/// Retry schedule applied to failed fetch attempts.
///
/// The delay before retry `n` (zero-based) is `base_delay * 2^n`, capped at
/// `max_delay`. A timed-out attempt counts as one failed attempt.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
  /// Total number of attempts, including the first (default 3).
  pub max_attempts: u32,
  /// Delay before the first retry, in milliseconds.
  pub base_delay_ms: u64,
  /// Upper bound on any single delay, in milliseconds.
  pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 100,
      max_delay_ms: 5_000,
    }
  }
}

impl RetryPolicy {
  /// A policy that never retries.
  pub fn none() -> Self {
    Self {
      max_attempts: 1,
      ..Self::default()
    }
  }

  /// Delay to sleep after the failure of attempt `attempt` (zero-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.min(32));
    let delay = self.base_delay_ms.saturating_mul(factor);
    Duration::from_millis(delay.min(self.max_delay_ms))
  }
}
