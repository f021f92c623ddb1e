//! Engine configuration with optional YAML file loading.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Defaults applied to queries that don't override them.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
  /// How long fetched data stays fresh, in milliseconds.
  pub stale_after_ms: u64,
  /// Retry schedule for failed fetches.
  pub retry: RetryPolicy,
  /// Per-attempt fetch timeout in milliseconds; None disables the bound.
  pub timeout_ms: Option<u64>,
  /// Age past which unsubscribed entries are garbage-collected.
  pub gc_max_age_ms: u64,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      stale_after_ms: 5 * 60 * 1_000,
      retry: RetryPolicy::default(),
      timeout_ms: Some(30_000),
      gc_max_age_ms: 60 * 60 * 1_000,
    }
  }
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("config file not found: {0}")]
  NotFound(String),
  #[error("failed to read config file {path}: {source}")]
  Io {
    path: String,
    source: std::io::Error,
  },
  #[error("failed to parse config file {path}: {source}")]
  Parse {
    path: String,
    source: serde_yaml::Error,
  },
}

impl EngineConfig {
  /// Load configuration from a YAML file.
  ///
  /// With an explicit path the file must exist; with `None` the defaults are
  /// returned.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
    match explicit_path {
      Some(p) if p.exists() => Self::load_from_path(p),
      Some(p) => Err(ConfigError::NotFound(p.display().to_string())),
      None => Ok(Self::default()),
    }
  }

  fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
      path: path.display().to_string(),
      source: e,
    })?;

    serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
      path: path.display().to_string(),
      source: e,
    })
  }

  pub fn stale_after(&self) -> chrono::Duration {
    chrono::Duration::milliseconds(self.stale_after_ms as i64)
  }

  pub fn timeout(&self) -> Option<std::time::Duration> {
    self.timeout_ms.map(std::time::Duration::from_millis)
  }

  pub fn gc_max_age(&self) -> chrono::Duration {
    chrono::Duration::milliseconds(self.gc_max_age_ms as i64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults_without_file() {
    let config = EngineConfig::load(None).unwrap();
    assert_eq!(config, EngineConfig::default());
    assert_eq!(config.retry.max_attempts, 3);
  }

  #[test]
  fn test_load_partial_yaml() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "stale_after_ms: 1000\nretry:\n  max_attempts: 5").unwrap();

    let config = EngineConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.stale_after_ms, 1_000);
    assert_eq!(config.retry.max_attempts, 5);
    // Unspecified fields keep their defaults
    assert_eq!(config.gc_max_age_ms, EngineConfig::default().gc_max_age_ms);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let result = EngineConfig::load(Some(Path::new("/nonexistent/qsync.yaml")));
    assert!(matches!(result, Err(ConfigError::NotFound(_))));
  }
}
