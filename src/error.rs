//! Error taxonomy for authentication, fetching, mutation, and persistence.
//!
//! Fetch errors are `Clone` because one in-flight fetch can have many
//! attached callers; the terminal error is fanned out to all of them.

use thiserror::Error;

/// Errors from login and session restoration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
  /// The remote validator rejected the supplied credentials.
  #[error("invalid credentials")]
  InvalidCredentials,
  /// The session or grant is already past its expiry.
  #[error("session expired")]
  Expired,
  /// The validator could not be reached.
  #[error("network error: {0}")]
  Network(String),
}

/// Errors from fetch operations executed by the sync engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  #[error("network error: {0}")]
  Network(String),
  /// The caller-supplied timeout elapsed before the fetcher resolved.
  #[error("fetch timed out")]
  Timeout,
  #[error("server error {code}: {message}")]
  Server { code: u16, message: String },
  /// The in-flight operation was cancelled before completion.
  #[error("fetch aborted")]
  Aborted,
  /// The fetched or cached value could not be (de)serialized.
  #[error("decode error: {0}")]
  Decode(String),
}

impl FetchError {
  /// Whether the engine's backoff loop should try again after this error.
  ///
  /// Network failures, timeouts, and 5xx responses are transient; aborts,
  /// 4xx responses, and decode failures are not.
  pub fn is_retryable(&self) -> bool {
    match self {
      FetchError::Network(_) | FetchError::Timeout => true,
      FetchError::Server { code, .. } => *code >= 500,
      FetchError::Aborted | FetchError::Decode(_) => false,
    }
  }
}

/// Errors from mutation operations.
///
/// Conflict and validation failures are never auto-retried; the optimistic
/// value is rolled back and the error surfaced to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
  #[error("conflict: {0}")]
  Conflict(String),
  #[error("network error: {0}")]
  Network(String),
  #[error("validation failed: {0}")]
  ValidationFailed(String),
  /// A read performed inside the mutator failed.
  #[error(transparent)]
  Fetch(#[from] FetchError),
}

/// Errors from the durable session store.
///
/// `SessionStore::restore` treats every one of these as "no session"; they
/// only surface through the `SessionPersist` trait itself.
#[derive(Debug, Error)]
pub enum PersistError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error("malformed session record: {0}")]
  Malformed(String),
}
