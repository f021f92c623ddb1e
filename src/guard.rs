//! Navigation access control.
//!
//! `evaluate` is a pure function of the target's rule and a session
//! snapshot. It never performs I/O and never fails; the router acting on the
//! returned decision is an external collaborator.

use std::collections::BTreeSet;

use crate::session::Session;

/// Declarative access requirements attached to a navigable target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessRule {
  /// Stable identifier of the target, carried on redirects for post-login
  /// resume.
  pub target_id: String,
  pub requires_auth: bool,
  pub required_capabilities: BTreeSet<String>,
}

impl AccessRule {
  /// A target anyone may visit.
  pub fn public(target_id: &str) -> Self {
    Self {
      target_id: target_id.to_string(),
      ..Self::default()
    }
  }

  /// A target requiring an authenticated session.
  pub fn authenticated(target_id: &str) -> Self {
    Self {
      target_id: target_id.to_string(),
      requires_auth: true,
      required_capabilities: BTreeSet::new(),
    }
  }

  /// A target requiring authentication plus the listed capabilities.
  pub fn with_capabilities<I: IntoIterator<Item = S>, S: Into<String>>(
    target_id: &str,
    capabilities: I,
  ) -> Self {
    Self {
      target_id: target_id.to_string(),
      requires_auth: true,
      required_capabilities: capabilities.into_iter().map(Into::into).collect(),
    }
  }
}

/// Where a denied navigation is redirected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectTarget {
  Login,
  Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
  AuthRequired,
  InsufficientRole,
}

/// Outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
  Allow,
  Redirect {
    to: RedirectTarget,
    reason: DenyReason,
    /// The originally requested target, kept so navigation can resume after
    /// re-authentication.
    resume: Option<String>,
  },
}

impl Decision {
  pub fn is_allowed(&self) -> bool {
    matches!(self, Decision::Allow)
  }
}

/// Decide whether `session` may navigate to the target described by `rule`.
pub fn evaluate(rule: &AccessRule, session: &Session) -> Decision {
  if !rule.requires_auth {
    return Decision::Allow;
  }

  // Full check, not just the status flag: a snapshot captured before the
  // expiry timer fired still gets redirected
  if !session.is_authenticated() {
    return Decision::Redirect {
      to: RedirectTarget::Login,
      reason: DenyReason::AuthRequired,
      resume: Some(rule.target_id.clone()),
    };
  }

  let held = session
    .principal
    .as_ref()
    .map(|p| &p.capabilities)
    .cloned()
    .unwrap_or_default();
  if !rule.required_capabilities.is_subset(&held) {
    return Decision::Redirect {
      to: RedirectTarget::Forbidden,
      reason: DenyReason::InsufficientRole,
      resume: None,
    };
  }

  Decision::Allow
}
