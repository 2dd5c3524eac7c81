//! Classification of upstream fetch failures.
//!
//! Three classes matter to the engine: not-found (a valid, cacheable
//! "absent" result), rate-limited (typed, always surfaced to the caller),
//! and everything else (transient, eligible for background retry).

use color_eyre::Report;
use std::fmt;

/// The upstream rate limit is exhausted.
///
/// Carries the metadata the caller needs to show a wait-time UI. This is
/// the one failure the read path never swallows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitError {
  /// Unix seconds at which the limit window resets
  pub reset_at: i64,
  /// Total requests allowed in the window
  pub limit: u32,
  /// Requests already used
  pub used: u32,
}

impl fmt::Display for RateLimitError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "GitHub rate limit exhausted ({}/{} used), resets at {}",
      self.used, self.limit, self.reset_at
    )
  }
}

impl std::error::Error for RateLimitError {}

/// The requested resource does not exist upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFoundError {
  pub path: String,
}

impl fmt::Display for NotFoundError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Not found: {}", self.path)
  }
}

impl std::error::Error for NotFoundError {}

/// How an upstream failure should be handled.
#[derive(Debug, Clone)]
pub enum ErrorClass {
  /// No data upstream; cache the absence instead of retrying
  NotFound,
  /// Surface to the caller; retry no sooner than the reset time
  RateLimited(RateLimitError),
  /// Network/5xx/timeout; retry in the background with backoff
  Transient,
}

/// Classify a failure from the remote fetcher.
pub fn classify(err: &Report) -> ErrorClass {
  for cause in err.chain() {
    if let Some(limit) = cause.downcast_ref::<RateLimitError>() {
      return ErrorClass::RateLimited(limit.clone());
    }
    if cause.downcast_ref::<NotFoundError>().is_some() {
      return ErrorClass::NotFound;
    }
  }
  ErrorClass::Transient
}

/// Extract a rate-limit error from a read-path failure, if that is what it
/// was. Callers use this to show a wait-time UI.
pub fn rate_limit(err: &Report) -> Option<RateLimitError> {
  match classify(err) {
    ErrorClass::RateLimited(limit) => Some(limit),
    _ => None,
  }
}
