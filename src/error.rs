//! Error types shared by the cache, upstream client and dashboard layers.

use thiserror::Error;

use crate::auth::UnauthorizedReason;
use crate::ci::ids::IdError;

/// Failure reported by the upstream CI API.
///
/// The split between transient and permanent drives retry decisions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
  /// Network failure, 5xx or rate limiting (429). Worth retrying.
  #[error("transient upstream failure: {0}")]
  Transient(String),
  /// 4xx, GraphQL errors or an undecodable body. Never retried.
  #[error("upstream rejected request: {0}")]
  Permanent(String),
}

impl UpstreamError {
  pub fn transient(msg: impl Into<String>) -> Self {
    Self::Transient(msg.into())
  }

  pub fn permanent(msg: impl Into<String>) -> Self {
    Self::Permanent(msg.into())
  }
}

/// Errors surfaced by the cache manager.
///
/// Cloneable so that every caller sharing a single-flight refresh receives the
/// identical outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
  /// Transient failures persisted past the retry budget.
  #[error("upstream unavailable: {0}")]
  UpstreamUnavailable(String),
  /// Upstream refused the request; callers should not retry.
  #[error("upstream rejected: {0}")]
  UpstreamRejected(String),
  #[error("cache storage error: {0}")]
  Storage(String),
  #[error("failed to decode {what}: {message}")]
  Decode { what: String, message: String },
  #[error(transparent)]
  InvalidId(#[from] IdError),
  /// The refresh task died before producing a result.
  #[error("refresh task failed: {0}")]
  Task(String),
}

impl CoreError {
  pub fn decode(what: impl Into<String>, err: impl std::fmt::Display) -> Self {
    Self::Decode {
      what: what.into(),
      message: err.to_string(),
    }
  }
}

impl From<UpstreamError> for CoreError {
  fn from(err: UpstreamError) -> Self {
    match err {
      UpstreamError::Transient(msg) => Self::UpstreamUnavailable(msg),
      UpstreamError::Permanent(msg) => Self::UpstreamRejected(msg),
    }
  }
}

impl From<rusqlite::Error> for CoreError {
  fn from(err: rusqlite::Error) -> Self {
    Self::Storage(err.to_string())
  }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Outcome of a dashboard request that did not produce data.
///
/// A single resource the caller may not see is reported as `NotFound`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewError {
  #[error("unauthorized: {0}")]
  Unauthorized(UnauthorizedReason),
  #[error("not found")]
  NotFound,
  #[error(transparent)]
  Upstream(#[from] CoreError),
}
