//! Core traits and types for the caching system.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Resource kinds the dashboard caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
  Pipeline,
  Agent,
  Build,
  Job,
  QueueStatus,
}

impl ResourceKind {
  pub const ALL: [ResourceKind; 5] = [
    Self::Pipeline,
    Self::Agent,
    Self::Build,
    Self::Job,
    Self::QueueStatus,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Pipeline => "pipeline",
      Self::Agent => "agent",
      Self::Build => "build",
      Self::Job => "job",
      Self::QueueStatus => "queue_status",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s.to_ascii_lowercase().replace('-', "_").as_str() {
      "pipeline" | "pipelines" => Some(Self::Pipeline),
      "agent" | "agents" => Some(Self::Agent),
      "build" | "builds" => Some(Self::Build),
      "job" | "jobs" => Some(Self::Job),
      "queue_status" | "queue" | "queues" => Some(Self::QueueStatus),
      _ => None,
    }
  }
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Identity of one cache entry: resource kind plus a kind-local key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
  pub kind: ResourceKind,
  pub id: String,
}

impl CacheKey {
  pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
    Self {
      kind,
      id: id.into(),
    }
  }

  /// Flat form used by the memory tier and the single-flight table.
  pub fn flat(&self) -> String {
    format!("{}:{}", self.kind, self.id)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.kind, self.id)
  }
}

/// Domain query keys that map onto cache entries.
pub trait QueryKey {
  fn cache_key(&self) -> CacheKey;

  /// Human readable description for logs.
  fn description(&self) -> String;
}

impl QueryKey for CacheKey {
  fn cache_key(&self) -> CacheKey {
    self.clone()
  }

  fn description(&self) -> String {
    self.to_string()
  }
}

/// A serialized entry as held by both cache tiers.
///
/// The value is shared so memory-tier hits clone cheaply.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
  pub key: CacheKey,
  pub value: Arc<Vec<u8>>,
  pub fetched_at: DateTime<Utc>,
  pub ttl_seconds: u64,
}

impl StoredEntry {
  pub fn encode<T: Serialize>(
    key: CacheKey,
    value: &T,
    fetched_at: DateTime<Utc>,
    ttl_seconds: u64,
  ) -> CoreResult<Self> {
    let bytes = serde_json::to_vec(value).map_err(|e| CoreError::decode(key.to_string(), e))?;
    Ok(Self {
      key,
      value: Arc::new(bytes),
      fetched_at,
      ttl_seconds,
    })
  }

  /// `None` when the TTL reaches past the representable time range; such an
  /// entry never expires.
  pub fn expires_at(&self) -> Option<DateTime<Utc>> {
    let ttl = i64::try_from(self.ttl_seconds).ok()?;
    self.fetched_at.checked_add_signed(Duration::try_seconds(ttl)?)
  }

  /// Fresh until strictly before expiry, so a zero TTL is never fresh.
  pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
    self.expires_at().map_or(true, |expires_at| now < expires_at)
  }

  pub fn decode<T: DeserializeOwned>(&self) -> CoreResult<CacheEntry<T>> {
    let value =
      serde_json::from_slice(&self.value).map_err(|e| CoreError::decode(self.key.to_string(), e))?;
    Ok(CacheEntry {
      key: self.key.clone(),
      value,
      fetched_at: self.fetched_at,
      ttl_seconds: self.ttl_seconds,
    })
  }
}

/// A typed cache entry. `fetched_at + ttl_seconds` is its expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub key: CacheKey,
  pub value: T,
  pub fetched_at: DateTime<Utc>,
  pub ttl_seconds: u64,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched from upstream (if from cache)
  pub fetched_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      fetched_at: None,
    }
  }

  /// Create a new cache result from a fresh cached entry.
  pub fn from_cache(data: T, fetched_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      fetched_at: Some(fetched_at),
    }
  }

  /// Create a new cache result for an expired entry served because the
  /// refresh failed.
  pub fn stale(data: T, fetched_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Stale,
      fetched_at: Some(fetched_at),
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      fetched_at: self.fetched_at,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Fresh data from upstream
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Expired data from cache; the refresh failed
  Stale,
}
