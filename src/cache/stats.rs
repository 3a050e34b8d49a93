//! Health counters for the cache. Not used for correctness.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::traits::ResourceKind;

#[derive(Default)]
pub(crate) struct Counters {
  hits: AtomicU64,
  misses: AtomicU64,
  stale_served: AtomicU64,
  refresh_failures: AtomicU64,
  last_refresh: Mutex<BTreeMap<ResourceKind, DateTime<Utc>>>,
}

impl Counters {
  pub fn hit(&self) {
    self.hits.fetch_add(1, Ordering::Relaxed);
  }

  pub fn miss(&self) {
    self.misses.fetch_add(1, Ordering::Relaxed);
  }

  pub fn stale_served(&self) {
    self.stale_served.fetch_add(1, Ordering::Relaxed);
  }

  pub fn refresh_failed(&self) {
    self.refresh_failures.fetch_add(1, Ordering::Relaxed);
  }

  pub fn refreshed(&self, kind: ResourceKind, at: DateTime<Utc>) {
    self.last_refresh.lock().insert(kind, at);
  }

  pub fn snapshot(&self, entry_counts: BTreeMap<ResourceKind, u64>, memory_entries: usize) -> CacheStats {
    let hits = self.hits.load(Ordering::Relaxed);
    let misses = self.misses.load(Ordering::Relaxed);
    CacheStats {
      entry_counts,
      memory_entries,
      hits,
      misses,
      hit_rate: hit_rate(hits, misses),
      stale_served: self.stale_served.load(Ordering::Relaxed),
      refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
      last_refresh: self.last_refresh.lock().clone(),
    }
  }
}

/// Snapshot of cache health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
  /// Persistent entries per resource kind
  pub entry_counts: BTreeMap<ResourceKind, u64>,
  pub memory_entries: usize,
  /// Reads answered from either tier since process start
  pub hits: u64,
  pub misses: u64,
  /// 0.0–1.0; 0.0 before any lookups
  pub hit_rate: f64,
  pub stale_served: u64,
  pub refresh_failures: u64,
  /// Last successful refresh per resource kind
  pub last_refresh: BTreeMap<ResourceKind, DateTime<Utc>>,
}

#[allow(clippy::cast_precision_loss)]
fn hit_rate(hits: u64, misses: u64) -> f64 {
  let total = hits + misses;
  if total == 0 {
    0.0
  } else {
    hits as f64 / total as f64
  }
}
