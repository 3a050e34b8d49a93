//! Process-local tier mirroring hot entries.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::traits::{CacheKey, ResourceKind, StoredEntry};

/// Volatile map of recently used entries.
///
/// Sharded, so writers only contend with readers of the same shard.
#[derive(Default)]
pub struct MemoryTier {
  entries: DashMap<String, StoredEntry>,
}

impl MemoryTier {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &CacheKey) -> Option<StoredEntry> {
    self.entries.get(&key.flat()).map(|e| e.value().clone())
  }

  /// Inserts `entry` unless the tier already holds a newer one for the key.
  /// Returns whether the entry was stored.
  pub fn insert(&self, entry: StoredEntry) -> bool {
    match self.entries.entry(entry.key.flat()) {
      Entry::Occupied(existing) if existing.get().fetched_at > entry.fetched_at => false,
      Entry::Occupied(mut existing) => {
        existing.insert(entry);
        true
      }
      Entry::Vacant(slot) => {
        slot.insert(entry);
        true
      }
    }
  }

  pub fn remove(&self, key: &CacheKey) -> Option<StoredEntry> {
    self.entries.remove(&key.flat()).map(|(_, e)| e)
  }

  /// Drops entries fetched before `cutoff`. Returns how many were removed.
  pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
    let before = self.entries.len();
    self.entries.retain(|_, e| e.fetched_at >= cutoff);
    before.saturating_sub(self.entries.len())
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn count(&self, kind: ResourceKind) -> usize {
    self.entries.iter().filter(|e| e.key.kind == kind).count()
  }
}
