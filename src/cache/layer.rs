//! Cache layer that orchestrates the two tiers with upstream refreshes.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};

use super::flight::SingleFlight;
use super::memory::MemoryTier;
use super::stats::{CacheStats, Counters};
use super::storage::PersistentStore;
use super::traits::{CacheEntry, CacheKey, CacheResult, QueryKey, ResourceKind, StoredEntry};

/// Freshness window per resource kind, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TtlConfig {
  #[serde(default = "default_pipelines_ttl")]
  pub pipelines: u64,
  #[serde(default = "default_builds_ttl")]
  pub builds: u64,
  #[serde(default = "default_agents_ttl")]
  pub agents: u64,
  #[serde(default = "default_jobs_ttl")]
  pub jobs: u64,
}

fn default_pipelines_ttl() -> u64 {
  60
}

fn default_builds_ttl() -> u64 {
  30
}

fn default_agents_ttl() -> u64 {
  30
}

fn default_jobs_ttl() -> u64 {
  300
}

impl Default for TtlConfig {
  fn default() -> Self {
    Self {
      pipelines: default_pipelines_ttl(),
      builds: default_builds_ttl(),
      agents: default_agents_ttl(),
      jobs: default_jobs_ttl(),
    }
  }
}

impl TtlConfig {
  /// Queue status is derived from agents and ages with them.
  pub fn for_kind(&self, kind: ResourceKind) -> u64 {
    match kind {
      ResourceKind::Pipeline => self.pipelines,
      ResourceKind::Build => self.builds,
      ResourceKind::Agent | ResourceKind::QueueStatus => self.agents,
      ResourceKind::Job => self.jobs,
    }
  }
}

/// Settings for [`CacheLayer`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
  pub ttl: TtlConfig,
  /// Default `max_age` for sweeps.
  pub retention: Duration,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      ttl: TtlConfig::default(),
      retention: Duration::days(7),
    }
  }
}

/// Outcome of an upstream fetch: the requested value plus entries learned
/// along the way (builds seen in a pipeline list, and so on).
pub struct Fetched<T> {
  pub value: T,
  related: Vec<(CacheKey, Arc<Vec<u8>>)>,
}

impl<T> Fetched<T> {
  pub fn new(value: T) -> Self {
    Self {
      value,
      related: Vec::new(),
    }
  }

  /// Also cache `value` under `key` when this fetch is written through.
  pub fn with_related<R: Serialize>(mut self, key: CacheKey, value: &R) -> CoreResult<Self> {
    let bytes = serde_json::to_vec(value).map_err(|e| CoreError::decode(key.to_string(), e))?;
    self.related.push((key, Arc::new(bytes)));
    Ok(self)
  }

  pub fn related_len(&self) -> usize {
    self.related.len()
  }
}

/// Two-tier cache with single-flight refreshes.
///
/// Reads try the memory tier, then the persistent store. Refreshes run the
/// supplied upstream work once per key no matter how many callers ask, and
/// write the result through both tiers.
#[derive(Clone)]
pub struct CacheLayer {
  inner: Arc<Inner>,
}

struct Inner {
  store: Arc<dyn PersistentStore>,
  memory: MemoryTier,
  clock: Arc<dyn Clock>,
  settings: CacheSettings,
  flights: SingleFlight<StoredEntry>,
  counters: Counters,
}

impl CacheLayer {
  pub fn new(store: Arc<dyn PersistentStore>, clock: Arc<dyn Clock>, settings: CacheSettings) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        memory: MemoryTier::new(),
        clock,
        settings,
        flights: SingleFlight::new(),
        counters: Counters::default(),
      }),
    }
  }

  pub fn settings(&self) -> &CacheSettings {
    &self.inner.settings
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.inner.clock.now()
  }

  /// Fresh entry for `key`, if any. Store hits are promoted into memory.
  pub fn read<T: DeserializeOwned>(&self, key: &impl QueryKey) -> CoreResult<Option<CacheEntry<T>>> {
    let key = key.cache_key();
    match self.inner.lookup(&key)? {
      Some(entry) if entry.is_fresh(self.now()) => {
        self.inner.counters.hit();
        Ok(Some(entry.decode()?))
      }
      _ => {
        self.inner.counters.miss();
        Ok(None)
      }
    }
  }

  /// Fetch from upstream, bypassing the cache, and write the result through.
  ///
  /// Concurrent refreshes of one key share a single run of `work`. On failure
  /// any previously cached entry is left untouched.
  pub async fn refresh<T, F>(&self, key: &impl QueryKey, work: F) -> CoreResult<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Future<Output = CoreResult<Fetched<T>>> + Send + 'static,
  {
    let entry = self.run_flight(key, work, false).await?;
    Ok(entry.decode::<T>()?.value)
  }

  /// Joins or starts the flight for `key`. With `reuse_fresh` the flight
  /// first looks the key up again and skips `work` if an earlier flight has
  /// already written a fresh entry.
  async fn run_flight<T, F>(&self, key: &impl QueryKey, work: F, reuse_fresh: bool) -> CoreResult<StoredEntry>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Future<Output = CoreResult<Fetched<T>>> + Send + 'static,
  {
    let cache_key = key.cache_key();
    let description = key.description();
    let flight_key = cache_key.flat();
    let inner = Arc::clone(&self.inner);

    self
      .inner
      .flights
      .run(&flight_key, async move {
        if reuse_fresh {
          match inner.lookup(&cache_key) {
            Ok(Some(entry)) if entry.is_fresh(inner.clock.now()) => {
              debug!("{} was refreshed by an earlier flight", description);
              return Ok(entry);
            }
            Ok(_) => {}
            Err(err) => return Err(err),
          }
        }

        let result = match work.await {
          Ok(fetched) => inner.write_through(&cache_key, fetched),
          Err(err) => Err(err),
        };
        match &result {
          Ok(_) => info!("Refreshed {}", description),
          Err(err) => {
            inner.counters.refresh_failed();
            warn!("Refresh of {} failed: {}", description, err);
          }
        }
        result
      })
      .await
  }

  /// Read-through: a fresh cached value if there is one, otherwise refresh.
  ///
  /// When the refresh fails but an expired entry exists, the expired value is
  /// served instead of the error.
  pub async fn fetch_and_cache<T, F>(&self, key: &impl QueryKey, work: F) -> CoreResult<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Future<Output = CoreResult<Fetched<T>>> + Send + 'static,
  {
    let cache_key = key.cache_key();
    let existing = self.inner.lookup(&cache_key)?;

    if let Some(entry) = &existing {
      if entry.is_fresh(self.now()) {
        self.inner.counters.hit();
        debug!("Cache hit for {}", cache_key);
        let entry = entry.decode::<T>()?;
        return Ok(CacheResult::from_cache(entry.value, entry.fetched_at));
      }
    }

    self.inner.counters.miss();
    debug!("Cache miss for {}", cache_key);

    match self.run_flight(key, work, true).await {
      Ok(entry) => Ok(CacheResult::from_network(entry.decode::<T>()?.value)),
      Err(err) => match existing {
        Some(entry) => {
          self.inner.counters.stale_served();
          warn!("Serving stale {} from {}: {}", cache_key, entry.fetched_at, err);
          let entry = entry.decode::<T>()?;
          Ok(CacheResult::stale(entry.value, entry.fetched_at))
        }
        None => Err(err),
      },
    }
  }

  /// Drop an entry from both tiers.
  pub fn invalidate(&self, key: &impl QueryKey) -> CoreResult<bool> {
    let key = key.cache_key();
    let in_memory = self.inner.memory.remove(&key).is_some();
    let in_store = self.inner.store.delete(&key)?;
    debug!("Invalidated {}", key);
    Ok(in_memory || in_store)
  }

  /// Delete entries fetched more than `max_age` ago from both tiers.
  pub fn sweep(&self, max_age: Duration) -> CoreResult<usize> {
    let now = self.now();
    let removed = self.inner.store.sweep_expired(max_age, now)?;
    let evicted = match now.checked_sub_signed(max_age) {
      Some(cutoff) => self.inner.memory.evict_older_than(cutoff),
      None => 0,
    };
    info!("Cache sweep removed {} stored and {} memory entries", removed, evicted);
    Ok(removed)
  }

  /// Run [`CacheLayer::sweep`] every `interval` until the task is aborted.
  pub fn spawn_sweeper(&self, interval: std::time::Duration, max_age: Duration) -> JoinHandle<()> {
    let layer = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        if let Err(err) = layer.sweep(max_age) {
          warn!("Cache sweep failed: {}", err);
        }
      }
    })
  }

  pub fn stats(&self) -> CoreResult<CacheStats> {
    let counts = self.inner.store.count_by_kind()?;
    Ok(self.inner.counters.snapshot(counts, self.inner.memory.len()))
  }

  #[cfg(test)]
  pub(crate) fn memory_entry(&self, key: &CacheKey) -> Option<StoredEntry> {
    self.inner.memory.get(key)
  }

  #[cfg(test)]
  pub(crate) fn stored_entry(&self, key: &CacheKey) -> CoreResult<Option<StoredEntry>> {
    self.inner.store.get(key)
  }
}

impl Inner {
  fn lookup(&self, key: &CacheKey) -> CoreResult<Option<StoredEntry>> {
    if let Some(entry) = self.memory.get(key) {
      return Ok(Some(entry));
    }
    let stored = self.store.get(key)?;
    if let Some(entry) = &stored {
      self.memory.insert(entry.clone());
    }
    Ok(stored)
  }

  /// Persist first, then mirror into memory.
  fn write_through<T: Serialize>(&self, key: &CacheKey, fetched: Fetched<T>) -> CoreResult<StoredEntry> {
    let now = self.clock.now();
    let ttl = &self.settings.ttl;
    let primary = StoredEntry::encode(key.clone(), &fetched.value, now, ttl.for_kind(key.kind))?;

    let mut entries = Vec::with_capacity(fetched.related.len() + 1);
    entries.push(primary.clone());
    entries.extend(fetched.related.into_iter().map(|(key, value)| StoredEntry {
      ttl_seconds: ttl.for_kind(key.kind),
      key,
      value,
      fetched_at: now,
    }));

    self.store.put_many(&entries)?;
    for entry in entries {
      self.counters.refreshed(entry.key.kind, now);
      self.memory.insert(entry);
    }
    Ok(primary)
  }
}
