//! Persistent store trait and SQLite implementation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

use super::traits::{CacheKey, ResourceKind, StoredEntry};

/// Durable `(kind, key) -> entry` table.
///
/// Every write replaces a whole entry; readers never observe a partial one.
pub trait PersistentStore: Send + Sync {
  /// Get a single entry by key.
  fn get(&self, key: &CacheKey) -> CoreResult<Option<StoredEntry>>;

  /// Insert or replace a single entry.
  fn put(&self, entry: &StoredEntry) -> CoreResult<()>;

  /// Insert or replace several entries in one transaction.
  fn put_many(&self, entries: &[StoredEntry]) -> CoreResult<()>;

  /// Remove an entry. Returns whether one existed.
  fn delete(&self, key: &CacheKey) -> CoreResult<bool>;

  /// Delete entries fetched more than `max_age` before `now`.
  fn sweep_expired(&self, max_age: Duration, now: DateTime<Utc>) -> CoreResult<usize>;

  /// Number of stored entries per resource kind.
  fn count_by_kind(&self) -> CoreResult<BTreeMap<ResourceKind, u64>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    kind TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    fetched_at INTEGER NOT NULL,
    ttl_seconds INTEGER NOT NULL,
    PRIMARY KEY (kind, key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_fetched
    ON cache_entries(fetched_at);
"#;

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> CoreResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        CoreError::Storage(format!("Failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CoreError::Storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;
    Self::from_connection(conn)
  }

  /// A throwaway store, mostly for tests.
  pub fn open_in_memory() -> CoreResult<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("buildboard").join("cache.db"))
  }

  fn from_connection(conn: Connection) -> CoreResult<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| CoreError::Storage(format!("Failed to run cache migrations: {}", e)))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> CoreResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| CoreError::Storage(format!("Lock poisoned: {}", e)))
  }
}

fn upsert(conn: &Connection, entry: &StoredEntry) -> CoreResult<()> {
  conn.execute(
    "INSERT INTO cache_entries (kind, key, value, fetched_at, ttl_seconds)
     VALUES (?, ?, ?, ?, ?)
     ON CONFLICT (kind, key) DO UPDATE SET
       value = excluded.value,
       fetched_at = excluded.fetched_at,
       ttl_seconds = excluded.ttl_seconds
     WHERE excluded.fetched_at >= cache_entries.fetched_at",
    params![
      entry.key.kind.as_str(),
      entry.key.id,
      entry.value.as_slice(),
      entry.fetched_at.timestamp_millis(),
      i64::try_from(entry.ttl_seconds).unwrap_or(i64::MAX),
    ],
  )?;
  Ok(())
}

fn from_millis(ms: i64) -> CoreResult<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .ok_or_else(|| CoreError::Storage(format!("Invalid timestamp {}", ms)))
}

impl PersistentStore for SqliteStore {
  fn get(&self, key: &CacheKey) -> CoreResult<Option<StoredEntry>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, i64, i64)> = conn
      .query_row(
        "SELECT value, fetched_at, ttl_seconds FROM cache_entries
         WHERE kind = ? AND key = ?",
        params![key.kind.as_str(), key.id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    match row {
      Some((value, fetched_at, ttl)) => Ok(Some(StoredEntry {
        key: key.clone(),
        value: Arc::new(value),
        fetched_at: from_millis(fetched_at)?,
        ttl_seconds: u64::try_from(ttl).unwrap_or(0),
      })),
      None => Ok(None),
    }
  }

  fn put(&self, entry: &StoredEntry) -> CoreResult<()> {
    let conn = self.lock()?;
    upsert(&conn, entry)
  }

  fn put_many(&self, entries: &[StoredEntry]) -> CoreResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    for entry in entries {
      upsert(&tx, entry)?;
    }
    tx.commit()?;
    Ok(())
  }

  fn delete(&self, key: &CacheKey) -> CoreResult<bool> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE kind = ? AND key = ?",
      params![key.kind.as_str(), key.id],
    )?;
    Ok(removed > 0)
  }

  fn sweep_expired(&self, max_age: Duration, now: DateTime<Utc>) -> CoreResult<usize> {
    // A window reaching before the representable range leaves nothing to sweep
    let Some(cutoff) = now.checked_sub_signed(max_age) else {
      return Ok(0);
    };
    let conn = self.lock()?;
    let cutoff = cutoff.timestamp_millis();
    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE fetched_at < ?",
      params![cutoff],
    )?;
    debug!("Swept {} cache entries older than {}", removed, max_age);
    Ok(removed)
  }

  fn count_by_kind(&self) -> CoreResult<BTreeMap<ResourceKind, u64>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT kind, COUNT(*) FROM cache_entries GROUP BY kind")?;

    let rows: Vec<(String, i64)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<Result<_, _>>()?;

    let mut counts: BTreeMap<ResourceKind, u64> =
      ResourceKind::ALL.iter().map(|kind| (*kind, 0)).collect();
    for (kind, count) in rows {
      if let Some(kind) = ResourceKind::parse(&kind) {
        counts.insert(kind, u64::try_from(count).unwrap_or(0));
      }
    }
    Ok(counts)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(kind: ResourceKind, id: &str, value: &str, fetched_at: DateTime<Utc>) -> StoredEntry {
    StoredEntry::encode(CacheKey::new(kind, id), &value, fetched_at, 60).unwrap()
  }

  fn now() -> DateTime<Utc> {
    // Millisecond precision, matching what the table keeps
    Utc.timestamp_millis_opt(1_714_557_600_000).unwrap()
  }

  #[test]
  fn test_put_get_roundtrip() {
    let store = SqliteStore::open_in_memory().unwrap();
    let e = entry(ResourceKind::Pipeline, "lang-sme", "v1", now());

    store.put(&e).unwrap();
    assert_eq!(store.get(&e.key).unwrap(), Some(e.clone()));
    assert_eq!(
      store.get(&CacheKey::new(ResourceKind::Build, "lang-sme")).unwrap(),
      None
    );
  }

  #[test]
  fn test_put_replaces_whole_entry() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put(&entry(ResourceKind::Agent, "a1", "old", now())).unwrap();
    let newer = entry(ResourceKind::Agent, "a1", "new", now() + Duration::seconds(5));
    store.put(&newer).unwrap();

    let got = store.get(&newer.key).unwrap().unwrap();
    assert_eq!(got, newer);
    assert_eq!(got.decode::<String>().unwrap().value, "new");
  }

  #[test]
  fn test_older_put_does_not_replace_newer() {
    let store = SqliteStore::open_in_memory().unwrap();
    let newer = entry(ResourceKind::Build, "lang-sme/5", "passed", now() + Duration::seconds(5));
    store.put(&newer).unwrap();
    store
      .put_many(&[entry(ResourceKind::Build, "lang-sme/5", "running", now())])
      .unwrap();

    assert_eq!(store.get(&newer.key).unwrap(), Some(newer.clone()));

    let same_instant = entry(ResourceKind::Build, "lang-sme/5", "failed", newer.fetched_at);
    store.put(&same_instant).unwrap();
    assert_eq!(store.get(&newer.key).unwrap(), Some(same_instant));
  }

  #[test]
  fn test_delete() {
    let store = SqliteStore::open_in_memory().unwrap();
    let e = entry(ResourceKind::Job, "j", "log", now());
    store.put(&e).unwrap();

    assert!(store.delete(&e.key).unwrap());
    assert!(!store.delete(&e.key).unwrap());
    assert_eq!(store.get(&e.key).unwrap(), None);
  }

  #[test]
  fn test_sweep_removes_only_old_entries() {
    let store = SqliteStore::open_in_memory().unwrap();
    let old = entry(ResourceKind::Build, "old", "x", now() - Duration::days(10));
    let recent = entry(ResourceKind::Build, "recent", "y", now() - Duration::hours(1));
    store.put_many(&[old.clone(), recent.clone()]).unwrap();

    let removed = store.sweep_expired(Duration::days(7), now()).unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store.get(&old.key).unwrap(), None);
    assert!(store.get(&recent.key).unwrap().is_some());
  }

  #[test]
  fn test_sweep_with_unbounded_window_keeps_everything() {
    let store = SqliteStore::open_in_memory().unwrap();
    let old = entry(ResourceKind::Build, "old", "x", now() - Duration::days(10));
    store.put(&old).unwrap();

    assert_eq!(store.sweep_expired(Duration::MAX, now()).unwrap(), 0);
    assert!(store.get(&old.key).unwrap().is_some());
  }

  #[test]
  fn test_huge_ttl_survives_storage() {
    let store = SqliteStore::open_in_memory().unwrap();
    let e = StoredEntry::encode(CacheKey::new(ResourceKind::Pipeline, "p"), &"v", now(), u64::MAX).unwrap();
    store.put(&e).unwrap();

    let got = store.get(&e.key).unwrap().unwrap();
    assert!(got.is_fresh(now() + Duration::days(365 * 100)));
  }

  #[test]
  fn test_count_by_kind_reports_every_kind() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .put_many(&[
        entry(ResourceKind::Pipeline, "a", "x", now()),
        entry(ResourceKind::Pipeline, "b", "x", now()),
        entry(ResourceKind::Agent, "c", "x", now()),
      ])
      .unwrap();

    let counts = store.count_by_kind().unwrap();
    assert_eq!(counts[&ResourceKind::Pipeline], 2);
    assert_eq!(counts[&ResourceKind::Agent], 1);
    assert_eq!(counts[&ResourceKind::QueueStatus], 0);
    assert_eq!(counts.len(), ResourceKind::ALL.len());
  }

  #[test]
  fn test_survives_reopen() {
    let dir = std::env::temp_dir().join(format!("buildboard-store-{}", std::process::id()));
    let path = dir.join("cache.db");
    let e = entry(ResourceKind::Pipeline, "persist", "v", now());

    {
      let store = SqliteStore::open(&path).unwrap();
      store.put(&e).unwrap();
    }
    let reopened = SqliteStore::open(&path).unwrap();
    assert_eq!(reopened.get(&e.key).unwrap(), Some(e));

    drop(reopened);
    let _ = std::fs::remove_dir_all(dir);
  }
}
