//! Two-tier caching for upstream CI data.
//!
//! This module provides a CI-agnostic caching mechanism that:
//! - Keeps a durable SQLite copy of every fetched entry, surviving restarts
//! - Mirrors hot entries in a process-local memory tier
//! - Refreshes each key at most once at a time, sharing the outcome
//! - Serves expired entries when a refresh fails (stale-on-failure)
//! - Sweeps entries past a retention window

mod flight;
mod layer;
mod memory;
mod stats;
mod storage;
mod traits;

pub use flight::SingleFlight;
pub use layer::{CacheLayer, CacheSettings, Fetched, TtlConfig};
pub use memory::MemoryTier;
pub use stats::CacheStats;
pub use storage::{PersistentStore, SqliteStore};
pub use traits::{CacheEntry, CacheKey, CacheResult, CacheSource, QueryKey, ResourceKind, StoredEntry};
