//! Cached, role-aware data access for a CI/CD dashboard.
//!
//! Reads go through a two-tier cache (memory over SQLite) that refreshes from
//! the upstream CI API with retry and single-flight, and every result passes a
//! visibility filter before it leaves [`dashboard::Dashboard`].

pub mod auth;
pub mod cache;
pub mod ci;
pub mod clock;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod retry;

#[cfg(test)]
mod test_support;
