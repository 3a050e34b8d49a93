//! Resource model and upstream access for the CI platform.

pub mod api_types;
pub mod cache;
pub mod cached_client;
pub mod client;
pub mod ids;
pub mod types;

pub use cache::CiQueryKey;
pub use cached_client::{CachedCiClient, Refreshed};
pub use client::{HttpClientSettings, HttpUpstreamClient, UpstreamClient};
pub use types::{Agent, Build, BuildCounts, BuildState, BuildSummary, Job, JobLog, Pipeline, QueueStatus};
