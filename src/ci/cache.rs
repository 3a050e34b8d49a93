//! Cache keys for CI resources.

use crate::cache::{CacheKey, QueryKey, ResourceKind};

/// Aggregate (list) entries use ids starting with `@`, which no slug or uuid
/// can.
const ALL: &str = "@all";

/// Query key types for CI API reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CiQueryKey {
  /// Every pipeline in the organization
  Pipelines,
  /// A single pipeline by slug
  Pipeline { slug: String },
  /// Recent builds of a pipeline
  Builds { pipeline: String },
  /// A build by pipeline slug and number
  Build { pipeline: String, number: u64 },
  /// A build by raw uuid
  BuildByUuid { uuid: String },
  /// Every agent in the organization
  Agents,
  /// A single agent by id
  Agent { id: String },
  /// Queue availability derived from agents
  Queues,
  /// Raw log of a job
  JobLog { job_uuid: String },
}

impl QueryKey for CiQueryKey {
  fn cache_key(&self) -> CacheKey {
    match self {
      Self::Pipelines => CacheKey::new(ResourceKind::Pipeline, ALL),
      Self::Pipeline { slug } => CacheKey::new(ResourceKind::Pipeline, slug.as_str()),
      Self::Builds { pipeline } => CacheKey::new(ResourceKind::Build, format!("@pipeline/{}", pipeline)),
      Self::Build { pipeline, number } => {
        CacheKey::new(ResourceKind::Build, format!("{}/{}", pipeline, number))
      }
      Self::BuildByUuid { uuid } => CacheKey::new(ResourceKind::Build, format!("uuid/{}", uuid)),
      Self::Agents => CacheKey::new(ResourceKind::Agent, ALL),
      Self::Agent { id } => CacheKey::new(ResourceKind::Agent, id.as_str()),
      Self::Queues => CacheKey::new(ResourceKind::QueueStatus, ALL),
      Self::JobLog { job_uuid } => CacheKey::new(ResourceKind::Job, format!("log/{}", job_uuid)),
    }
  }

  fn description(&self) -> String {
    match self {
      Self::Pipelines => "all pipelines".to_string(),
      Self::Pipeline { slug } => format!("pipeline {}", slug),
      Self::Builds { pipeline } => format!("builds of {}", pipeline),
      Self::Build { pipeline, number } => format!("build {} #{}", pipeline, number),
      Self::BuildByUuid { uuid } => format!("build {}", uuid),
      Self::Agents => "all agents".to_string(),
      Self::Agent { id } => format!("agent {}", id),
      Self::Queues => "queue status".to_string(),
      Self::JobLog { job_uuid } => format!("log of job {}", job_uuid),
    }
  }
}
