//! CI client with transparent caching.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::cache::{CacheLayer, CacheResult, CacheStats, Fetched, QueryKey, ResourceKind};
use crate::error::{CoreError, CoreResult};
use crate::retry::RetryPolicy;

use super::api_types::{
  decode_data, AgentsData, BuildData, GraphQlRequest, PipelineData, PipelinesData, AGENTS_QUERY,
  BUILD_QUERY, PIPELINES_QUERY, PIPELINE_QUERY, RECENT_BUILDS,
};
use super::cache::CiQueryKey;
use super::client::UpstreamClient;
use super::ids::{self, IdError};
use super::types::{Agent, Build, JobLog, Pipeline, QueueStatus};

/// Typed, cached access to CI resources.
///
/// Every read goes through the cache layer; misses are fetched via the retry
/// policy and written through, along with everything else the response
/// revealed (a pipeline list also caches each pipeline and its builds).
#[derive(Clone)]
pub struct CachedCiClient {
  upstream: Upstream,
  cache: CacheLayer,
}

/// Upstream side of a refresh. Cloned into each refresh task.
#[derive(Clone)]
struct Upstream {
  client: Arc<dyn UpstreamClient>,
  retry: RetryPolicy,
  organization: String,
}

/// Result of a forced refresh, by kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Refreshed {
  Pipelines(Vec<Pipeline>),
  Pipeline(Option<Pipeline>),
  Builds(Option<Vec<Build>>),
  Build(Option<Build>),
  Agents(Vec<Agent>),
  Queues(Vec<QueueStatus>),
  JobLog(JobLog),
}

impl CachedCiClient {
  pub fn new(
    client: Arc<dyn UpstreamClient>,
    cache: CacheLayer,
    retry: RetryPolicy,
    organization: impl Into<String>,
  ) -> Self {
    Self {
      upstream: Upstream {
        client,
        retry,
        organization: organization.into(),
      },
      cache,
    }
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  pub fn stats(&self) -> CoreResult<CacheStats> {
    self.cache.stats()
  }

  // ==========================================================================
  // Pipelines
  // ==========================================================================

  /// All pipelines of the organization.
  pub async fn pipelines(&self) -> CoreResult<CacheResult<Vec<Pipeline>>> {
    let upstream = self.upstream.clone();
    self
      .cache
      .fetch_and_cache(&CiQueryKey::Pipelines, async move { upstream.pipelines().await })
      .await
  }

  pub async fn refresh_pipelines(&self) -> CoreResult<Vec<Pipeline>> {
    let upstream = self.upstream.clone();
    self
      .cache
      .refresh(&CiQueryKey::Pipelines, async move { upstream.pipelines().await })
      .await
  }

  /// A single pipeline; `None` when upstream does not know the slug.
  pub async fn pipeline(&self, slug: &str) -> CoreResult<CacheResult<Option<Pipeline>>> {
    let key = CiQueryKey::Pipeline { slug: slug.to_string() };
    let upstream = self.upstream.clone();
    let slug = slug.to_string();
    self
      .cache
      .fetch_and_cache(&key, async move { upstream.pipeline(&slug).await })
      .await
  }

  pub async fn refresh_pipeline(&self, slug: &str) -> CoreResult<Option<Pipeline>> {
    let key = CiQueryKey::Pipeline { slug: slug.to_string() };
    let upstream = self.upstream.clone();
    let slug = slug.to_string();
    self
      .cache
      .refresh(&key, async move { upstream.pipeline(&slug).await })
      .await
  }

  // ==========================================================================
  // Builds
  // ==========================================================================

  /// Recent builds of a pipeline, newest first.
  pub async fn builds(&self, pipeline: &str) -> CoreResult<CacheResult<Option<Vec<Build>>>> {
    let key = CiQueryKey::Builds { pipeline: pipeline.to_string() };
    let upstream = self.upstream.clone();
    let slug = pipeline.to_string();
    self
      .cache
      .fetch_and_cache(&key, async move { upstream.builds(&slug).await })
      .await
  }

  pub async fn refresh_builds(&self, pipeline: &str) -> CoreResult<Option<Vec<Build>>> {
    let key = CiQueryKey::Builds { pipeline: pipeline.to_string() };
    let upstream = self.upstream.clone();
    let slug = pipeline.to_string();
    self
      .cache
      .refresh(&key, async move { upstream.builds(&slug).await })
      .await
  }

  pub async fn build(&self, pipeline: &str, number: u64) -> CoreResult<CacheResult<Option<Build>>> {
    let key = CiQueryKey::Build {
      pipeline: pipeline.to_string(),
      number,
    };
    let upstream = self.upstream.clone();
    let slug = pipeline.to_string();
    self
      .cache
      .fetch_and_cache(&key, async move { upstream.build_by_number(&slug, number).await })
      .await
  }

  pub async fn refresh_build(&self, pipeline: &str, number: u64) -> CoreResult<Option<Build>> {
    let key = CiQueryKey::Build {
      pipeline: pipeline.to_string(),
      number,
    };
    let upstream = self.upstream.clone();
    let slug = pipeline.to_string();
    self
      .cache
      .refresh(&key, async move { upstream.build_by_number(&slug, number).await })
      .await
  }

  /// A build by opaque GraphQL id (or bare uuid).
  pub async fn build_by_id(&self, id: &str) -> CoreResult<CacheResult<Option<Build>>> {
    let uuid = ids::parse_build_id(id)?;
    let key = CiQueryKey::BuildByUuid { uuid: uuid.clone() };
    let upstream = self.upstream.clone();
    self
      .cache
      .fetch_and_cache(&key, async move { upstream.build_by_uuid(&uuid).await })
      .await
  }

  pub async fn refresh_build_by_id(&self, id: &str) -> CoreResult<Option<Build>> {
    let uuid = ids::parse_build_id(id)?;
    let key = CiQueryKey::BuildByUuid { uuid: uuid.clone() };
    let upstream = self.upstream.clone();
    self
      .cache
      .refresh(&key, async move { upstream.build_by_uuid(&uuid).await })
      .await
  }

  /// Raw log of a job. Callers must have checked the build's visibility.
  pub async fn job_log(&self, pipeline: &str, number: u64, job_id: &str) -> CoreResult<CacheResult<JobLog>> {
    let job_uuid = ids::parse_job_id(job_id)?;
    let key = CiQueryKey::JobLog {
      job_uuid: job_uuid.clone(),
    };
    let upstream = self.upstream.clone();
    let slug = pipeline.to_string();
    self
      .cache
      .fetch_and_cache(&key, async move { upstream.job_log(&slug, number, &job_uuid).await })
      .await
  }

  // ==========================================================================
  // Agents and queues
  // ==========================================================================

  pub async fn agents(&self) -> CoreResult<CacheResult<Vec<Agent>>> {
    let upstream = self.upstream.clone();
    self
      .cache
      .fetch_and_cache(&CiQueryKey::Agents, async move { upstream.agents().await })
      .await
  }

  pub async fn refresh_agents(&self) -> CoreResult<Vec<Agent>> {
    let upstream = self.upstream.clone();
    self
      .cache
      .refresh(&CiQueryKey::Agents, async move { upstream.agents().await })
      .await
  }

  pub async fn agent(&self, id: &str) -> CoreResult<CacheResult<Option<Agent>>> {
    let key = CiQueryKey::Agent { id: id.to_string() };
    let upstream = self.upstream.clone();
    let id = id.to_string();
    self
      .cache
      .fetch_and_cache(&key, async move { upstream.agent(&id).await })
      .await
  }

  pub async fn queues(&self) -> CoreResult<CacheResult<Vec<QueueStatus>>> {
    let upstream = self.upstream.clone();
    self
      .cache
      .fetch_and_cache(&CiQueryKey::Queues, async move { upstream.queues().await })
      .await
  }

  pub async fn refresh_queues(&self) -> CoreResult<Vec<QueueStatus>> {
    let upstream = self.upstream.clone();
    self
      .cache
      .refresh(&CiQueryKey::Queues, async move { upstream.queues().await })
      .await
  }

  // ==========================================================================
  // Administration
  // ==========================================================================

  /// Forced refresh by kind, for administrative actions.
  ///
  /// `target` narrows the refresh: a pipeline slug for pipelines; a slug,
  /// `slug/number` or build id for builds; `slug/number/job` for job logs.
  pub async fn refresh_kind(&self, kind: ResourceKind, target: Option<&str>) -> CoreResult<Refreshed> {
    match (kind, target) {
      (ResourceKind::Pipeline, None) => self.refresh_pipelines().await.map(Refreshed::Pipelines),
      (ResourceKind::Pipeline, Some(slug)) => self.refresh_pipeline(slug).await.map(Refreshed::Pipeline),
      (ResourceKind::Build, None) => Err(IdError::Empty.into()),
      (ResourceKind::Build, Some(target)) => match parse_build_target(target) {
        BuildTarget::Number(slug, number) => {
          self.refresh_build(slug, number).await.map(Refreshed::Build)
        }
        BuildTarget::Id(id) => self.refresh_build_by_id(id).await.map(Refreshed::Build),
        BuildTarget::Pipeline(slug) => self.refresh_builds(slug).await.map(Refreshed::Builds),
      },
      (ResourceKind::Agent, _) => self.refresh_agents().await.map(Refreshed::Agents),
      (ResourceKind::QueueStatus, _) => self.refresh_queues().await.map(Refreshed::Queues),
      (ResourceKind::Job, target) => {
        let (slug, number, job) = target
          .and_then(parse_job_target)
          .ok_or_else(|| IdError::Malformed(target.unwrap_or_default().to_string()))?;
        let job_uuid = ids::parse_job_id(job)?;
        let key = CiQueryKey::JobLog {
          job_uuid: job_uuid.clone(),
        };
        let upstream = self.upstream.clone();
        let slug = slug.to_string();
        self
          .cache
          .refresh(&key, async move { upstream.job_log(&slug, number, &job_uuid).await })
          .await
          .map(Refreshed::JobLog)
      }
    }
  }

  /// Remove a single cached entry.
  pub fn invalidate(&self, key: &CiQueryKey) -> CoreResult<bool> {
    debug!("Invalidating {}", key.description());
    self.cache.invalidate(key)
  }
}

enum BuildTarget<'a> {
  Number(&'a str, u64),
  Id(&'a str),
  Pipeline(&'a str),
}

fn parse_build_target(target: &str) -> BuildTarget<'_> {
  if let Some((slug, number)) = target.rsplit_once('/') {
    if let Ok(number) = number.parse() {
      return BuildTarget::Number(slug, number);
    }
  }
  if ids::parse_build_id(target).is_ok() {
    BuildTarget::Id(target)
  } else {
    BuildTarget::Pipeline(target)
  }
}

fn parse_job_target(target: &str) -> Option<(&str, u64, &str)> {
  let mut parts = target.splitn(3, '/');
  let slug = parts.next()?;
  let number = parts.next()?.parse().ok()?;
  let job = parts.next()?;
  Some((slug, number, job))
}

impl Upstream {
  async fn query(&self, request: GraphQlRequest) -> CoreResult<Value> {
    self
      .retry
      .execute(|| self.client.query(request.clone()))
      .await
      .map_err(CoreError::from)
  }

  fn full_slug(&self, pipeline: &str) -> String {
    format!("{}/{}", self.organization, pipeline)
  }

  async fn pipelines(&self) -> CoreResult<Fetched<Vec<Pipeline>>> {
    let request = GraphQlRequest::new(
      PIPELINES_QUERY,
      json!({ "org": self.organization, "builds": RECENT_BUILDS }),
    );
    let data: PipelinesData = decode_data("pipelines", self.query(request).await?)?;
    let organization = data.organization.ok_or_else(|| {
      CoreError::UpstreamRejected(format!("Organization {} not found", self.organization))
    })?;

    let mut pipelines = Vec::new();
    let mut related = Vec::new();
    for node in organization.pipelines.into_nodes() {
      let (pipeline, builds) = node.into_pipeline();
      related.push((pipeline.clone(), builds));
      pipelines.push(pipeline);
    }

    let mut fetched = Fetched::new(pipelines);
    for (pipeline, builds) in related {
      fetched = with_pipeline(fetched, &pipeline, &builds)?;
    }
    debug!("Pipeline list refresh cached {} related entries", fetched.related_len());
    Ok(fetched)
  }

  async fn fetch_pipeline(&self, slug: &str) -> CoreResult<Option<(Pipeline, Vec<Build>)>> {
    let request = GraphQlRequest::new(
      PIPELINE_QUERY,
      json!({ "slug": self.full_slug(slug), "builds": RECENT_BUILDS }),
    );
    let data: PipelineData = decode_data("pipeline", self.query(request).await?)?;
    Ok(data.pipeline.map(|p| p.into_pipeline()))
  }

  async fn pipeline(&self, slug: &str) -> CoreResult<Fetched<Option<Pipeline>>> {
    match self.fetch_pipeline(slug).await? {
      Some((pipeline, builds)) => {
        let fetched = Fetched::new(Some(pipeline.clone()));
        with_pipeline(fetched, &pipeline, &builds)
      }
      None => Ok(Fetched::new(None)),
    }
  }

  async fn builds(&self, slug: &str) -> CoreResult<Fetched<Option<Vec<Build>>>> {
    match self.fetch_pipeline(slug).await? {
      Some((pipeline, builds)) => {
        let fetched = Fetched::new(Some(builds.clone()));
        with_pipeline(fetched, &pipeline, &builds)
      }
      None => Ok(Fetched::new(None)),
    }
  }

  async fn fetch_build(&self, variables: Value) -> CoreResult<Fetched<Option<Build>>> {
    let data: BuildData = decode_data("build", self.query(GraphQlRequest::new(BUILD_QUERY, variables)).await?)?;
    match data.build.map(|b| b.into_build(None)) {
      Some(build) => {
        let fetched = Fetched::new(Some(build.clone()));
        with_build(fetched, &build)
      }
      None => Ok(Fetched::new(None)),
    }
  }

  async fn build_by_number(&self, slug: &str, number: u64) -> CoreResult<Fetched<Option<Build>>> {
    let full = format!("{}/{}", self.full_slug(slug), number);
    self.fetch_build(json!({ "slug": full })).await
  }

  async fn build_by_uuid(&self, uuid: &str) -> CoreResult<Fetched<Option<Build>>> {
    self.fetch_build(json!({ "uuid": uuid })).await
  }

  async fn fetch_agents(&self) -> CoreResult<Vec<Agent>> {
    let request = GraphQlRequest::new(AGENTS_QUERY, json!({ "org": self.organization }));
    let data: AgentsData = decode_data("agents", self.query(request).await?)?;
    let organization = data.organization.ok_or_else(|| {
      CoreError::UpstreamRejected(format!("Organization {} not found", self.organization))
    })?;
    Ok(organization.agents.into_nodes().map(Agent::from).collect())
  }

  async fn agents(&self) -> CoreResult<Fetched<Vec<Agent>>> {
    let agents = self.fetch_agents().await?;
    let queues = QueueStatus::from_agents(&agents);
    let fetched = Fetched::new(agents.clone()).with_related(CiQueryKey::Queues.cache_key(), &queues)?;
    with_agents(fetched, &agents)
  }

  async fn agent(&self, id: &str) -> CoreResult<Fetched<Option<Agent>>> {
    let agents = self.fetch_agents().await?;
    let found = agents.iter().find(|a| a.id == id || a.uuid == id).cloned();
    let fetched = Fetched::new(found).with_related(CiQueryKey::Agents.cache_key(), &agents)?;
    with_agents(fetched, &agents)
  }

  async fn queues(&self) -> CoreResult<Fetched<Vec<QueueStatus>>> {
    let agents = self.fetch_agents().await?;
    let fetched = Fetched::new(QueueStatus::from_agents(&agents))
      .with_related(CiQueryKey::Agents.cache_key(), &agents)?;
    with_agents(fetched, &agents)
  }

  async fn job_log(&self, slug: &str, number: u64, job_uuid: &str) -> CoreResult<Fetched<JobLog>> {
    let path = format!(
      "organizations/{}/pipelines/{}/builds/{}/jobs/{}/log",
      self.organization, slug, number, job_uuid
    );
    let bytes = self
      .retry
      .execute(|| self.client.fetch_resource(&path))
      .await
      .map_err(CoreError::from)?;

    Ok(Fetched::new(JobLog {
      job_uuid: job_uuid.to_string(),
      content: log_content(&bytes)?,
    }))
  }
}

/// The REST log endpoint answers `{"content": ...}`; plain text is accepted too.
fn log_content(bytes: &[u8]) -> CoreResult<String> {
  #[derive(serde::Deserialize)]
  struct LogBody {
    content: String,
  }

  if let Ok(body) = serde_json::from_slice::<LogBody>(bytes) {
    return Ok(body.content);
  }
  String::from_utf8(bytes.to_vec()).map_err(|e| CoreError::decode("job log", e))
}

fn with_pipeline<T>(fetched: Fetched<T>, pipeline: &Pipeline, builds: &[Build]) -> CoreResult<Fetched<T>> {
  let mut fetched = fetched
    .with_related(
      CiQueryKey::Pipeline {
        slug: pipeline.slug.clone(),
      }
      .cache_key(),
      pipeline,
    )?
    .with_related(
      CiQueryKey::Builds {
        pipeline: pipeline.slug.clone(),
      }
      .cache_key(),
      &builds,
    )?;
  for build in builds {
    fetched = with_build(fetched, build)?;
  }
  Ok(fetched)
}

/// A build is reachable by number and by uuid; cache both.
fn with_build<T>(fetched: Fetched<T>, build: &Build) -> CoreResult<Fetched<T>> {
  fetched
    .with_related(
      CiQueryKey::Build {
        pipeline: build.pipeline_slug.clone(),
        number: build.number,
      }
      .cache_key(),
      build,
    )?
    .with_related(
      CiQueryKey::BuildByUuid {
        uuid: build.uuid.clone(),
      }
      .cache_key(),
      build,
    )
}

fn with_agents<T>(mut fetched: Fetched<T>, agents: &[Agent]) -> CoreResult<Fetched<T>> {
  for agent in agents {
    fetched = fetched.with_related(CiQueryKey::Agent { id: agent.id.clone() }.cache_key(), agent)?;
  }
  Ok(fetched)
}
