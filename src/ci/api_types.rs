//! Serde-deserializable types matching the upstream GraphQL responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on dashboard needs.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::auth::Visibility;
use crate::error::{CoreError, CoreResult};

use super::types::{Agent, Build, BuildCounts, BuildState, Job, Pipeline};

/// Number of recent builds fetched with each pipeline.
pub const RECENT_BUILDS: u32 = 20;

/// A GraphQL request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphQlRequest {
  pub query: &'static str,
  pub variables: Value,
}

impl GraphQlRequest {
  pub fn new(query: &'static str, variables: Value) -> Self {
    Self { query, variables }
  }
}

// ============================================================================
// Queries
// ============================================================================

pub const PIPELINES_QUERY: &str = r#"
query Pipelines($org: ID!, $builds: Int!) {
  organization(slug: $org) {
    pipelines(first: 500) {
      edges { node { ...PipelineFields } }
    }
  }
}
fragment PipelineFields on Pipeline {
  id slug name description url visibility defaultBranch
  repository { url }
  builds(first: $builds) { edges { node { ...BuildFields } } }
}
fragment BuildFields on Build {
  id uuid number state branch commit message url createdAt startedAt finishedAt
  jobs(first: 100) { edges { node { ...JobFields } } }
}
fragment JobFields on JobTypeCommand {
  id uuid label state exitStatus startedAt finishedAt agent { name }
}
"#;

pub const PIPELINE_QUERY: &str = r#"
query Pipeline($slug: ID!, $builds: Int!) {
  pipeline(slug: $slug) {
    id slug name description url visibility defaultBranch
    repository { url }
    builds(first: $builds) { edges { node { ...BuildFields } } }
  }
}
fragment BuildFields on Build {
  id uuid number state branch commit message url createdAt startedAt finishedAt
  jobs(first: 100) { edges { node { ...JobFields } } }
}
fragment JobFields on JobTypeCommand {
  id uuid label state exitStatus startedAt finishedAt agent { name }
}
"#;

pub const BUILD_QUERY: &str = r#"
query Build($slug: ID, $uuid: ID) {
  build(slug: $slug, uuid: $uuid) {
    id uuid number state branch commit message url createdAt startedAt finishedAt
    pipeline { slug visibility }
    jobs(first: 100) { edges { node { ...JobFields } } }
  }
}
fragment JobFields on JobTypeCommand {
  id uuid label state exitStatus startedAt finishedAt agent { name }
}
"#;

pub const AGENTS_QUERY: &str = r#"
query Agents($org: ID!) {
  organization(slug: $org) {
    agents(first: 500) {
      edges {
        node {
          id uuid name hostname connectionState version metaData isRunningJob
          job { ... on JobTypeCommand { id } }
        }
      }
    }
  }
}
"#;

// ============================================================================
// Connection wrappers
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct Connection<T> {
  #[serde(default = "Vec::new")]
  pub edges: Vec<Edge<T>>,
}

impl<T> Default for Connection<T> {
  fn default() -> Self {
    Self { edges: Vec::new() }
  }
}

#[derive(Debug, Deserialize)]
pub struct Edge<T> {
  pub node: Option<T>,
}

impl<T> Connection<T> {
  pub fn into_nodes(self) -> impl Iterator<Item = T> {
    self.edges.into_iter().filter_map(|edge| edge.node)
  }
}

// ============================================================================
// Nodes
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiRepository {
  pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPipeline {
  pub id: String,
  pub slug: String,
  pub name: String,
  pub description: Option<String>,
  pub url: Option<String>,
  pub visibility: Option<String>,
  pub default_branch: Option<String>,
  pub repository: Option<ApiRepository>,
  #[serde(default)]
  pub builds: Connection<ApiBuild>,
}

#[derive(Debug, Deserialize)]
pub struct ApiPipelineRef {
  pub slug: String,
  pub visibility: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiBuild {
  pub id: String,
  pub uuid: String,
  pub number: u64,
  pub state: String,
  pub branch: Option<String>,
  pub commit: Option<String>,
  pub message: Option<String>,
  pub url: Option<String>,
  pub created_at: Option<DateTime<Utc>>,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
  pub pipeline: Option<ApiPipelineRef>,
  #[serde(default)]
  pub jobs: Connection<ApiJob>,
}

/// Job union member; non-command jobs come back as empty objects.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiJob {
  pub id: Option<String>,
  pub uuid: Option<String>,
  pub label: Option<String>,
  pub state: Option<String>,
  pub exit_status: Option<Value>,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
  pub agent: Option<ApiAgentRef>,
}

#[derive(Debug, Deserialize)]
pub struct ApiAgentRef {
  pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiJobRef {
  pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAgent {
  pub id: String,
  pub uuid: String,
  pub name: String,
  pub hostname: Option<String>,
  pub connection_state: Option<String>,
  pub version: Option<String>,
  #[serde(default)]
  pub meta_data: Vec<String>,
  #[serde(default)]
  pub is_running_job: bool,
  pub job: Option<ApiJobRef>,
}

// ============================================================================
// Response envelopes (the `data` object)
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiPipelinesOrg {
  #[serde(default)]
  pub pipelines: Connection<ApiPipeline>,
}

#[derive(Debug, Deserialize)]
pub struct PipelinesData {
  pub organization: Option<ApiPipelinesOrg>,
}

#[derive(Debug, Deserialize)]
pub struct PipelineData {
  pub pipeline: Option<ApiPipeline>,
}

#[derive(Debug, Deserialize)]
pub struct BuildData {
  pub build: Option<ApiBuild>,
}

#[derive(Debug, Deserialize)]
pub struct ApiAgentsOrg {
  #[serde(default)]
  pub agents: Connection<ApiAgent>,
}

#[derive(Debug, Deserialize)]
pub struct AgentsData {
  pub organization: Option<ApiAgentsOrg>,
}

/// Decode the `data` object of a GraphQL response.
pub fn decode_data<T: DeserializeOwned>(what: &str, data: Value) -> CoreResult<T> {
  serde_json::from_value(data).map_err(|e| CoreError::decode(what, e))
}

// ============================================================================
// Conversions
// ============================================================================

pub fn parse_visibility(raw: Option<&str>) -> Visibility {
  match raw {
    Some(v) if v.eq_ignore_ascii_case("public") => Visibility::Public,
    _ => Visibility::Private,
  }
}

impl ApiJob {
  pub fn into_job(self) -> Option<Job> {
    let exit_status = self.exit_status.and_then(|v| match v {
      Value::Null => None,
      Value::String(s) => Some(s),
      other => Some(other.to_string()),
    });
    Some(Job {
      id: self.id?,
      uuid: self.uuid?,
      label: self.label,
      state: self.state.unwrap_or_default().to_ascii_lowercase(),
      exit_status,
      agent_name: self.agent.and_then(|a| a.name),
      started_at: self.started_at,
      finished_at: self.finished_at,
    })
  }
}

impl ApiBuild {
  /// Converts into a domain build. The owning pipeline's slug and visibility
  /// win over whatever the node itself carries.
  pub fn into_build(self, owner: Option<(&str, Visibility)>) -> Build {
    let (pipeline_slug, visibility) = match (owner, &self.pipeline) {
      (Some((slug, visibility)), _) => (slug.to_string(), visibility),
      (None, Some(p)) => (p.slug.clone(), parse_visibility(p.visibility.as_deref())),
      (None, None) => (String::new(), Visibility::Private),
    };

    Build {
      id: self.id,
      uuid: self.uuid.to_ascii_lowercase(),
      number: self.number,
      pipeline_slug,
      visibility,
      state: BuildState::parse(&self.state),
      branch: self.branch,
      commit: self.commit,
      message: self.message,
      url: self.url,
      created_at: self.created_at,
      started_at: self.started_at,
      finished_at: self.finished_at,
      jobs: self.jobs.into_nodes().filter_map(ApiJob::into_job).collect(),
    }
  }
}

impl ApiPipeline {
  /// Converts into a pipeline plus its recent builds, newest first.
  pub fn into_pipeline(self) -> (Pipeline, Vec<Build>) {
    let visibility = parse_visibility(self.visibility.as_deref());
    let slug = self.slug;
    let builds: Vec<Build> = self
      .builds
      .into_nodes()
      .map(|b| b.into_build(Some((&slug, visibility))))
      .collect();

    let pipeline = Pipeline {
      id: self.id,
      slug,
      name: self.name,
      description: self.description.filter(|d| !d.is_empty()),
      repository: self.repository.and_then(|r| r.url),
      default_branch: self.default_branch,
      visibility,
      url: self.url,
      build_counts: BuildCounts::tally(&builds),
      latest_build: builds.first().map(Build::summary),
    };
    (pipeline, builds)
  }
}

impl From<ApiAgent> for Agent {
  fn from(agent: ApiAgent) -> Self {
    let queue = agent
      .meta_data
      .iter()
      .find_map(|tag| tag.strip_prefix("queue="))
      .unwrap_or("default")
      .to_string();

    Agent {
      id: agent.id,
      uuid: agent.uuid,
      name: agent.name,
      hostname: agent.hostname,
      connection_state: agent
        .connection_state
        .unwrap_or_else(|| "unknown".into())
        .to_ascii_lowercase(),
      version: agent.version,
      queue,
      is_running_job: agent.is_running_job,
      current_job_id: agent.job.and_then(|j| j.id),
    }
  }
}
