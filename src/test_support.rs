//! Scripted upstream and fixtures shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::auth::Visibility;
use crate::cache::{CacheLayer, CacheSettings, SqliteStore};
use crate::ci::api_types::{GraphQlRequest, AGENTS_QUERY, BUILD_QUERY, PIPELINES_QUERY, PIPELINE_QUERY};
use crate::ci::ids::encode_node_id;
use crate::ci::{CachedCiClient, UpstreamClient};
use crate::clock::ManualClock;
use crate::error::UpstreamError;
use crate::retry::RetryPolicy;

pub const ORG: &str = "divvun";

/// In-process stand-in for the CI API.
///
/// Serves whatever pipelines, agents and logs were added, counting calls so
/// tests can assert how often the cache went upstream.
#[derive(Default)]
pub struct FakeUpstream {
  pipelines: Mutex<Vec<Value>>,
  agents: Mutex<Vec<Value>>,
  logs: Mutex<HashMap<String, String>>,
  failure: Mutex<Option<UpstreamError>>,
  delay: Duration,
  queries: AtomicUsize,
  resources: AtomicUsize,
}

impl FakeUpstream {
  pub fn new() -> Self {
    Self::default()
  }

  /// Answer every call only after `delay`.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  /// Adds a pipeline with `(number, state)` builds, newest first.
  pub fn add_pipeline(&self, slug: &str, visibility: Visibility, builds: &[(u64, &str)]) {
    let mut pipelines = self.pipelines.lock();
    let index = pipelines.len();
    let builds: Vec<Value> = builds
      .iter()
      .map(|(number, state)| json!({ "node": build_node(index, *number, state) }))
      .collect();
    pipelines.push(json!({
      "id": format!("pipeline-{slug}"),
      "slug": slug,
      "name": slug,
      "visibility": match visibility {
        Visibility::Public => "PUBLIC",
        Visibility::Private => "PRIVATE",
      },
      "repository": { "url": format!("https://github.com/{ORG}/{slug}") },
      "builds": { "edges": builds },
    }));
  }

  pub fn add_agent(&self, name: &str, queue: &str, busy: bool) {
    let mut agents = self.agents.lock();
    let uuid = format!("{:08x}-0000-4000-8000-000000000000", agents.len() + 1);
    agents.push(json!({
      "id": encode_node_id("Agent", &uuid),
      "uuid": uuid,
      "name": name,
      "connectionState": "CONNECTED",
      "metaData": [format!("queue={queue}")],
      "isRunningJob": busy,
    }));
  }

  pub fn add_log(&self, path: &str, body: &str) {
    self.logs.lock().insert(path.to_string(), body.to_string());
  }

  /// Fail every subsequent call with `failure`, or stop failing with `None`.
  pub fn fail_with(&self, failure: Option<UpstreamError>) {
    *self.failure.lock() = failure;
  }

  pub fn query_count(&self) -> usize {
    self.queries.load(Ordering::SeqCst)
  }

  pub fn resource_count(&self) -> usize {
    self.resources.load(Ordering::SeqCst)
  }

  async fn pause(&self) -> Result<(), UpstreamError> {
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    let failure = self.failure.lock().clone();
    match failure {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  fn find_pipeline(&self, full_slug: &str) -> Option<Value> {
    let slug = full_slug.strip_prefix(&format!("{ORG}/"))?;
    self.pipelines.lock().iter().find(|p| p["slug"] == slug).cloned()
  }

  /// Build node with its owning pipeline attached, as the build query returns it.
  fn find_build(&self, variables: &Value) -> Option<Value> {
    let pipelines = self.pipelines.lock();
    let mut candidates = pipelines.iter().flat_map(|p| {
      p["builds"]["edges"].as_array().into_iter().flatten().map(move |edge| {
        let mut node = edge["node"].clone();
        node["pipeline"] = json!({ "slug": p["slug"], "visibility": p["visibility"] });
        node
      })
    });

    if let Some(uuid) = variables["uuid"].as_str() {
      return candidates.find(|b| b["uuid"] == uuid);
    }
    let full = variables["slug"].as_str()?.strip_prefix(&format!("{ORG}/"))?;
    let (slug, number) = full.rsplit_once('/')?;
    let number: u64 = number.parse().ok()?;
    candidates.find(|b| b["pipeline"]["slug"] == slug && b["number"] == number)
  }
}

fn build_node(pipeline_index: usize, number: u64, state: &str) -> Value {
  let uuid = format!("{:08x}-0000-4000-8000-{:012}", pipeline_index + 1, number);
  json!({
    "id": encode_node_id("Build", &uuid),
    "uuid": uuid,
    "number": number,
    "state": state,
    "branch": "main",
    "createdAt": "2024-05-01T10:00:00Z",
    "jobs": { "edges": [
      { "node": {
        "id": encode_node_id("JobTypeCommand", &uuid),
        "uuid": uuid,
        "label": "build",
        "state": state,
      } }
    ] },
  })
}

#[async_trait]
impl UpstreamClient for FakeUpstream {
  async fn query(&self, request: GraphQlRequest) -> Result<Value, UpstreamError> {
    self.queries.fetch_add(1, Ordering::SeqCst);
    self.pause().await?;

    let vars = &request.variables;
    let data = match request.query {
      q if q == PIPELINES_QUERY => {
        let edges: Vec<Value> = self
          .pipelines
          .lock()
          .iter()
          .map(|p| json!({ "node": p }))
          .collect();
        json!({ "organization": { "pipelines": { "edges": edges } } })
      }
      q if q == PIPELINE_QUERY => {
        let slug = vars["slug"].as_str().unwrap_or_default();
        json!({ "pipeline": self.find_pipeline(slug) })
      }
      q if q == BUILD_QUERY => json!({ "build": self.find_build(vars) }),
      q if q == AGENTS_QUERY => {
        let edges: Vec<Value> = self.agents.lock().iter().map(|a| json!({ "node": a })).collect();
        json!({ "organization": { "agents": { "edges": edges } } })
      }
      other => return Err(UpstreamError::permanent(format!("unexpected query {other}"))),
    };
    Ok(data)
  }

  async fn fetch_resource(&self, path: &str) -> Result<Bytes, UpstreamError> {
    self.resources.fetch_add(1, Ordering::SeqCst);
    self.pause().await?;
    match self.logs.lock().get(path) {
      Some(body) => Ok(Bytes::from(body.clone())),
      None => Err(UpstreamError::permanent("HTTP 404 Not Found")),
    }
  }
}

/// Fast retry policy: three retries, millisecond backoff.
pub fn quick_retry() -> RetryPolicy {
  RetryPolicy {
    initial_delay: Duration::from_millis(1),
    max_delay: Duration::from_millis(5),
    ..RetryPolicy::default()
  }
}

/// Cached client over `fake`, with an in-memory store and a frozen clock.
pub fn cached_client(fake: Arc<FakeUpstream>) -> CachedCiClient {
  cached_client_with_clock(fake, Arc::new(ManualClock::new(Utc::now())))
}

pub fn cached_client_with_clock(fake: Arc<FakeUpstream>, clock: Arc<ManualClock>) -> CachedCiClient {
  let store = Arc::new(SqliteStore::open_in_memory().expect("in-memory store"));
  let cache = CacheLayer::new(store, clock, CacheSettings::default());
  CachedCiClient::new(fake, cache, quick_retry(), ORG)
}
