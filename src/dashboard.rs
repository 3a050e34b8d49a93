//! Route handlers shared by every front end.
//!
//! Each handler runs the coarse role check first, then reads through the
//! cache, then applies the visibility filter to what came back. A resource
//! the caller may not see is reported as [`ViewError::NotFound`], exactly like
//! one that does not exist.

use tracing::debug;

use crate::auth::{filter_list, precheck, reveal, AuthDecision, Role, Session, Visible};
use crate::cache::{CacheResult, CacheStats, ResourceKind};
use crate::ci::ids;
use crate::ci::{Agent, Build, CachedCiClient, JobLog, Pipeline, QueueStatus, Refreshed};
use crate::error::{CoreError, ViewError};

pub type ViewResult<T> = Result<T, ViewError>;

#[derive(Clone)]
pub struct Dashboard {
  client: CachedCiClient,
}

impl Dashboard {
  pub fn new(client: CachedCiClient) -> Self {
    Self { client }
  }

  pub fn client(&self) -> &CachedCiClient {
    &self.client
  }

  /// Role the request runs with, or why it may not run at all.
  fn authorize(&self, session: Option<&Session>, required: Role) -> ViewResult<Role> {
    match precheck(session, required, self.client.cache().now()) {
      AuthDecision::Unauthorized(reason) => {
        debug!("Denied {} route: {}", required, reason);
        Err(ViewError::Unauthorized(reason))
      }
      decision => Ok(decision.role()),
    }
  }

  /// Pipelines the caller may see, in upstream order.
  pub async fn list_pipelines(&self, session: Option<&Session>) -> ViewResult<CacheResult<Vec<Pipeline>>> {
    let role = self.authorize(session, Role::Unauthenticated)?;
    let result = self.client.pipelines().await?;
    Ok(result.map(|pipelines| filter_list(role, pipelines)))
  }

  pub async fn pipeline(&self, session: Option<&Session>, slug: &str) -> ViewResult<CacheResult<Pipeline>> {
    let role = self.authorize(session, Role::Unauthenticated)?;
    revealed(role, self.client.pipeline(slug).await?)
  }

  /// Recent builds of a pipeline. A hidden pipeline has no builds list at
  /// all rather than an empty one.
  pub async fn builds(&self, session: Option<&Session>, slug: &str) -> ViewResult<CacheResult<Vec<Build>>> {
    let role = self.authorize(session, Role::Unauthenticated)?;
    // The builds refresh also caches the pipeline, so the gate below is a hit.
    let builds = self.client.builds(slug).await?;
    revealed(role, self.client.pipeline(slug).await?)?;

    let CacheResult {
      data,
      source,
      fetched_at,
    } = builds;
    let data = data.ok_or(ViewError::NotFound)?;
    Ok(CacheResult {
      data: filter_list(role, data),
      source,
      fetched_at,
    })
  }

  pub async fn build(&self, session: Option<&Session>, slug: &str, number: u64) -> ViewResult<CacheResult<Build>> {
    let role = self.authorize(session, Role::Unauthenticated)?;
    revealed(role, self.client.build(slug, number).await?)
  }

  /// A build by opaque id. An id that names no build is not found.
  pub async fn build_by_id(&self, session: Option<&Session>, id: &str) -> ViewResult<CacheResult<Build>> {
    let role = self.authorize(session, Role::Unauthenticated)?;
    match self.client.build_by_id(id).await {
      Ok(result) => revealed(role, result),
      Err(CoreError::InvalidId(err)) => {
        debug!("Rejected build id {:?}: {}", id, err);
        Err(ViewError::NotFound)
      }
      Err(err) => Err(err.into()),
    }
  }

  /// Log of one job, gated on the visibility of its build.
  pub async fn job_log(
    &self,
    session: Option<&Session>,
    slug: &str,
    number: u64,
    job_id: &str,
  ) -> ViewResult<CacheResult<JobLog>> {
    let role = self.authorize(session, Role::Unauthenticated)?;
    let build = revealed(role, self.client.build(slug, number).await?)?;
    let job_uuid = ids::parse_job_id(job_id).map_err(|_| ViewError::NotFound)?;
    if build.data.job(&job_uuid).is_none() {
      return Err(ViewError::NotFound);
    }
    Ok(self.client.job_log(slug, number, &job_uuid).await?)
  }

  pub async fn agents(&self, session: Option<&Session>) -> ViewResult<CacheResult<Vec<Agent>>> {
    self.authorize(session, Role::Member)?;
    Ok(self.client.agents().await?)
  }

  pub async fn queues(&self, session: Option<&Session>) -> ViewResult<CacheResult<Vec<QueueStatus>>> {
    self.authorize(session, Role::Member)?;
    Ok(self.client.queues().await?)
  }

  /// Bypass the cache for `kind`, optionally narrowed to one target.
  pub async fn force_refresh(
    &self,
    session: Option<&Session>,
    kind: ResourceKind,
    target: Option<&str>,
  ) -> ViewResult<Refreshed> {
    self.authorize(session, Role::Admin)?;
    Ok(self.client.refresh_kind(kind, target).await?)
  }

  pub fn stats(&self, session: Option<&Session>) -> ViewResult<CacheStats> {
    self.authorize(session, Role::Admin)?;
    Ok(self.client.stats()?)
  }
}

fn revealed<R: Visible>(role: Role, result: CacheResult<Option<R>>) -> ViewResult<CacheResult<R>> {
  let CacheResult {
    data,
    source,
    fetched_at,
  } = result;
  let data = reveal(role, data).map_err(|_| ViewError::NotFound)?;
  Ok(CacheResult {
    data,
    source,
    fetched_at,
  })
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeSet;
  use std::sync::Arc;

  use chrono::{Duration, Utc};

  use super::*;
  use crate::auth::{AccessConfig, UnauthorizedReason, Visibility};
  use crate::cache::CacheSource;
  use crate::clock::{Clock, ManualClock};
  use crate::test_support::{cached_client_with_clock, FakeUpstream, ORG};

  struct Fixture {
    dashboard: Dashboard,
    fake: Arc<FakeUpstream>,
    clock: Arc<ManualClock>,
  }

  fn fixture() -> Fixture {
    let fake = Arc::new(FakeUpstream::new());
    fake.add_pipeline("a", Visibility::Public, &[(1, "PASSED")]);
    fake.add_pipeline("b", Visibility::Private, &[(7, "FAILED")]);
    fake.add_pipeline("c", Visibility::Public, &[]);
    fake.add_agent("builder-1", "linux", false);
    let clock = Arc::new(ManualClock::new(Utc::now()));
    Fixture {
      dashboard: Dashboard::new(cached_client_with_clock(fake.clone(), clock.clone())),
      fake,
      clock,
    }
  }

  fn session(clock: &ManualClock, orgs: &[&str], teams: &[&str]) -> Session {
    let access = AccessConfig {
      organization: ORG.to_string(),
      admin_teams: BTreeSet::from(["ops".to_string()]),
    };
    Session::login(
      "ada",
      orgs.iter().map(|s| s.to_string()).collect(),
      teams.iter().map(|s| s.to_string()).collect(),
      &access,
      clock.now() + Duration::hours(1),
    )
  }

  fn slugs(pipelines: &[Pipeline]) -> Vec<&str> {
    pipelines.iter().map(|p| p.slug.as_str()).collect()
  }

  #[tokio::test]
  async fn test_member_cold_then_warm() {
    let f = fixture();
    let member = session(&f.clock, &[ORG], &[]);

    let cold = f.dashboard.list_pipelines(Some(&member)).await.unwrap();
    assert_eq!(cold.source, CacheSource::Network);
    assert_eq!(slugs(&cold.data), ["a", "b", "c"]);
    assert_eq!(f.fake.query_count(), 1);

    let warm = f.dashboard.list_pipelines(Some(&member)).await.unwrap();
    assert_eq!(warm.source, CacheSource::CacheFresh);
    assert_eq!(warm.data, cold.data);
    assert_eq!(f.fake.query_count(), 1);
  }

  #[tokio::test]
  async fn test_list_filtering_keeps_order() {
    let f = fixture();
    let outsider = session(&f.clock, &["elsewhere"], &[]);

    let anonymous = f.dashboard.list_pipelines(None).await.unwrap();
    let authenticated = f.dashboard.list_pipelines(Some(&outsider)).await.unwrap();
    assert_eq!(slugs(&anonymous.data), ["a", "c"]);
    assert_eq!(slugs(&authenticated.data), ["a", "c"]);
  }

  #[tokio::test]
  async fn test_hidden_and_missing_are_indistinguishable() {
    let f = fixture();
    let outsider = session(&f.clock, &["elsewhere"], &[]);
    let s = Some(&outsider);

    let private = f.dashboard.pipeline(s, "b").await.unwrap_err();
    let missing = f.dashboard.pipeline(s, "q").await.unwrap_err();
    assert_eq!(private, ViewError::NotFound);
    assert_eq!(private, missing);

    assert_eq!(f.dashboard.builds(s, "b").await.unwrap_err(), ViewError::NotFound);
    assert_eq!(f.dashboard.builds(s, "q").await.unwrap_err(), ViewError::NotFound);
    assert_eq!(f.dashboard.build(s, "b", 7).await.unwrap_err(), ViewError::NotFound);
    assert_eq!(f.dashboard.build(s, "b", 99).await.unwrap_err(), ViewError::NotFound);
  }

  #[tokio::test]
  async fn test_member_sees_private_pipeline_and_builds() {
    let f = fixture();
    let member = session(&f.clock, &[ORG], &[]);

    let pipeline = f.dashboard.pipeline(Some(&member), "b").await.unwrap();
    assert_eq!(pipeline.data.visibility, Visibility::Private);
    let builds = f.dashboard.builds(Some(&member), "b").await.unwrap();
    assert_eq!(builds.data.len(), 1);

    let by_id = f
      .dashboard
      .build_by_id(Some(&member), &builds.data[0].id)
      .await
      .unwrap();
    assert_eq!(by_id.data.number, 7);
  }

  #[tokio::test]
  async fn test_malformed_build_id_is_not_found() {
    let f = fixture();
    let err = f.dashboard.build_by_id(None, "not an id").await.unwrap_err();
    assert_eq!(err, ViewError::NotFound);
    assert_eq!(f.fake.query_count(), 0);
  }

  #[tokio::test]
  async fn test_job_log_follows_build_visibility() {
    let f = fixture();
    let member = session(&f.clock, &[ORG], &[]);
    let build = f.dashboard.build(Some(&member), "b", 7).await.unwrap().data;
    let job = build.jobs[0].clone();
    f.fake.add_log(
      &format!("organizations/{ORG}/pipelines/b/builds/7/jobs/{}/log", job.uuid),
      "compiling...",
    );

    assert_eq!(
      f.dashboard.job_log(None, "b", 7, &job.id).await.unwrap_err(),
      ViewError::NotFound
    );
    let log = f.dashboard.job_log(Some(&member), "b", 7, &job.id).await.unwrap();
    assert_eq!(log.data.content, "compiling...");

    let stranger = "0190a4b2-5c3e-4e7a-9d1f-2b3c4d5e6f70";
    assert_eq!(
      f.dashboard.job_log(Some(&member), "b", 7, stranger).await.unwrap_err(),
      ViewError::NotFound
    );
  }

  #[tokio::test]
  async fn test_agents_require_member() {
    let f = fixture();
    let outsider = session(&f.clock, &["elsewhere"], &[]);

    assert_eq!(
      f.dashboard.agents(None).await.unwrap_err(),
      ViewError::Unauthorized(UnauthorizedReason::NoSession)
    );
    assert_eq!(
      f.dashboard.queues(Some(&outsider)).await.unwrap_err(),
      ViewError::Unauthorized(UnauthorizedReason::InsufficientRole {
        required: Role::Member,
        actual: Role::Authenticated,
      })
    );
    assert_eq!(f.fake.query_count(), 0);

    let member = session(&f.clock, &[ORG], &[]);
    let queues = f.dashboard.queues(Some(&member)).await.unwrap();
    assert_eq!(queues.data[0].name, "linux");
  }

  #[tokio::test]
  async fn test_expired_session_is_rejected_or_anonymous() {
    let f = fixture();
    let member = session(&f.clock, &[ORG], &[]);
    f.clock.advance(Duration::hours(2));

    assert_eq!(
      f.dashboard.agents(Some(&member)).await.unwrap_err(),
      ViewError::Unauthorized(UnauthorizedReason::Expired)
    );
    let listed = f.dashboard.list_pipelines(Some(&member)).await.unwrap();
    assert_eq!(slugs(&listed.data), ["a", "c"]);
  }

  #[tokio::test]
  async fn test_admin_routes() {
    let f = fixture();
    let member = session(&f.clock, &[ORG], &[]);
    let admin = session(&f.clock, &[ORG], &["ops"]);

    assert!(matches!(
      f.dashboard.stats(Some(&member)).unwrap_err(),
      ViewError::Unauthorized(UnauthorizedReason::InsufficientRole { .. })
    ));
    assert!(f
      .dashboard
      .force_refresh(Some(&member), ResourceKind::Pipeline, None)
      .await
      .is_err());

    let refreshed = f
      .dashboard
      .force_refresh(Some(&admin), ResourceKind::Pipeline, None)
      .await
      .unwrap();
    assert!(matches!(refreshed, Refreshed::Pipelines(ref p) if p.len() == 3));

    let stats = f.dashboard.stats(Some(&admin)).unwrap();
    assert_eq!(stats.entry_counts[&ResourceKind::Pipeline], 4);
    assert!(stats.last_refresh.contains_key(&ResourceKind::Build));
  }

  #[tokio::test(start_paused = true)]
  async fn test_upstream_outage_surfaces_as_upstream_error() {
    let f = fixture();
    f.fake.fail_with(Some(crate::error::UpstreamError::transient("503")));
    let err = f.dashboard.list_pipelines(None).await.unwrap_err();
    assert_eq!(
      err,
      ViewError::Upstream(CoreError::UpstreamUnavailable("503".into()))
    );
  }
}
