use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::{Visibility, Visible};

/// Pipeline summary for list views
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
  pub id: String,
  pub slug: String,
  pub name: String,
  pub description: Option<String>,
  pub repository: Option<String>,
  pub default_branch: Option<String>,
  pub visibility: Visibility,
  pub url: Option<String>,
  /// Aggregated over the builds fetched alongside the pipeline
  pub build_counts: BuildCounts,
  pub latest_build: Option<BuildSummary>,
}

/// Build states as reported upstream, lowercased
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
  Scheduled,
  Running,
  Passed,
  Failed,
  Blocked,
  Canceling,
  Canceled,
  Skipped,
  NotRun,
  Failing,
  #[serde(other)]
  Unknown,
}

impl BuildState {
  pub fn parse(s: &str) -> Self {
    match s.to_ascii_lowercase().as_str() {
      "scheduled" | "creating" => Self::Scheduled,
      "running" | "started" => Self::Running,
      "passed" => Self::Passed,
      "failed" => Self::Failed,
      "blocked" => Self::Blocked,
      "canceling" => Self::Canceling,
      "canceled" | "cancelled" => Self::Canceled,
      "skipped" => Self::Skipped,
      "not_run" => Self::NotRun,
      "failing" => Self::Failing,
      _ => Self::Unknown,
    }
  }

  pub fn is_finished(self) -> bool {
    matches!(
      self,
      Self::Passed | Self::Failed | Self::Canceled | Self::Skipped | Self::NotRun
    )
  }
}

/// Derived per-pipeline build tallies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCounts {
  pub total: u32,
  pub passed: u32,
  pub failed: u32,
  pub running: u32,
  pub scheduled: u32,
  pub other: u32,
}

impl BuildCounts {
  pub fn tally<'a>(builds: impl IntoIterator<Item = &'a Build>) -> Self {
    let mut counts = Self::default();
    for build in builds {
      counts.total += 1;
      match build.state {
        BuildState::Passed => counts.passed += 1,
        BuildState::Failed | BuildState::Failing => counts.failed += 1,
        BuildState::Running | BuildState::Canceling => counts.running += 1,
        BuildState::Scheduled | BuildState::Blocked => counts.scheduled += 1,
        _ => counts.other += 1,
      }
    }
    counts
  }
}

/// Compact build reference embedded in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSummary {
  pub number: u64,
  pub state: BuildState,
  pub branch: Option<String>,
  pub created_at: Option<DateTime<Utc>>,
}

/// Full build with its jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
  /// Opaque GraphQL id
  pub id: String,
  pub uuid: String,
  pub number: u64,
  pub pipeline_slug: String,
  /// Inherited from the owning pipeline
  pub visibility: Visibility,
  pub state: BuildState,
  pub branch: Option<String>,
  pub commit: Option<String>,
  pub message: Option<String>,
  pub url: Option<String>,
  pub created_at: Option<DateTime<Utc>>,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
  pub jobs: Vec<Job>,
}

impl Build {
  pub fn summary(&self) -> BuildSummary {
    BuildSummary {
      number: self.number,
      state: self.state,
      branch: self.branch.clone(),
      created_at: self.created_at,
    }
  }

  pub fn job(&self, uuid: &str) -> Option<&Job> {
    self.jobs.iter().find(|job| job.uuid == uuid)
  }
}

/// A command step within a build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
  pub id: String,
  pub uuid: String,
  pub label: Option<String>,
  pub state: String,
  pub exit_status: Option<String>,
  pub agent_name: Option<String>,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
}

/// Raw log output of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
  pub job_uuid: String,
  pub content: String,
}

/// Connected build agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
  pub id: String,
  pub uuid: String,
  pub name: String,
  pub hostname: Option<String>,
  pub connection_state: String,
  pub version: Option<String>,
  /// From the `queue=<name>` meta-data tag
  pub queue: String,
  pub is_running_job: bool,
  pub current_job_id: Option<String>,
}

impl Agent {
  pub fn is_connected(&self) -> bool {
    self.connection_state.eq_ignore_ascii_case("connected")
  }
}

/// Per-queue agent availability, derived from the agent list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
  pub name: String,
  pub connected: u32,
  pub busy: u32,
  pub idle: u32,
}

impl QueueStatus {
  /// Groups connected agents by queue, sorted by queue name.
  pub fn from_agents(agents: &[Agent]) -> Vec<QueueStatus> {
    let mut queues: std::collections::BTreeMap<&str, QueueStatus> = Default::default();
    for agent in agents.iter().filter(|a| a.is_connected()) {
      let entry = queues.entry(agent.queue.as_str()).or_insert_with(|| QueueStatus {
        name: agent.queue.clone(),
        connected: 0,
        busy: 0,
        idle: 0,
      });
      entry.connected += 1;
      if agent.is_running_job {
        entry.busy += 1;
      } else {
        entry.idle += 1;
      }
    }
    queues.into_values().collect()
  }
}

impl Visible for Pipeline {
  fn visibility(&self) -> Visibility {
    self.visibility
  }
}

impl Visible for Build {
  fn visibility(&self) -> Visibility {
    self.visibility
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn agent(name: &str, queue: &str, state: &str, busy: bool) -> Agent {
    Agent {
      id: name.into(),
      uuid: name.into(),
      name: name.into(),
      hostname: None,
      connection_state: state.into(),
      version: None,
      queue: queue.into(),
      is_running_job: busy,
      current_job_id: None,
    }
  }

  #[test]
  fn test_queue_status_groups_connected_agents() {
    let agents = vec![
      agent("a1", "linux", "connected", true),
      agent("a2", "linux", "connected", false),
      agent("a3", "macos", "connected", false),
      agent("a4", "macos", "disconnected", true),
    ];

    let queues = QueueStatus::from_agents(&agents);
    assert_eq!(
      queues,
      vec![
        QueueStatus {
          name: "linux".into(),
          connected: 2,
          busy: 1,
          idle: 1
        },
        QueueStatus {
          name: "macos".into(),
          connected: 1,
          busy: 0,
          idle: 1
        },
      ]
    );
  }

  #[test]
  fn test_build_state_parse() {
    assert_eq!(BuildState::parse("PASSED"), BuildState::Passed);
    assert_eq!(BuildState::parse("cancelled"), BuildState::Canceled);
    assert_eq!(BuildState::parse("weird"), BuildState::Unknown);
    assert!(BuildState::Failed.is_finished());
    assert!(!BuildState::Running.is_finished());
  }
}
