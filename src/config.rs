use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::auth::AccessConfig;
use crate::cache::{CacheSettings, SqliteStore, TtlConfig};
use crate::ci::HttpClientSettings;
use crate::retry::{RetryConfig, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub upstream: UpstreamConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub access: AccessSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
  #[serde(default = "default_graphql_url")]
  pub graphql_url: String,
  #[serde(default = "default_rest_url")]
  pub rest_url: String,
  /// Organization slug every query is scoped to
  pub organization: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_graphql_url() -> String {
  "https://graphql.buildkite.com/v1".to_string()
}

fn default_rest_url() -> String {
  "https://api.buildkite.com/v2/".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Database file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
  #[serde(default)]
  pub ttl: TtlConfig,
  #[serde(default = "default_retention_hours")]
  pub retention_hours: u64,
  #[serde(default = "default_sweep_interval_secs")]
  pub sweep_interval_secs: u64,
}

fn default_retention_hours() -> u64 {
  24 * 7
}

fn default_sweep_interval_secs() -> u64 {
  3600
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      ttl: TtlConfig::default(),
      retention_hours: default_retention_hours(),
      sweep_interval_secs: default_sweep_interval_secs(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessSection {
  /// Team slugs (within the organization) whose members are admins
  #[serde(default, deserialize_with = "deserialize_lowercase_set")]
  pub admin_teams: BTreeSet<String>,
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./buildboard.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/buildboard/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/buildboard/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("buildboard.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("buildboard").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.upstream.organization.trim().is_empty() {
      return Err(eyre!("upstream.organization must not be empty"));
    }
    Ok(config)
  }

  /// Get the CI API token from environment variables.
  ///
  /// Checks BUILDBOARD_API_TOKEN first, then BUILDKITE_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("BUILDBOARD_API_TOKEN")
      .or_else(|_| std::env::var("BUILDKITE_API_TOKEN"))
      .map_err(|_| {
        eyre!(
          "CI API token not found. Set BUILDBOARD_API_TOKEN or BUILDKITE_API_TOKEN environment variable."
        )
      })
  }

  pub fn cache_path(&self) -> Result<PathBuf> {
    self
      .cache
      .path
      .clone()
      .or_else(SqliteStore::default_path)
      .ok_or_else(|| eyre!("No data directory found; set cache.path in the config file"))
  }

  /// Retention beyond what chrono can represent is clamped to the maximum.
  pub fn cache_settings(&self) -> CacheSettings {
    let retention = i64::try_from(self.cache.retention_hours)
      .ok()
      .and_then(chrono::Duration::try_hours)
      .unwrap_or(chrono::Duration::MAX);
    CacheSettings {
      ttl: self.cache.ttl.clone(),
      retention,
    }
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.cache.sweep_interval_secs.max(1))
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy::from(&self.retry)
  }

  pub fn access(&self) -> AccessConfig {
    AccessConfig {
      organization: self.upstream.organization.clone(),
      admin_teams: self.access.admin_teams.clone(),
    }
  }

  pub fn client_settings(&self, token: String) -> Result<HttpClientSettings> {
    let graphql_url = Url::parse(&self.upstream.graphql_url)
      .map_err(|e| eyre!("Invalid upstream.graphql_url {}: {}", self.upstream.graphql_url, e))?;
    let rest_url = Url::parse(&self.upstream.rest_url)
      .map_err(|e| eyre!("Invalid upstream.rest_url {}: {}", self.upstream.rest_url, e))?;
    Ok(HttpClientSettings {
      graphql_url,
      rest_url,
      token,
      timeout: Duration::from_secs(self.upstream.timeout_secs),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("upstream:\n  organization: divvun\n").unwrap();

    assert_eq!(config.upstream.graphql_url, "https://graphql.buildkite.com/v1");
    assert_eq!(config.cache.ttl, TtlConfig::default());
    assert_eq!(config.cache_settings().retention, chrono::Duration::days(7));
    assert_eq!(config.retry_policy(), RetryPolicy::default());
    assert_eq!(config.access().organization, "divvun");
    assert!(config.access().admin_teams.is_empty());
  }

  #[test]
  fn test_full_config() {
    let config = Config::parse(
      r#"
upstream:
  organization: divvun
  rest_url: http://localhost:9000/v2/
  timeout_secs: 5
cache:
  path: /tmp/bb.db
  ttl:
    builds: 10
  retention_hours: 48
retry:
  max_retries: 1
  initial_delay_ms: 50
access:
  admin_teams: [Ops, infra]
"#,
    )
    .unwrap();

    assert_eq!(config.cache_path().unwrap(), PathBuf::from("/tmp/bb.db"));
    assert_eq!(config.cache.ttl.builds, 10);
    assert_eq!(config.cache.ttl.pipelines, 60);
    assert_eq!(config.cache_settings().retention, chrono::Duration::hours(48));
    assert_eq!(config.retry_policy().max_retries, 1);
    assert_eq!(config.retry_policy().initial_delay, Duration::from_millis(50));
    assert_eq!(
      config.access().admin_teams,
      BTreeSet::from(["ops".to_string(), "infra".to_string()])
    );

    let settings = config.client_settings("t".into()).unwrap();
    assert_eq!(settings.rest_url.as_str(), "http://localhost:9000/v2/");
    assert_eq!(settings.timeout, Duration::from_secs(5));
  }

  #[test]
  fn test_huge_retention_is_clamped() {
    let config = Config::parse(
      "upstream:\n  organization: divvun\ncache:\n  retention_hours: 18446744073709551615\n",
    )
    .unwrap();
    assert_eq!(config.cache_settings().retention, chrono::Duration::MAX);

    let config = Config::parse(&format!(
      "upstream:\n  organization: divvun\ncache:\n  retention_hours: {}\n",
      i64::MAX / 3600
    ))
    .unwrap();
    assert_eq!(config.cache_settings().retention, chrono::Duration::MAX);
  }

  #[test]
  fn test_organization_is_required() {
    assert!(Config::parse("upstream: {}\n").is_err());
    assert!(Config::parse("upstream:\n  organization: ' '\n").is_err());
  }
}
