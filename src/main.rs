use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use buildboard::auth::{Role, Session};
use buildboard::cache::{CacheLayer, ResourceKind, SqliteStore};
use buildboard::ci::{CachedCiClient, HttpUpstreamClient};
use buildboard::clock::{Clock, SystemClock};
use buildboard::config::Config;
use buildboard::dashboard::Dashboard;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "buildboard")]
#[command(about = "Cached, role-aware access to a CI/CD organization")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/buildboard/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the daily log file
  #[arg(long)]
  log_stderr: bool,

  /// Role to view data as
  #[arg(long = "as", value_parser = parse_role, default_value = "admin")]
  role: Role,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List pipelines
  Pipelines,
  /// Show one pipeline
  Pipeline { slug: String },
  /// List recent builds of a pipeline
  Builds { slug: String },
  /// Show a build by pipeline and number
  Build { slug: String, number: u64 },
  /// Show a build by its opaque id
  BuildId { id: String },
  /// Print the log of a job
  JobLog { slug: String, number: u64, job: String },
  /// List agents
  Agents,
  /// Show per-queue agent availability
  Queues,
  /// Refresh a resource kind from upstream, bypassing the cache
  Refresh {
    /// pipelines, builds, agents, queues or jobs
    kind: String,
    /// Pipeline slug, `slug/number`, build id, or `slug/number/job`
    target: Option<String>,
  },
  /// Print cache statistics
  Stats,
  /// Delete cache entries older than the retention window
  Sweep,
  /// Sweep periodically until interrupted
  Sweeper,
}

fn parse_role(s: &str) -> std::result::Result<Role, String> {
  match s.to_ascii_lowercase().as_str() {
    "anonymous" | "unauthenticated" => Ok(Role::Unauthenticated),
    "authenticated" => Ok(Role::Authenticated),
    "member" => Ok(Role::Member),
    "admin" => Ok(Role::Admin),
    other => Err(format!("unknown role {other}")),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let cache_path = config.cache_path()?;
  let _log_guard = init_logging(&cache_path, args.log_stderr)?;

  let dashboard = build_dashboard(&config, &cache_path)?;
  let session = operator_session(&config, args.role);
  let session = session.as_ref();

  match args.command {
    Command::Pipelines => print_json(&dashboard.list_pipelines(session).await?),
    Command::Pipeline { slug } => print_json(&dashboard.pipeline(session, &slug).await?),
    Command::Builds { slug } => print_json(&dashboard.builds(session, &slug).await?),
    Command::Build { slug, number } => print_json(&dashboard.build(session, &slug, number).await?),
    Command::BuildId { id } => print_json(&dashboard.build_by_id(session, &id).await?),
    Command::JobLog { slug, number, job } => {
      let log = dashboard.job_log(session, &slug, number, &job).await?;
      println!("{}", log.data.content);
      Ok(())
    }
    Command::Agents => print_json(&dashboard.agents(session).await?),
    Command::Queues => print_json(&dashboard.queues(session).await?),
    Command::Refresh { kind, target } => {
      let kind = ResourceKind::parse(&kind).ok_or_else(|| eyre!("Unknown resource kind: {}", kind))?;
      print_json(&dashboard.force_refresh(session, kind, target.as_deref()).await?)
    }
    Command::Stats => print_json(&dashboard.stats(session)?),
    Command::Sweep => {
      let removed = dashboard.client().cache().sweep(config.cache_settings().retention)?;
      print_json(&serde_json::json!({ "removed": removed }))
    }
    Command::Sweeper => {
      let interval = config.sweep_interval();
      info!("Sweeping every {:?}", interval);
      let sweeper = dashboard
        .client()
        .cache()
        .spawn_sweeper(interval, config.cache_settings().retention);
      tokio::signal::ctrl_c().await?;
      sweeper.abort();
      Ok(())
    }
  }
}

fn build_dashboard(config: &Config, cache_path: &Path) -> Result<Dashboard> {
  let token = Config::get_api_token()?;
  let upstream = HttpUpstreamClient::new(config.client_settings(token)?)?;
  let store = SqliteStore::open(cache_path)?;
  let cache = CacheLayer::new(Arc::new(store), Arc::new(SystemClock), config.cache_settings());
  let client = CachedCiClient::new(
    Arc::new(upstream),
    cache,
    config.retry_policy(),
    config.upstream.organization.clone(),
  );
  Ok(Dashboard::new(client))
}

/// The CLI runs on the operator's token; `--as` previews what a role sees.
fn operator_session(config: &Config, role: Role) -> Option<Session> {
  if role == Role::Unauthenticated {
    return None;
  }
  let access = config.access();
  let organizations: BTreeSet<String> = if role.has_permission(Role::Member) {
    [access.organization.clone()].into()
  } else {
    Default::default()
  };
  let teams: BTreeSet<String> = if role == Role::Admin {
    access.admin_teams.clone()
  } else {
    Default::default()
  };
  Some(Session {
    user: "cli".to_string(),
    organizations,
    team_memberships: teams,
    role,
    expires_at: SystemClock.now() + chrono::Duration::hours(1),
    last_used: None,
  })
}

fn init_logging(cache_path: &Path, to_stderr: bool) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("BUILDBOARD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  if to_stderr {
    tracing_subscriber::registry()
      .with(filter)
      .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
      .try_init()
      .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
    return Ok(None);
  }

  let log_dir = cache_path
    .parent()
    .map(Path::to_path_buf)
    .unwrap_or_else(|| PathBuf::from("."));
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;
  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "buildboard.log"));

  tracing_subscriber::registry()
    .with(filter)
    .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
  Ok(Some(guard))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
