//! Bounded exponential-backoff retry for upstream calls.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::UpstreamError;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
  fn is_transient(&self) -> bool;
}

impl Retryable for UpstreamError {
  fn is_transient(&self) -> bool {
    matches!(self, UpstreamError::Transient(_))
  }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  /// Retries after the initial attempt.
  pub max_retries: u32,
  /// Delay before the first retry.
  pub initial_delay: Duration,
  /// Upper bound for any single delay.
  pub max_delay: Duration,
  /// Multiplier for exponential backoff.
  pub multiplier: f64,
  /// Whether to add up to 25% jitter to delays.
  pub jitter: bool,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      initial_delay: Duration::from_millis(1000),
      max_delay: Duration::from_secs(300),
      multiplier: 2.0,
      jitter: false,
    }
  }
}

/// Retry section of the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  #[serde(default = "default_initial_delay_ms")]
  pub initial_delay_ms: u64,
  #[serde(default = "default_max_delay_ms")]
  pub max_delay_ms: u64,
  #[serde(default)]
  pub jitter: bool,
}

fn default_max_retries() -> u32 {
  3
}

fn default_initial_delay_ms() -> u64 {
  1000
}

fn default_max_delay_ms() -> u64 {
  300_000
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: default_max_retries(),
      initial_delay_ms: default_initial_delay_ms(),
      max_delay_ms: default_max_delay_ms(),
      jitter: false,
    }
  }
}

impl From<&RetryConfig> for RetryPolicy {
  fn from(config: &RetryConfig) -> Self {
    Self {
      max_retries: config.max_retries,
      initial_delay: Duration::from_millis(config.initial_delay_ms),
      max_delay: Duration::from_millis(config.max_delay_ms),
      jitter: config.jitter,
      ..Default::default()
    }
  }
}

impl RetryPolicy {
  /// Creates a policy that never retries.
  pub fn no_retry() -> Self {
    Self {
      max_retries: 0,
      ..Default::default()
    }
  }

  /// Delay before retry number `retry` (1-based). Zero for the initial attempt.
  pub fn delay_for_retry(&self, retry: u32) -> Duration {
    if retry == 0 {
      return Duration::ZERO;
    }

    let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
    let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
    let capped = base.min(self.max_delay.as_millis() as f64);
    let delay = Duration::from_millis(capped as u64);

    if self.jitter {
      let factor = 1.0 + (rand::random::<f64>() * 0.5 - 0.25);
      Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
    } else {
      delay
    }
  }

  /// Runs `operation` until it succeeds, fails permanently, or the retry
  /// budget is spent. The last error is returned unchanged.
  pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
  {
    let mut retry = 0;
    loop {
      match operation().await {
        Ok(value) => return Ok(value),
        Err(err) if !err.is_transient() => {
          debug!("Attempt {} failed permanently: {}", retry + 1, err);
          return Err(err);
        }
        Err(err) if retry >= self.max_retries => {
          debug!("Giving up after {} attempts: {}", retry + 1, err);
          return Err(err);
        }
        Err(err) => {
          retry += 1;
          let delay = self.delay_for_retry(retry);
          debug!("Attempt {} failed: {}; retrying in {:?}", retry, err, delay);
          tokio::time::sleep(delay).await;
        }
      }
    }
  }
}
