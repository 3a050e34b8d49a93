use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::UpstreamError;

use super::api_types::GraphQlRequest;

/// The two capabilities the cache needs from the CI platform.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
  /// Run a GraphQL query and return its `data` object.
  async fn query(&self, request: GraphQlRequest) -> Result<Value, UpstreamError>;

  /// GET a flat REST resource (relative to the REST base URL).
  async fn fetch_resource(&self, path: &str) -> Result<Bytes, UpstreamError>;
}

/// Connection settings for [`HttpUpstreamClient`].
#[derive(Debug, Clone)]
pub struct HttpClientSettings {
  pub graphql_url: Url,
  pub rest_url: Url,
  pub token: String,
  pub timeout: Duration,
}

/// CI API client over HTTPS
#[derive(Clone)]
pub struct HttpUpstreamClient {
  http: reqwest::Client,
  graphql_url: Url,
  rest_url: Url,
  token: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
  data: Option<Value>,
  #[serde(default)]
  errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
  message: String,
}

impl HttpUpstreamClient {
  pub fn new(settings: HttpClientSettings) -> Result<Self, UpstreamError> {
    let http = reqwest::Client::builder()
      .timeout(settings.timeout)
      .user_agent(concat!("buildboard/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| UpstreamError::permanent(format!("Failed to build HTTP client: {}", e)))?;

    // Url::join drops the last segment unless the base ends in '/'
    let mut rest_url = settings.rest_url;
    if !rest_url.path().ends_with('/') {
      rest_url.set_path(&format!("{}/", rest_url.path()));
    }

    Ok(Self {
      http,
      graphql_url: settings.graphql_url,
      rest_url,
      token: settings.token,
    })
  }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
  async fn query(&self, request: GraphQlRequest) -> Result<Value, UpstreamError> {
    debug!("GraphQL POST {}", self.graphql_url);
    let response = self
      .http
      .post(self.graphql_url.clone())
      .bearer_auth(&self.token)
      .json(&request)
      .send()
      .await
      .map_err(classify_transport)?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(classify_status(status, &body));
    }

    let body: GraphQlResponse = response
      .json()
      .await
      .map_err(|e| UpstreamError::permanent(format!("Invalid GraphQL response: {}", e)))?;

    if !body.errors.is_empty() {
      let messages: Vec<String> = body.errors.into_iter().map(|e| e.message).collect();
      return Err(UpstreamError::permanent(messages.join("; ")));
    }

    body
      .data
      .ok_or_else(|| UpstreamError::permanent("GraphQL response carried no data"))
  }

  async fn fetch_resource(&self, path: &str) -> Result<Bytes, UpstreamError> {
    let url = self
      .rest_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| UpstreamError::permanent(format!("Invalid resource path {}: {}", path, e)))?;

    debug!("REST GET {}", url);
    let response = self
      .http
      .get(url)
      .bearer_auth(&self.token)
      .send()
      .await
      .map_err(classify_transport)?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(classify_status(status, &body));
    }

    response.bytes().await.map_err(classify_transport)
  }
}

/// 429 and 5xx are worth retrying; any other non-success status is final.
fn classify_status(status: StatusCode, body: &str) -> UpstreamError {
  let message = if body.is_empty() {
    format!("HTTP {}", status)
  } else {
    format!("HTTP {}: {}", status, truncate(body, 200))
  };

  if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
    UpstreamError::Transient(message)
  } else {
    UpstreamError::Permanent(message)
  }
}

fn classify_transport(err: reqwest::Error) -> UpstreamError {
  if err.is_decode() || err.is_builder() {
    UpstreamError::permanent(err.to_string())
  } else {
    UpstreamError::transient(err.to_string())
  }
}

fn truncate(s: &str, max: usize) -> &str {
  match s.char_indices().nth(max) {
    Some((idx, _)) => &s[..idx],
    None => s,
  }
}
