//! GitHub REST API client.
//!
//! Thin wrapper over reqwest: auth and version headers, bounded
//! per-request timeouts, conditional (If-None-Match) fetches, and status
//! mapping into the typed failure values the classifier understands.

use color_eyre::{eyre::eyre, Report, Result};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::jobs::{FetchPriority, Fetched};

use super::error::{NotFoundError, RateLimitError};

/// GitHub API client wrapper.
#[derive(Clone)]
pub struct GitHubClient {
  http: reqwest::Client,
  base_url: Url,
  token: Option<String>,
  foreground_timeout: Duration,
  background_timeout: Duration,
}

impl GitHubClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base_url = Url::parse(&config.github.api_url)
      .map_err(|e| eyre!("Invalid GitHub API URL {}: {}", config.github.api_url, e))?;

    let http = reqwest::Client::builder()
      .user_agent("hubsync")
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      token: Config::api_token(),
      foreground_timeout: Duration::from_secs(config.github.foreground_timeout_secs),
      background_timeout: Duration::from_secs(config.github.background_timeout_secs),
    })
  }

  /// Request timeout for a fetch. Foreground fetches sit on a reader's
  /// critical path and use the tighter bound.
  pub fn timeout(&self, priority: FetchPriority) -> Duration {
    match priority {
      FetchPriority::Foreground => self.foreground_timeout,
      FetchPriority::Background => self.background_timeout,
    }
  }

  fn request(&self, path: &str) -> Result<reqwest::RequestBuilder> {
    let url = self
      .base_url
      .join(path)
      .map_err(|e| eyre!("Invalid API path {}: {}", path, e))?;

    let mut req = self
      .http
      .get(url)
      .header("Accept", "application/vnd.github+json")
      .header("X-GitHub-Api-Version", "2022-11-28");

    if let Some(token) = &self.token {
      req = req.bearer_auth(token);
    }

    Ok(req)
  }

  /// Unconditional GET returning the JSON body.
  pub async fn get_json(&self, path: &str, timeout: Duration) -> Result<Value> {
    let resp = self
      .request(path)?
      .timeout(timeout)
      .send()
      .await
      .map_err(|e| eyre!("GitHub request {} failed: {}", path, e))?;

    let resp = check_status(path, resp)?;

    resp
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", path, e))
  }

  /// Conditional GET. Sends the stored etag as If-None-Match; a 304 means
  /// the cached entry is still current and no body was transferred.
  pub async fn get_conditional(
    &self,
    path: &str,
    etag: Option<&str>,
    timeout: Duration,
  ) -> Result<Fetched> {
    let mut req = self.request(path)?.timeout(timeout);
    if let Some(etag) = etag {
      req = req.header("If-None-Match", etag);
    }

    let resp = req
      .send()
      .await
      .map_err(|e| eyre!("GitHub request {} failed: {}", path, e))?;

    if resp.status() == StatusCode::NOT_MODIFIED {
      return Ok(Fetched::NotModified);
    }

    let resp = check_status(path, resp)?;
    let etag = resp
      .headers()
      .get(reqwest::header::ETAG)
      .and_then(|v| v.to_str().ok())
      .map(String::from);

    let data: Value = resp
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", path, e))?;

    Ok(Fetched::Fresh { data, etag })
  }
}

/// Map an error status into the typed failure values.
fn check_status(path: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
  let status = resp.status();

  if status == StatusCode::NOT_FOUND {
    return Err(Report::new(NotFoundError {
      path: path.to_string(),
    }));
  }

  // GitHub signals an exhausted limit as 403 or 429 with the rate-limit
  // headers present and zero remaining
  if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
    if let Some(0) = header_num::<u32>(&resp, "x-ratelimit-remaining") {
      return Err(Report::new(RateLimitError {
        reset_at: header_num::<i64>(&resp, "x-ratelimit-reset").unwrap_or(0),
        limit: header_num::<u32>(&resp, "x-ratelimit-limit").unwrap_or(0),
        used: header_num::<u32>(&resp, "x-ratelimit-used").unwrap_or(0),
      }));
    }
  }

  if !status.is_success() {
    return Err(eyre!("GitHub request {} failed with status {}", path, status));
  }

  Ok(resp)
}

fn header_num<T: std::str::FromStr>(resp: &reqwest::Response, name: &str) -> Option<T> {
  resp
    .headers()
    .get(name)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse().ok())
}
