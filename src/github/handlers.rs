//! Job handlers for the supported resource types.
//!
//! Each handler pairs a payload schema with the fetch call and cache-key
//! builder for one job type. Shareability is decided per type: a value may
//! only enter the shared namespace when it carries no viewer-specific
//! fields. Issue search stays per-user because queries can embed
//! viewer-scoped qualifiers (e.g. `involves:@me`); notifications are
//! inherently viewer-specific.

use async_trait::async_trait;
use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::jobs::{FetchPriority, Fetched, JobHandler, JobRegistry, JobSpec};

use super::client::GitHubClient;
use super::keys;

/// Registry with all built-in resource types.
pub fn default_registry(client: Arc<GitHubClient>) -> JobRegistry {
  let mut registry = JobRegistry::new();

  registry.register(
    "repo",
    JobSpec {
      handler: Arc::new(RepoHandler {
        client: Arc::clone(&client),
      }),
      shareable: true,
      user_ttl: None,
    },
  );
  registry.register(
    "issue",
    JobSpec {
      handler: Arc::new(IssueHandler {
        client: Arc::clone(&client),
      }),
      shareable: true,
      user_ttl: None,
    },
  );
  registry.register(
    "issue_comments",
    JobSpec {
      handler: Arc::new(IssueCommentsHandler {
        client: Arc::clone(&client),
      }),
      shareable: true,
      user_ttl: None,
    },
  );
  registry.register(
    "user_profile",
    JobSpec {
      handler: Arc::new(UserProfileHandler {
        client: Arc::clone(&client),
      }),
      shareable: true,
      user_ttl: None,
    },
  );
  registry.register(
    "issue_search",
    JobSpec {
      handler: Arc::new(IssueSearchHandler {
        client: Arc::clone(&client),
      }),
      shareable: false,
      user_ttl: Some(Duration::minutes(15)),
    },
  );
  registry.register(
    "notifications",
    JobSpec {
      handler: Arc::new(NotificationsHandler { client }),
      shareable: false,
      user_ttl: Some(Duration::minutes(5)),
    },
  );

  registry
}

fn parse_payload<T: DeserializeOwned>(payload: &Value) -> Result<T> {
  serde_json::from_value(payload.clone()).map_err(|e| eyre!("Malformed job payload: {}", e))
}

fn default_page() -> u64 {
  1
}

// ============================================================================
// Repository metadata
// ============================================================================

#[derive(Debug, Deserialize)]
struct RepoPayload {
  owner: String,
  repo: String,
}

struct RepoHandler {
  client: Arc<GitHubClient>,
}

#[async_trait]
impl JobHandler for RepoHandler {
  fn cache_key(&self, payload: &Value) -> Result<String> {
    let p: RepoPayload = parse_payload(payload)?;
    Ok(keys::repo(&p.owner, &p.repo))
  }

  async fn fetch(
    &self,
    payload: &Value,
    etag: Option<&str>,
    priority: FetchPriority,
  ) -> Result<Fetched> {
    let p: RepoPayload = parse_payload(payload)?;
    let path = format!("repos/{}/{}", p.owner, p.repo);
    self
      .client
      .get_conditional(&path, etag, self.client.timeout(priority))
      .await
  }
}

// ============================================================================
// Single issue (conditional GET: polling-heavy, 304s halve payload cost)
// ============================================================================

#[derive(Debug, Deserialize)]
struct IssuePayload {
  owner: String,
  repo: String,
  number: u64,
}

struct IssueHandler {
  client: Arc<GitHubClient>,
}

#[async_trait]
impl JobHandler for IssueHandler {
  fn cache_key(&self, payload: &Value) -> Result<String> {
    let p: IssuePayload = parse_payload(payload)?;
    Ok(keys::issue(&p.owner, &p.repo, p.number))
  }

  async fn fetch(
    &self,
    payload: &Value,
    etag: Option<&str>,
    priority: FetchPriority,
  ) -> Result<Fetched> {
    let p: IssuePayload = parse_payload(payload)?;
    let path = format!("repos/{}/{}/issues/{}", p.owner, p.repo, p.number);
    self
      .client
      .get_conditional(&path, etag, self.client.timeout(priority))
      .await
  }
}

// ============================================================================
// Issue comments, one page per job
// ============================================================================

#[derive(Debug, Deserialize)]
struct IssueCommentsPayload {
  owner: String,
  repo: String,
  number: u64,
  #[serde(default = "default_page")]
  page: u64,
}

struct IssueCommentsHandler {
  client: Arc<GitHubClient>,
}

#[async_trait]
impl JobHandler for IssueCommentsHandler {
  fn cache_key(&self, payload: &Value) -> Result<String> {
    let p: IssueCommentsPayload = parse_payload(payload)?;
    Ok(keys::issue_comments(&p.owner, &p.repo, p.number, p.page))
  }

  async fn fetch(
    &self,
    payload: &Value,
    _etag: Option<&str>,
    priority: FetchPriority,
  ) -> Result<Fetched> {
    let p: IssueCommentsPayload = parse_payload(payload)?;
    let path = format!(
      "repos/{}/{}/issues/{}/comments?page={}&per_page=50",
      p.owner, p.repo, p.number, p.page
    );
    let data = self
      .client
      .get_json(&path, self.client.timeout(priority))
      .await?;
    Ok(Fetched::Fresh { data, etag: None })
  }
}

// ============================================================================
// User profile
// ============================================================================

#[derive(Debug, Deserialize)]
struct UserProfilePayload {
  login: String,
}

struct UserProfileHandler {
  client: Arc<GitHubClient>,
}

#[async_trait]
impl JobHandler for UserProfileHandler {
  fn cache_key(&self, payload: &Value) -> Result<String> {
    let p: UserProfilePayload = parse_payload(payload)?;
    Ok(keys::user_profile(&p.login))
  }

  async fn fetch(
    &self,
    payload: &Value,
    etag: Option<&str>,
    priority: FetchPriority,
  ) -> Result<Fetched> {
    let p: UserProfilePayload = parse_payload(payload)?;
    let path = format!("users/{}", p.login);
    self
      .client
      .get_conditional(&path, etag, self.client.timeout(priority))
      .await
  }
}

// ============================================================================
// Issue search (per-user: queries may reference the viewer)
// ============================================================================

#[derive(Debug, Deserialize)]
struct IssueSearchPayload {
  query: String,
  #[serde(default = "default_page")]
  page: u64,
}

struct IssueSearchHandler {
  client: Arc<GitHubClient>,
}

#[async_trait]
impl JobHandler for IssueSearchHandler {
  fn cache_key(&self, payload: &Value) -> Result<String> {
    let p: IssueSearchPayload = parse_payload(payload)?;
    Ok(keys::issue_search(&p.query, p.page))
  }

  async fn fetch(
    &self,
    payload: &Value,
    _etag: Option<&str>,
    priority: FetchPriority,
  ) -> Result<Fetched> {
    let p: IssueSearchPayload = parse_payload(payload)?;
    let path = format!(
      "search/issues?q={}&page={}&per_page=50",
      urlencode(&p.query),
      p.page
    );
    let data = self
      .client
      .get_json(&path, self.client.timeout(priority))
      .await?;
    Ok(Fetched::Fresh { data, etag: None })
  }
}

// ============================================================================
// Notifications (viewer-specific by definition)
// ============================================================================

#[derive(Debug, Deserialize)]
struct NotificationsPayload {
  #[serde(default = "default_page")]
  page: u64,
}

struct NotificationsHandler {
  client: Arc<GitHubClient>,
}

#[async_trait]
impl JobHandler for NotificationsHandler {
  fn cache_key(&self, payload: &Value) -> Result<String> {
    let p: NotificationsPayload = parse_payload(payload)?;
    Ok(keys::notifications(p.page))
  }

  async fn fetch(
    &self,
    payload: &Value,
    _etag: Option<&str>,
    priority: FetchPriority,
  ) -> Result<Fetched> {
    let p: NotificationsPayload = parse_payload(payload)?;
    let path = format!("notifications?page={}&per_page=50", p.page);
    let data = self
      .client
      .get_json(&path, self.client.timeout(priority))
      .await?;
    Ok(Fetched::Fresh { data, etag: None })
  }
}

/// Percent-encode a search query for use in a query string.
fn urlencode(s: &str) -> String {
  url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use serde_json::json;

  fn registry() -> JobRegistry {
    let client = Arc::new(GitHubClient::new(&Config::default()).unwrap());
    default_registry(client)
  }

  #[test]
  fn test_cache_keys_from_payloads() {
    let registry = registry();

    let key = registry
      .get("issue")
      .unwrap()
      .handler
      .cache_key(&json!({"owner": "Rust-Lang", "repo": "rust", "number": 5}))
      .unwrap();
    assert_eq!(key, "issue:rust-lang/rust/5");

    let key = registry
      .get("issue_comments")
      .unwrap()
      .handler
      .cache_key(&json!({"owner": "o", "repo": "r", "number": 5}))
      .unwrap();
    // Page defaults to 1 and lives under the issue's prefix
    assert_eq!(key, "issue:o/r/5:comments:page=1");
  }

  #[test]
  fn test_malformed_payload_is_rejected() {
    let registry = registry();

    let result = registry
      .get("issue")
      .unwrap()
      .handler
      .cache_key(&json!({"owner": "o"}));
    assert!(result.is_err());
  }

  #[test]
  fn test_fetch_priority_selects_timeout() {
    let client = GitHubClient::new(&Config::default()).unwrap();

    // A slow upstream must not hold a waiting reader for the full
    // background budget
    assert_eq!(
      client.timeout(FetchPriority::Foreground),
      std::time::Duration::from_secs(10)
    );
    assert_eq!(
      client.timeout(FetchPriority::Background),
      std::time::Duration::from_secs(30)
    );
  }

  #[test]
  fn test_shareability_allowlist() {
    let registry = registry();

    assert!(registry.is_shareable("repo"));
    assert!(registry.is_shareable("issue"));
    assert!(registry.is_shareable("user_profile"));
    // Viewer-scoped types must never enter the shared namespace
    assert!(!registry.is_shareable("issue_search"));
    assert!(!registry.is_shareable("notifications"));
    assert!(!registry.is_shareable("unknown_type"));
  }
}
