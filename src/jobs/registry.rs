//! Job-type dispatch registry.
//!
//! Adding a resource type is a data addition: register a handler together
//! with its shareable flag and TTL, and the orchestrator and drainer stay
//! generic.

use async_trait::async_trait;
use chrono::Duration;
use color_eyre::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Whether a caller is waiting on a fetch. Selects the request timeout:
/// foreground fetches stay tight so a slow upstream cannot stall a read,
/// background refreshes get a more generous bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPriority {
  /// A reader is blocked on the result (cold miss, forced refresh)
  Foreground,
  /// A drain-loop refresh; no caller is waiting
  Background,
}

/// Result of a remote fetch performed for a job.
#[derive(Debug, Clone)]
pub enum Fetched {
  /// Upstream reported the cached entry is still current (304)
  NotModified,
  /// A full response body, with its ETag when upstream sent one
  Fresh { data: Value, etag: Option<String> },
}

/// Fetch logic for one job type.
///
/// `cache_key` errors mean a malformed payload; the job is dropped since
/// retrying cannot fix it.
#[async_trait]
pub trait JobHandler: Send + Sync {
  /// Cache key for this job's payload.
  fn cache_key(&self, payload: &Value) -> Result<String>;

  /// Fetch the resource, conditionally when a stored etag is supplied.
  async fn fetch(&self, payload: &Value, etag: Option<&str>, priority: FetchPriority)
    -> Result<Fetched>;
}

/// Per-type configuration: handler, shareability, per-user TTL.
pub struct JobSpec {
  pub handler: Arc<dyn JobHandler>,
  /// Whether cached values may be reused across users. Only true for data
  /// with no viewer-specific fields.
  pub shareable: bool,
  /// TTL for the per-user namespace; None means long-lived, invalidation
  /// handles correctness.
  pub user_ttl: Option<Duration>,
}

/// Registry mapping job-type tags to their specs. Populated at startup.
#[derive(Default)]
pub struct JobRegistry {
  specs: HashMap<String, JobSpec>,
}

impl JobRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, job_type: impl Into<String>, spec: JobSpec) {
    self.specs.insert(job_type.into(), spec);
  }

  pub fn get(&self, job_type: &str) -> Option<&JobSpec> {
    self.specs.get(job_type)
  }

  /// Whether a job type's data may live in the shared namespace.
  /// Unknown types are never shareable.
  pub fn is_shareable(&self, job_type: &str) -> bool {
    self.specs.get(job_type).map(|s| s.shareable).unwrap_or(false)
  }

  pub fn user_ttl(&self, job_type: &str) -> Option<Duration> {
    self.specs.get(job_type).and_then(|s| s.user_ttl)
  }
}
