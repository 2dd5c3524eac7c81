//! Opportunistic job drainer.
//!
//! Draining piggybacks on read traffic: the orchestrator calls `trigger`
//! after enqueuing, and the drainer claims and executes small bounded
//! batches until a round comes back empty. Failures here only affect
//! future freshness, never a waiting reader.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::github::error::{classify, ErrorClass};
use crate::store::{CacheStore, Namespace};

use super::registry::{FetchPriority, Fetched, JobRegistry};
use super::{JobTable, SyncJob};

/// Tuning for the drain loop.
#[derive(Debug, Clone)]
pub struct DrainConfig {
  /// Jobs claimed per round
  pub batch_size: usize,
  /// Rounds per trigger; bounds worst-case background work
  pub max_rounds: usize,
  /// Running jobs older than this are treated as abandoned
  pub running_timeout: Duration,
}

impl Default for DrainConfig {
  fn default() -> Self {
    Self {
      batch_size: 4,
      max_rounds: 3,
      running_timeout: Duration::minutes(2),
    }
  }
}

/// Claims due jobs for a user, executes them, and applies the results to
/// the cache store.
pub struct Drainer<S, J> {
  store: Arc<S>,
  jobs: Arc<J>,
  registry: Arc<JobRegistry>,
  config: DrainConfig,
  /// TTL applied to shared-namespace writes
  shared_ttl: Duration,
  /// Users with a drain loop currently in flight. Process-local; an
  /// optimization only, since claiming is already race-safe.
  in_flight: Mutex<HashSet<String>>,
}

impl<S, J> Drainer<S, J>
where
  S: CacheStore + 'static,
  J: JobTable + 'static,
{
  pub fn new(
    store: Arc<S>,
    jobs: Arc<J>,
    registry: Arc<JobRegistry>,
    config: DrainConfig,
    shared_ttl: Duration,
  ) -> Self {
    Self {
      store,
      jobs,
      registry,
      config,
      shared_ttl,
      in_flight: Mutex::new(HashSet::new()),
    }
  }

  /// Start a background drain loop for a user, unless one is already in
  /// flight. Returns immediately; the loop runs as a detached task.
  pub fn trigger(self: &Arc<Self>, user_id: &str) {
    {
      let mut in_flight = match self.in_flight.lock() {
        Ok(guard) => guard,
        Err(e) => {
          warn!("Drain marker lock poisoned, skipping trigger: {}", e);
          return;
        }
      };
      if !in_flight.insert(user_id.to_string()) {
        return; // already draining for this user
      }
    }

    let drainer = Arc::clone(self);
    let user_id = user_id.to_string();
    tokio::spawn(async move {
      for _ in 0..drainer.config.max_rounds {
        match drainer.drain_once(&user_id).await {
          Ok(0) => break,
          Ok(n) => debug!(user = %user_id, jobs = n, "Drained background jobs"),
          Err(e) => {
            warn!(user = %user_id, "Drain round failed: {}", e);
            break;
          }
        }
      }
      if let Ok(mut in_flight) = drainer.in_flight.lock() {
        in_flight.remove(&user_id);
      }
    });
  }

  /// Recover abandoned jobs, claim one batch, and process it in order.
  /// Returns the number of jobs claimed.
  pub async fn drain_once(&self, user_id: &str) -> Result<usize> {
    let recovered = self
      .jobs
      .recover_timed_out_running(user_id, self.config.running_timeout)?;
    if recovered > 0 {
      debug!(user = %user_id, recovered, "Recovered abandoned running jobs");
    }

    let claimed = self.jobs.claim(user_id, self.config.batch_size)?;
    let count = claimed.len();

    for job in claimed {
      if let Err(e) = self.process_job(job).await {
        // Store or table failures; the job recovers via the running timeout
        warn!("Job processing error: {}", e);
      }
    }

    Ok(count)
  }

  async fn process_job(&self, job: SyncJob) -> Result<()> {
    let spec = match self.registry.get(&job.job_type) {
      Some(spec) => spec,
      None => {
        warn!(job_type = %job.job_type, "Dropping job with unknown type");
        return self.jobs.mark_succeeded(job.id);
      }
    };

    let cache_key = match spec.handler.cache_key(&job.payload) {
      Ok(key) => key,
      Err(e) => {
        // Retrying cannot fix a malformed payload
        warn!(job_type = %job.job_type, "Dropping job with malformed payload: {}", e);
        return self.jobs.mark_succeeded(job.id);
      }
    };

    let user_ns = Namespace::user(job.user_id.clone());
    let etag = self
      .store
      .get::<serde_json::Value>(&user_ns, &cache_key)?
      .and_then(|entry| entry.etag);

    match spec
      .handler
      .fetch(&job.payload, etag.as_deref(), FetchPriority::Background)
      .await
    {
      Ok(Fetched::NotModified) => {
        // Data unchanged upstream: bump synced_at, keep data and TTL
        self.store.touch(&user_ns, &cache_key)?;
        if spec.shareable {
          self.store.touch(&Namespace::Shared, &cache_key)?;
        }
        self.jobs.mark_succeeded(job.id)
      }
      Ok(Fetched::Fresh { data, etag }) => {
        self
          .store
          .set(&user_ns, &cache_key, &data, etag.as_deref(), spec.user_ttl)?;
        if spec.shareable {
          self
            .store
            .set(&Namespace::Shared, &cache_key, &data, etag.as_deref(), Some(self.shared_ttl))?;
        }
        self.jobs.mark_succeeded(job.id)
      }
      Err(err) => match classify(&err) {
        ErrorClass::NotFound => {
          // A valid, cacheable "absent" result, not worth retrying
          self
            .store
            .set(&user_ns, &cache_key, &serde_json::Value::Null, None, spec.user_ttl)?;
          self.jobs.mark_succeeded(job.id)
        }
        ErrorClass::RateLimited(limit) => {
          let attempts = job.attempts + 1;
          self.jobs.mark_failed(job.id, attempts, &err.to_string())?;
          // Never retry faster than the reset window allows
          if let Some(reset_at) = DateTime::<Utc>::from_timestamp(limit.reset_at, 0) {
            self.jobs.delay_until(job.id, reset_at)?;
          }
          Ok(())
        }
        ErrorClass::Transient => {
          debug!(job_type = %job.job_type, key = %cache_key, "Refresh failed: {}", err);
          self.jobs.mark_failed(job.id, job.attempts + 1, &err.to_string())
        }
      },
    }
  }
}
