//! The read path: stale-while-revalidate orchestration.
//!
//! Every upstream read goes through [`SyncEngine::read`], which optimizes
//! for "always return something fast": cached data is served immediately
//! while a background refresh job is scheduled, shareable data is reused
//! across users, and only a true cold miss fetches synchronously. The one
//! failure callers ever see is the typed rate-limit error; everything else
//! degrades to cached data or the caller-supplied fallback.

use chrono::Duration;
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::github::error::{classify, ErrorClass};
use crate::jobs::{self, DrainConfig, Drainer, JobRegistry, JobTable};
use crate::store::{CacheEntry, CacheStore, Namespace};

/// One read through the engine.
pub struct ReadRequest<T> {
  /// Whose cache namespace and job queue to use
  pub user_id: String,
  /// Registered job type; determines shareability, TTL, and the handler
  /// used for background refreshes
  pub job_type: String,
  /// Deterministic cache key for this query
  pub cache_key: String,
  /// Payload stored with the refresh job
  pub job_payload: Value,
  /// Returned when nothing cached exists and the fetch fails non-fatally
  pub fallback: T,
  /// Bypass the cache and fetch upstream first (e.g. pull-to-refresh)
  pub force_refresh: bool,
}

impl<T> ReadRequest<T> {
  pub fn new(
    user_id: impl Into<String>,
    job_type: impl Into<String>,
    cache_key: impl Into<String>,
    job_payload: Value,
    fallback: T,
  ) -> Self {
    Self {
      user_id: user_id.into(),
      job_type: job_type.into(),
      cache_key: cache_key.into(),
      job_payload,
      fallback,
      force_refresh: false,
    }
  }

  pub fn forced(mut self) -> Self {
    self.force_refresh = true;
    self
  }
}

/// The sync orchestrator.
pub struct SyncEngine<S, J> {
  store: Arc<S>,
  jobs: Arc<J>,
  registry: Arc<JobRegistry>,
  drainer: Arc<Drainer<S, J>>,
  shared_ttl: Duration,
  shared_skip_window: Duration,
}

impl<S, J> SyncEngine<S, J>
where
  S: CacheStore + 'static,
  J: JobTable + 'static,
{
  pub fn new(store: Arc<S>, jobs: Arc<J>, registry: Arc<JobRegistry>, config: &Config) -> Self {
    let shared_ttl = Duration::seconds(config.cache.shared_ttl_secs as i64);
    let drain_config = DrainConfig {
      batch_size: config.drain.batch_size,
      max_rounds: config.drain.max_rounds,
      running_timeout: Duration::seconds(config.drain.running_timeout_secs as i64),
    };
    let drainer = Arc::new(Drainer::new(
      Arc::clone(&store),
      Arc::clone(&jobs),
      Arc::clone(&registry),
      drain_config,
      shared_ttl,
    ));

    Self {
      store,
      jobs,
      registry,
      drainer,
      shared_ttl,
      shared_skip_window: Duration::seconds(config.cache.shared_skip_window_secs as i64),
    }
  }

  /// Read one cacheable query.
  ///
  /// 1. Forced refresh fetches upstream first; its failure falls back to
  ///    the cache legs instead of failing the request.
  /// 2. A per-user cache hit returns immediately and schedules a
  ///    background refresh; the read path never blocks on freshness.
  /// 3. For shareable types, a shared-cache hit is served, copied into the
  ///    user namespace off the request path, and refreshed in background.
  /// 4. A cold miss fetches synchronously. Rate limiting surfaces as a
  ///    typed error; any other failure schedules a retry and returns the
  ///    fallback.
  pub async fn read<T, F, Fut>(&self, req: ReadRequest<T>, fetch_remote: F) -> Result<T>
  where
    T: Serialize + DeserializeOwned + Send,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if req.force_refresh {
      return match fetch_remote().await {
        Ok(data) => {
          self.write_through(&req, &data);
          Ok(data)
        }
        Err(err) => {
          debug!(key = %req.cache_key, "Forced refresh failed, serving from cache: {}", err);
          if let Some(data) = self.try_cache(&req) {
            return Ok(data);
          }
          self.absorb_miss_failure(req, err)
        }
      };
    }

    if let Some(data) = self.try_cache(&req) {
      return Ok(data);
    }

    // Cold miss: the one case where the caller waits on upstream
    match fetch_remote().await {
      Ok(data) => {
        self.write_through(&req, &data);
        Ok(data)
      }
      Err(err) => self.absorb_miss_failure(req, err),
    }
  }

  /// Steps 2 and 3 of the read path: per-user cache, then shared cache
  /// with an off-path backfill. A hit always schedules a refresh.
  fn try_cache<T>(&self, req: &ReadRequest<T>) -> Option<T>
  where
    T: Serialize + DeserializeOwned,
  {
    if let Some(entry) = self.cache_get::<T>(&Namespace::user(req.user_id.as_str()), &req.cache_key) {
      self.schedule_refresh(req);
      return Some(entry.data);
    }

    if !self.registry.is_shareable(&req.job_type) {
      return None;
    }

    let entry: CacheEntry<T> = self.cache_get(&Namespace::Shared, &req.cache_key)?;

    // Copy the shared entry into the user namespace without blocking the
    // caller; a failure here only costs a future shared-cache lookup
    match serde_json::to_value(&entry.data) {
      Ok(data) => {
        let store = Arc::clone(&self.store);
        let ns = Namespace::user(req.user_id.as_str());
        let key = req.cache_key.clone();
        let etag = entry.etag.clone();
        let ttl = self.registry.user_ttl(&req.job_type);
        tokio::spawn(async move {
          if let Err(e) = store.set(&ns, &key, &data, etag.as_deref(), ttl) {
            debug!(key = %key, "Shared-cache backfill failed: {}", e);
          }
        });
      }
      Err(e) => debug!(key = %req.cache_key, "Skipping backfill, unserializable data: {}", e),
    }

    self.schedule_refresh(req);
    Some(entry.data)
  }

  /// Step 4's failure handling: rate limits surface typed, not-found is a
  /// valid empty result, anything else retries in background.
  fn absorb_miss_failure<T>(&self, req: ReadRequest<T>, err: color_eyre::Report) -> Result<T> {
    match classify(&err) {
      ErrorClass::RateLimited(limit) => {
        warn!(key = %req.cache_key, "Rate limited until {}", limit.reset_at);
        Err(err)
      }
      ErrorClass::NotFound => {
        debug!(key = %req.cache_key, "Resource not found upstream, serving fallback");
        Ok(req.fallback)
      }
      ErrorClass::Transient => {
        warn!(key = %req.cache_key, "Fetch failed, serving fallback: {}", err);
        self.schedule_refresh(&req);
        Ok(req.fallback)
      }
    }
  }

  /// Enqueue a background refresh job, subject to the dedupe rule and the
  /// shared-recency skip, then hand off to the drainer.
  fn schedule_refresh<T>(&self, req: &ReadRequest<T>) {
    if self.registry.is_shareable(&req.job_type) {
      // Another user's recent refresh already covers this data
      match self
        .store
        .synced_within(&Namespace::Shared, &req.cache_key, self.shared_skip_window)
      {
        Ok(true) => {
          debug!(key = %req.cache_key, "Shared entry is fresh, skipping refresh enqueue");
          return;
        }
        Ok(false) => {}
        Err(e) => debug!("Shared recency check failed: {}", e),
      }
    }

    let dedupe_key = jobs::dedupe_key(&req.job_type, &req.cache_key);
    match self
      .jobs
      .upsert_pending(&req.user_id, &dedupe_key, &req.job_type, &req.job_payload)
    {
      // Enqueued or already pending either way; kick the drainer so the
      // job (new or preexisting) gets processed
      Ok(_) => self.drainer.trigger(&req.user_id),
      Err(e) => warn!(key = %req.cache_key, "Failed to enqueue refresh job: {}", e),
    }
  }

  /// Write a foreground fetch result through to the user namespace and,
  /// for shareable types, the shared namespace. Write failures never fail
  /// the read that produced the data.
  fn write_through<T: Serialize>(&self, req: &ReadRequest<T>, data: &T) {
    let user_ttl = self.registry.user_ttl(&req.job_type);
    if let Err(e) = self
      .store
      .set(&Namespace::user(req.user_id.as_str()), &req.cache_key, data, None, user_ttl)
    {
      warn!(key = %req.cache_key, "Failed to write cache entry: {}", e);
    }

    if self.registry.is_shareable(&req.job_type) {
      if let Err(e) = self
        .store
        .set(&Namespace::Shared, &req.cache_key, data, None, Some(self.shared_ttl))
      {
        debug!(key = %req.cache_key, "Failed to write shared cache entry: {}", e);
      }
    }
  }

  fn cache_get<T: DeserializeOwned>(&self, ns: &Namespace, key: &str) -> Option<CacheEntry<T>> {
    match self.store.get(ns, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key, "Cache read failed, treating as miss: {}", e);
        None
      }
    }
  }

  /// Targeted cache busting after a known mutation, e.g. a posted comment
  /// invalidating an issue and all of its comment pages. The shared copies
  /// are stale for every viewer, so they are dropped too.
  pub fn invalidate_by_prefix(&self, user_id: &str, prefix: &str) -> Result<usize> {
    let deleted = self
      .store
      .delete_by_prefix(&Namespace::user(user_id), prefix)?;

    if let Err(e) = self.store.delete_by_prefix(&Namespace::Shared, prefix) {
      debug!(prefix = %prefix, "Shared invalidation failed: {}", e);
    }

    Ok(deleted)
  }

  /// Kick off background draining for a user.
  pub fn trigger_drain(&self, user_id: &str) {
    self.drainer.trigger(user_id);
  }

  pub fn drainer(&self) -> &Arc<Drainer<S, J>> {
    &self.drainer
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::github::error::{rate_limit, NotFoundError, RateLimitError};
  use crate::jobs::{FetchPriority, Fetched, JobHandler, JobSpec, SqliteJobTable};
  use crate::store::{NoopStore, SqliteStore};
  use async_trait::async_trait;
  use color_eyre::eyre::eyre;
  use color_eyre::Report;
  use rusqlite::params;
  use serde_json::json;

  /// Background handler whose fetches always fail transiently, so enqueued
  /// jobs stay observable in the table while tests assert on them.
  struct StalledHandler;

  #[async_trait]
  impl JobHandler for StalledHandler {
    fn cache_key(&self, payload: &Value) -> Result<String> {
      payload
        .get("key")
        .and_then(|k| k.as_str())
        .map(String::from)
        .ok_or_else(|| eyre!("Missing required payload field: key"))
    }

    async fn fetch(
      &self,
      _payload: &Value,
      _etag: Option<&str>,
      _priority: FetchPriority,
    ) -> Result<Fetched> {
      Err(eyre!("upstream unavailable"))
    }
  }

  struct Fixture {
    db: Arc<Database>,
    store: Arc<SqliteStore>,
    engine: SyncEngine<SqliteStore, SqliteJobTable>,
  }

  fn fixture() -> Fixture {
    let db = Arc::new(Database::in_memory().unwrap());
    let store = Arc::new(SqliteStore::new(Arc::clone(&db)));
    let jobs = Arc::new(SqliteJobTable::new(Arc::clone(&db)));

    let mut registry = JobRegistry::new();
    registry.register(
      "issue",
      JobSpec {
        handler: Arc::new(StalledHandler),
        shareable: true,
        user_ttl: None,
      },
    );
    registry.register(
      "notifications",
      JobSpec {
        handler: Arc::new(StalledHandler),
        shareable: false,
        user_ttl: None,
      },
    );

    let engine = SyncEngine::new(
      Arc::clone(&store),
      jobs,
      Arc::new(registry),
      &Config::default(),
    );

    Fixture { db, store, engine }
  }

  fn issue_request(fallback: Value) -> ReadRequest<Value> {
    ReadRequest::new("alice", "issue", "issue:o/r/1", json!({"key": "issue:o/r/1"}), fallback)
  }

  fn job_rows(f: &Fixture, dedupe_key: &str) -> i64 {
    f.db
      .lock()
      .unwrap()
      .query_row(
        "SELECT COUNT(*) FROM sync_jobs WHERE dedupe_key = ?",
        params![dedupe_key],
        |row| row.get(0),
      )
      .unwrap()
  }

  fn backdate_shared(f: &Fixture, key: &str, seconds: i64) {
    f.db
      .lock()
      .unwrap()
      .execute(
        "UPDATE kv_cache SET synced_at = datetime('now', ?) WHERE namespace = 'shared' AND cache_key = ?",
        params![format!("-{} seconds", seconds), key],
      )
      .unwrap();
  }

  #[tokio::test]
  async fn test_cache_hit_returns_without_fetching() {
    let f = fixture();
    f.store
      .set(&Namespace::user("alice"), "issue:o/r/1", &json!({"title": "cached"}), None, None)
      .unwrap();
    // Shared copy is stale, so a refresh job must be enqueued
    f.store
      .set(&Namespace::Shared, "issue:o/r/1", &json!({"title": "cached"}), None, None)
      .unwrap();
    backdate_shared(&f, "issue:o/r/1", 600);

    let fetched = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = Arc::clone(&fetched);
    let result = f
      .engine
      .read(issue_request(json!(null)), move || {
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        async { Ok(json!({"title": "fresh"})) }
      })
      .await
      .unwrap();

    assert_eq!(result["title"], "cached");
    assert!(!fetched.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(job_rows(&f, "issue:issue:o/r/1"), 1);
  }

  #[tokio::test]
  async fn test_stale_but_available() {
    let f = fixture();
    f.store
      .set(&Namespace::user("alice"), "issue:o/r/1", &json!({"title": "stale"}), None, None)
      .unwrap();

    // Remote always errors; the cached value must still be served
    let result = f
      .engine
      .read(issue_request(json!("fallback")), || async {
        Err(eyre!("network down"))
      })
      .await
      .unwrap();

    assert_eq!(result["title"], "stale");
    assert_eq!(job_rows(&f, "issue:issue:o/r/1"), 1);
  }

  #[tokio::test]
  async fn test_cold_miss_rate_limit_surfaces_typed_error() {
    let f = fixture();

    let err = f
      .engine
      .read(issue_request(json!("fallback")), || async {
        Err(Report::new(RateLimitError {
          reset_at: 1_700_000_123,
          limit: 5000,
          used: 5000,
        }))
      })
      .await
      .unwrap_err();

    let limit = rate_limit(&err).expect("expected a rate-limit error");
    assert_eq!(limit.reset_at, 1_700_000_123);
  }

  #[tokio::test]
  async fn test_cold_miss_success_writes_through_both_namespaces() {
    let f = fixture();

    let result = f
      .engine
      .read(issue_request(json!(null)), || async {
        Ok(json!({"title": "fresh"}))
      })
      .await
      .unwrap();
    assert_eq!(result["title"], "fresh");

    let user: CacheEntry<Value> = f
      .store
      .get(&Namespace::user("alice"), "issue:o/r/1")
      .unwrap()
      .unwrap();
    assert_eq!(user.data["title"], "fresh");

    let shared: CacheEntry<Value> = f
      .store
      .get(&Namespace::Shared, "issue:o/r/1")
      .unwrap()
      .unwrap();
    assert_eq!(shared.data["title"], "fresh");

    // Fresh data needs no refresh job
    assert_eq!(job_rows(&f, "issue:issue:o/r/1"), 0);
  }

  #[tokio::test]
  async fn test_cold_miss_non_shareable_stays_out_of_shared() {
    let f = fixture();
    let req = ReadRequest::new(
      "alice",
      "notifications",
      "notifications:page=1",
      json!({"key": "notifications:page=1"}),
      json!([]),
    );

    f.engine
      .read(req, || async { Ok(json!([{"id": 1}])) })
      .await
      .unwrap();

    let shared: Option<CacheEntry<Value>> =
      f.store.get(&Namespace::Shared, "notifications:page=1").unwrap();
    assert!(shared.is_none());
  }

  #[tokio::test]
  async fn test_shared_hit_serves_and_backfills_user_namespace() {
    let f = fixture();
    f.store
      .set(&Namespace::Shared, "issue:o/r/1", &json!({"title": "shared"}), Some("v1"), None)
      .unwrap();
    backdate_shared(&f, "issue:o/r/1", 600);

    let result = f
      .engine
      .read(issue_request(json!(null)), || async {
        Err(eyre!("should not fetch"))
      })
      .await
      .unwrap();
    assert_eq!(result["title"], "shared");
    assert_eq!(job_rows(&f, "issue:issue:o/r/1"), 1);

    // Backfill runs off the request path
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let user: CacheEntry<Value> = f
      .store
      .get(&Namespace::user("alice"), "issue:o/r/1")
      .unwrap()
      .unwrap();
    assert_eq!(user.data["title"], "shared");
    assert_eq!(user.etag.as_deref(), Some("v1"));
  }

  #[tokio::test]
  async fn test_transient_failure_returns_fallback_and_enqueues() {
    let f = fixture();

    let result = f
      .engine
      .read(issue_request(json!({"empty": true})), || async {
        Err(eyre!("connection refused"))
      })
      .await
      .unwrap();

    assert_eq!(result["empty"], true);
    assert_eq!(job_rows(&f, "issue:issue:o/r/1"), 1);
  }

  #[tokio::test]
  async fn test_not_found_returns_fallback_without_enqueue() {
    let f = fixture();

    let result = f
      .engine
      .read(issue_request(json!(null)), || async {
        Err(Report::new(NotFoundError {
          path: "repos/o/r/issues/1".into(),
        }))
      })
      .await
      .unwrap();

    assert!(result.is_null());
    // Retrying cannot materialize a missing resource
    assert_eq!(job_rows(&f, "issue:issue:o/r/1"), 0);
  }

  #[tokio::test]
  async fn test_recent_shared_refresh_skips_enqueue() {
    let f = fixture();
    f.store
      .set(&Namespace::user("alice"), "issue:o/r/1", &json!({"title": "mine"}), None, None)
      .unwrap();
    // Another user refreshed the shared copy moments ago
    f.store
      .set(&Namespace::Shared, "issue:o/r/1", &json!({"title": "theirs"}), None, None)
      .unwrap();

    let result = f
      .engine
      .read(issue_request(json!(null)), || async {
        Ok(json!({"title": "fresh"}))
      })
      .await
      .unwrap();

    assert_eq!(result["title"], "mine");
    assert_eq!(job_rows(&f, "issue:issue:o/r/1"), 0);
  }

  #[tokio::test]
  async fn test_force_refresh_overwrites_cache() {
    let f = fixture();
    f.store
      .set(&Namespace::user("alice"), "issue:o/r/1", &json!({"title": "old"}), None, None)
      .unwrap();

    let result = f
      .engine
      .read(issue_request(json!(null)).forced(), || async {
        Ok(json!({"title": "new"}))
      })
      .await
      .unwrap();
    assert_eq!(result["title"], "new");

    let user: CacheEntry<Value> = f
      .store
      .get(&Namespace::user("alice"), "issue:o/r/1")
      .unwrap()
      .unwrap();
    assert_eq!(user.data["title"], "new");
  }

  #[tokio::test]
  async fn test_force_refresh_failure_falls_back_to_cache() {
    let f = fixture();
    f.store
      .set(&Namespace::user("alice"), "issue:o/r/1", &json!({"title": "old"}), None, None)
      .unwrap();

    let result = f
      .engine
      .read(issue_request(json!(null)).forced(), || async {
        Err(eyre!("upstream 502"))
      })
      .await
      .unwrap();

    // The request degrades to the cached value instead of failing
    assert_eq!(result["title"], "old");
    assert_eq!(job_rows(&f, "issue:issue:o/r/1"), 1);
  }

  #[tokio::test]
  async fn test_force_refresh_rate_limit_on_empty_cache_surfaces() {
    let f = fixture();

    let err = f
      .engine
      .read(issue_request(json!(null)).forced(), || async {
        Err(Report::new(RateLimitError {
          reset_at: 99,
          limit: 60,
          used: 60,
        }))
      })
      .await
      .unwrap_err();

    assert_eq!(rate_limit(&err).unwrap().reset_at, 99);
  }

  #[tokio::test]
  async fn test_disabled_cache_fetches_every_read() {
    let db = Arc::new(Database::in_memory().unwrap());
    let jobs = Arc::new(SqliteJobTable::new(db));

    let mut registry = JobRegistry::new();
    registry.register(
      "issue",
      JobSpec {
        handler: Arc::new(StalledHandler),
        shareable: true,
        user_ttl: None,
      },
    );

    let engine = SyncEngine::new(
      Arc::new(NoopStore),
      jobs,
      Arc::new(registry),
      &Config::default(),
    );

    let fetches = Arc::new(std::sync::atomic::AtomicU32::new(0));
    for _ in 0..2 {
      let counter = Arc::clone(&fetches);
      let result = engine
        .read(issue_request(json!(null)), move || {
          counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
          async { Ok(json!({"title": "fresh"})) }
        })
        .await
        .unwrap();
      assert_eq!(result["title"], "fresh");
    }

    // Nothing is retained, so every read goes upstream
    assert_eq!(fetches.load(std::sync::atomic::Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_invalidate_by_prefix_clears_user_and_shared() {
    let f = fixture();
    f.store
      .set(&Namespace::user("alice"), "issue:o/r/1", &json!({}), None, None)
      .unwrap();
    f.store
      .set(&Namespace::user("alice"), "issue:o/r/1:comments:page=1", &json!([]), None, None)
      .unwrap();
    f.store
      .set(&Namespace::Shared, "issue:o/r/1", &json!({}), None, None)
      .unwrap();

    let deleted = f.engine.invalidate_by_prefix("alice", "issue:o/r/1").unwrap();
    assert_eq!(deleted, 2);

    let shared: Option<CacheEntry<Value>> = f.store.get(&Namespace::Shared, "issue:o/r/1").unwrap();
    assert!(shared.is_none());
  }
}
