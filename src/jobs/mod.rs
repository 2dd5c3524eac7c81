//! Durable background sync jobs.
//!
//! Each job refreshes one cache entry. The `(user_id, dedupe_key)`
//! uniqueness constraint guarantees at most one live job per cached item
//! per user; claiming is a compare-and-swap on status so concurrent drains
//! are safe without a lock.

mod drainer;
mod registry;
mod table;

pub use drainer::{DrainConfig, Drainer};
pub use registry::{FetchPriority, Fetched, JobHandler, JobRegistry, JobSpec};
pub use table::SqliteJobTable;

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use serde_json::Value;

/// Attempt count at which a job becomes terminally failed.
pub const MAX_ATTEMPTS: u32 = 8;

/// Retry backoff floor and ceiling, in seconds.
const BACKOFF_FLOOR_SECS: i64 = 5;
const BACKOFF_CEILING_SECS: i64 = 900;

/// Status of a background sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
  Pending,
  Running,
  Failed,
}

impl JobStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      JobStatus::Pending => "pending",
      JobStatus::Running => "running",
      JobStatus::Failed => "failed",
    }
  }
}

/// A background sync job row.
#[derive(Debug, Clone)]
pub struct SyncJob {
  pub id: i64,
  pub user_id: String,
  pub dedupe_key: String,
  pub job_type: String,
  pub payload: Value,
  pub status: JobStatus,
  pub attempts: u32,
  pub next_attempt_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
}

/// Build the job-table uniqueness key for a cache entry refresh.
pub fn dedupe_key(job_type: &str, cache_key: &str) -> String {
  format!("{}:{}", job_type, cache_key)
}

/// Exponential retry backoff: 2^attempts seconds, clamped to [5s, 15min].
pub fn backoff_delay(attempts: u32) -> Duration {
  let secs = 1i64
    .checked_shl(attempts.min(30))
    .unwrap_or(BACKOFF_CEILING_SECS)
    .clamp(BACKOFF_FLOOR_SECS, BACKOFF_CEILING_SECS);
  Duration::seconds(secs)
}

/// Trait for the durable job table.
pub trait JobTable: Send + Sync {
  /// Create a pending job unless one already exists for the dedupe key.
  /// Returns true if a new row was created. A uniqueness conflict is a
  /// successful no-op, never an error.
  fn upsert_pending(
    &self,
    user_id: &str,
    dedupe_key: &str,
    job_type: &str,
    payload: &Value,
  ) -> Result<bool>;

  /// Claim up to `limit` due pending jobs for a user, transitioning each
  /// pending -> running. Jobs another worker claimed first are skipped.
  /// Ordered by (next_attempt_at, id).
  fn claim(&self, user_id: &str, limit: usize) -> Result<Vec<SyncJob>>;

  /// Delete a job after successful processing.
  fn mark_succeeded(&self, job_id: i64) -> Result<()>;

  /// Record a failed attempt: reschedule with backoff, or mark the job
  /// terminally failed once `attempts` reaches the ceiling.
  fn mark_failed(&self, job_id: i64, attempts: u32, error: &str) -> Result<()>;

  /// Push a pending job's next attempt no earlier than `when`.
  fn delay_until(&self, job_id: i64, when: DateTime<Utc>) -> Result<()>;

  /// Reset running jobs whose started_at is older than `timeout` back to
  /// pending. Returns the number of recovered jobs.
  fn recover_timed_out_running(&self, user_id: &str, timeout: Duration) -> Result<usize>;
}
