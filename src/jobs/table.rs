//! SQLite implementation of the job table.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::db::{format_datetime, parse_datetime, Database};

use super::{backoff_delay, JobStatus, JobTable, SyncJob, MAX_ATTEMPTS};

/// SQLite-backed job table.
pub struct SqliteJobTable {
  db: Arc<Database>,
}

impl SqliteJobTable {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl JobTable for SqliteJobTable {
  fn upsert_pending(
    &self,
    user_id: &str,
    dedupe_key: &str,
    job_type: &str,
    payload: &Value,
  ) -> Result<bool> {
    let conn = self.db.lock()?;

    let payload =
      serde_json::to_vec(payload).map_err(|e| eyre!("Failed to serialize job payload: {}", e))?;

    // Losing the uniqueness race is a successful no-op: a live job for
    // this dedupe key already covers the refresh.
    let inserted = conn
      .execute(
        "INSERT INTO sync_jobs (user_id, dedupe_key, job_type, payload, status, attempts, next_attempt_at)
         VALUES (?, ?, ?, ?, 'pending', 0, ?)
         ON CONFLICT (user_id, dedupe_key) DO NOTHING",
        params![user_id, dedupe_key, job_type, payload, format_datetime(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to enqueue job: {}", e))?;

    Ok(inserted > 0)
  }

  fn claim(&self, user_id: &str, limit: usize) -> Result<Vec<SyncJob>> {
    let conn = self.db.lock()?;
    let now = format_datetime(Utc::now());

    let candidates: Vec<(i64, String, String, Vec<u8>, u32, String, Option<String>)> = {
      let mut stmt = conn
        .prepare(
          "SELECT id, dedupe_key, job_type, payload, attempts, next_attempt_at, last_error
           FROM sync_jobs
           WHERE user_id = ? AND status = 'pending' AND next_attempt_at <= ?
           ORDER BY next_attempt_at, id
           LIMIT ?",
        )
        .map_err(|e| eyre!("Failed to prepare claim query: {}", e))?;

      let rows = stmt
        .query_map(params![user_id, now, limit as i64], |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
          ))
        })
        .map_err(|e| eyre!("Failed to query due jobs: {}", e))?
        .filter_map(|r| r.ok())
        .collect();
      rows
    };

    let mut claimed = Vec::new();
    for (id, dedupe_key, job_type, payload, attempts, next_attempt_at, last_error) in candidates {
      let started_at = format_datetime(Utc::now());

      // Compare-and-swap on status: if another drain already claimed this
      // job, zero rows are affected and we skip it silently.
      let updated = conn
        .execute(
          "UPDATE sync_jobs SET status = 'running', started_at = ?
           WHERE id = ? AND status = 'pending'",
          params![started_at, id],
        )
        .map_err(|e| eyre!("Failed to claim job {}: {}", id, e))?;

      if updated == 0 {
        continue;
      }

      let payload: Value = match serde_json::from_slice(&payload) {
        Ok(v) => v,
        Err(e) => {
          // Corrupt payloads can never be processed; delete the row
          warn!(job_id = id, "Dropping job with undecodable payload: {}", e);
          conn
            .execute("DELETE FROM sync_jobs WHERE id = ?", params![id])
            .map_err(|e| eyre!("Failed to delete corrupt job {}: {}", id, e))?;
          continue;
        }
      };

      claimed.push(SyncJob {
        id,
        user_id: user_id.to_string(),
        dedupe_key,
        job_type,
        payload,
        status: JobStatus::Running,
        attempts,
        next_attempt_at: parse_datetime(&next_attempt_at)?,
        started_at: Some(parse_datetime(&started_at)?),
        last_error,
      });
    }

    Ok(claimed)
  }

  fn mark_succeeded(&self, job_id: i64) -> Result<()> {
    let conn = self.db.lock()?;

    conn
      .execute("DELETE FROM sync_jobs WHERE id = ?", params![job_id])
      .map_err(|e| eyre!("Failed to delete job {}: {}", job_id, e))?;

    Ok(())
  }

  fn mark_failed(&self, job_id: i64, attempts: u32, error: &str) -> Result<()> {
    let conn = self.db.lock()?;

    if attempts >= MAX_ATTEMPTS {
      // Terminal: stops consuming retry cycles until external intervention
      conn
        .execute(
          "UPDATE sync_jobs SET status = ?, attempts = ?, started_at = NULL, last_error = ?
           WHERE id = ?",
          params![JobStatus::Failed.as_str(), attempts, error, job_id],
        )
        .map_err(|e| eyre!("Failed to mark job {} failed: {}", job_id, e))?;
    } else {
      let next_attempt_at = format_datetime(Utc::now() + backoff_delay(attempts));
      conn
        .execute(
          "UPDATE sync_jobs SET status = ?, attempts = ?, next_attempt_at = ?,
             started_at = NULL, last_error = ?
           WHERE id = ?",
          params![JobStatus::Pending.as_str(), attempts, next_attempt_at, error, job_id],
        )
        .map_err(|e| eyre!("Failed to reschedule job {}: {}", job_id, e))?;
    }

    Ok(())
  }

  fn delay_until(&self, job_id: i64, when: DateTime<Utc>) -> Result<()> {
    let conn = self.db.lock()?;

    // String MAX works because the storage format sorts chronologically
    conn
      .execute(
        "UPDATE sync_jobs SET next_attempt_at = MAX(next_attempt_at, ?)
         WHERE id = ? AND status = 'pending'",
        params![format_datetime(when), job_id],
      )
      .map_err(|e| eyre!("Failed to delay job {}: {}", job_id, e))?;

    Ok(())
  }

  fn recover_timed_out_running(&self, user_id: &str, timeout: Duration) -> Result<usize> {
    let conn = self.db.lock()?;
    let cutoff = format_datetime(Utc::now() - timeout);

    let recovered = conn
      .execute(
        "UPDATE sync_jobs SET status = 'pending', started_at = NULL
         WHERE user_id = ? AND status = 'running' AND started_at <= ?",
        params![user_id, cutoff],
      )
      .map_err(|e| eyre!("Failed to recover timed-out jobs: {}", e))?;

    Ok(recovered)
  }
}
