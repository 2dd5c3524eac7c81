//! SQLite implementation of the cache store.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use crate::db::{format_datetime, parse_datetime, Database};

use super::traits::{CacheEntry, CacheStore, Namespace};

/// SQLite-backed cache store.
pub struct SqliteStore {
  db: Arc<Database>,
}

impl SqliteStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStore for SqliteStore {
  fn get<T: DeserializeOwned>(&self, ns: &Namespace, key: &str) -> Result<Option<CacheEntry<T>>> {
    let conn = self.db.lock()?;
    let namespace = ns.as_storage_key();

    let mut stmt = conn
      .prepare(
        "SELECT data, etag, synced_at, expires_at FROM kv_cache
         WHERE namespace = ? AND cache_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(Vec<u8>, Option<String>, String, Option<String>)> = stmt
      .query_row(params![namespace, key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    let (data, etag, synced_at_str, expires_at) = match row {
      Some(row) => row,
      None => return Ok(None),
    };

    // Lazy expiry: an expired entry is deleted on read and reported absent
    if let Some(expires_at) = expires_at {
      if expires_at <= format_datetime(Utc::now()) {
        conn
          .execute(
            "DELETE FROM kv_cache WHERE namespace = ? AND cache_key = ?",
            params![namespace, key],
          )
          .map_err(|e| eyre!("Failed to delete expired entry: {}", e))?;
        return Ok(None);
      }
    }

    let data: T = serde_json::from_slice(&data)
      .map_err(|e| eyre!("Failed to deserialize cache entry {}: {}", key, e))?;
    let synced_at = parse_datetime(&synced_at_str)?;

    Ok(Some(CacheEntry {
      data,
      synced_at,
      etag,
    }))
  }

  fn set<T: Serialize>(
    &self,
    ns: &Namespace,
    key: &str,
    data: &T,
    etag: Option<&str>,
    ttl: Option<Duration>,
  ) -> Result<()> {
    let conn = self.db.lock()?;
    let namespace = ns.as_storage_key();

    let data = serde_json::to_vec(data).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;
    let now = Utc::now();
    let expires_at = ttl.map(|ttl| format_datetime(now + ttl));

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_cache (namespace, cache_key, data, etag, synced_at, expires_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![namespace, key, data, etag, format_datetime(now), expires_at],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn touch(&self, ns: &Namespace, key: &str) -> Result<bool> {
    let conn = self.db.lock()?;

    let updated = conn
      .execute(
        "UPDATE kv_cache SET synced_at = ? WHERE namespace = ? AND cache_key = ?",
        params![format_datetime(Utc::now()), ns.as_storage_key(), key],
      )
      .map_err(|e| eyre!("Failed to touch cache entry: {}", e))?;

    Ok(updated > 0)
  }

  fn delete_by_prefix(&self, ns: &Namespace, prefix: &str) -> Result<usize> {
    let conn = self.db.lock()?;

    // Keys may contain LIKE metacharacters (e.g. search-hash segments)
    let pattern = format!("{}%", escape_like(prefix));
    let deleted = conn
      .execute(
        "DELETE FROM kv_cache WHERE namespace = ? AND cache_key LIKE ? ESCAPE '\\'",
        params![ns.as_storage_key(), pattern],
      )
      .map_err(|e| eyre!("Failed to delete by prefix: {}", e))?;

    Ok(deleted)
  }

  fn synced_within(&self, ns: &Namespace, key: &str, window: Duration) -> Result<bool> {
    let conn = self.db.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT synced_at, expires_at FROM kv_cache
         WHERE namespace = ? AND cache_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(String, Option<String>)> = stmt
      .query_row(params![ns.as_storage_key(), key], |row| {
        Ok((row.get(0)?, row.get(1)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    let (synced_at_str, expires_at) = match row {
      Some(row) => row,
      None => return Ok(false),
    };

    if let Some(expires_at) = expires_at {
      if expires_at <= format_datetime(Utc::now()) {
        return Ok(false);
      }
    }

    let synced_at = parse_datetime(&synced_at_str)?;
    Ok(Utc::now() - synced_at <= window)
  }
}

/// Escape LIKE metacharacters so a prefix matches literally.
fn escape_like(s: &str) -> String {
  s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn store() -> SqliteStore {
    SqliteStore::new(Arc::new(Database::in_memory().unwrap()))
  }

  /// Backdate a row's synced_at so time-based behavior is observable.
  fn backdate_synced_at(store: &SqliteStore, ns: &Namespace, key: &str, seconds: i64) {
    let when = format_datetime(Utc::now() - Duration::seconds(seconds));
    store
      .db
      .lock()
      .unwrap()
      .execute(
        "UPDATE kv_cache SET synced_at = ? WHERE namespace = ? AND cache_key = ?",
        params![when, ns.as_storage_key(), key],
      )
      .unwrap();
  }

  #[test]
  fn test_set_get_roundtrip() {
    let store = store();
    let ns = Namespace::user("alice");

    store
      .set(&ns, "repo:rust-lang/rust", &json!({"stars": 90000}), Some("v1"), None)
      .unwrap();

    let entry: CacheEntry<serde_json::Value> = store.get(&ns, "repo:rust-lang/rust").unwrap().unwrap();
    assert_eq!(entry.data["stars"], 90000);
    assert_eq!(entry.etag.as_deref(), Some("v1"));
  }

  #[test]
  fn test_namespaces_are_isolated() {
    let store = store();

    store
      .set(&Namespace::user("alice"), "k", &json!(1), None, None)
      .unwrap();

    let bob: Option<CacheEntry<serde_json::Value>> =
      store.get(&Namespace::user("bob"), "k").unwrap();
    assert!(bob.is_none());

    let shared: Option<CacheEntry<serde_json::Value>> = store.get(&Namespace::Shared, "k").unwrap();
    assert!(shared.is_none());
  }

  #[test]
  fn test_expired_entry_reads_as_absent() {
    let store = store();
    let ns = Namespace::Shared;

    store
      .set(&ns, "k", &json!("v"), None, Some(Duration::seconds(-1)))
      .unwrap();

    let entry: Option<CacheEntry<String>> = store.get(&ns, "k").unwrap();
    assert!(entry.is_none());
  }

  #[test]
  fn test_touch_advances_synced_at_and_keeps_data() {
    let store = store();
    let ns = Namespace::user("alice");

    store.set(&ns, "k", &json!({"n": 1}), Some("v1"), None).unwrap();
    backdate_synced_at(&store, &ns, "k", 3600);

    let before: CacheEntry<serde_json::Value> = store.get(&ns, "k").unwrap().unwrap();
    assert!(store.touch(&ns, "k").unwrap());
    let after: CacheEntry<serde_json::Value> = store.get(&ns, "k").unwrap().unwrap();

    assert!(after.synced_at > before.synced_at);
    assert_eq!(after.data, before.data);
    assert_eq!(after.etag.as_deref(), Some("v1"));
  }

  #[test]
  fn test_touch_missing_entry_returns_false() {
    let store = store();
    assert!(!store.touch(&Namespace::Shared, "missing").unwrap());
  }

  #[test]
  fn test_delete_by_prefix() {
    let store = store();
    let ns = Namespace::user("alice");

    store.set(&ns, "issue:o/r/1:comments:page=1", &json!([]), None, None).unwrap();
    store.set(&ns, "issue:o/r/1:comments:page=2", &json!([]), None, None).unwrap();
    store.set(&ns, "issue:o/r/2", &json!({}), None, None).unwrap();

    let deleted = store.delete_by_prefix(&ns, "issue:o/r/1:").unwrap();
    assert_eq!(deleted, 2);

    let survivor: Option<CacheEntry<serde_json::Value>> = store.get(&ns, "issue:o/r/2").unwrap();
    assert!(survivor.is_some());
  }

  #[test]
  fn test_storage_errors_are_not_misses() {
    let store = store();
    let ns = Namespace::user("alice");
    store.set(&ns, "k", &json!(1), None, None).unwrap();

    // A broken database must surface as an error, not an empty cache
    store.db.lock().unwrap().execute_batch("DROP TABLE kv_cache").unwrap();

    let result: Result<Option<CacheEntry<serde_json::Value>>> = store.get(&ns, "k");
    assert!(result.is_err());
    assert!(store.synced_within(&ns, "k", Duration::minutes(2)).is_err());
  }

  #[test]
  fn test_synced_within() {
    let store = store();
    let ns = Namespace::Shared;

    store.set(&ns, "k", &json!(1), None, None).unwrap();
    assert!(store.synced_within(&ns, "k", Duration::minutes(2)).unwrap());

    backdate_synced_at(&store, &ns, "k", 300);
    assert!(!store.synced_within(&ns, "k", Duration::minutes(2)).unwrap());

    assert!(!store.synced_within(&ns, "missing", Duration::minutes(2)).unwrap());
  }
}
