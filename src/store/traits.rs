//! Core traits and types for the cache store.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};

/// Storage namespace for a cache entry.
///
/// The per-user namespace is authoritative and always consulted first. The
/// shared namespace may only hold entries for shareable resource types:
/// data that does not depend on viewer identity or permissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Namespace {
  /// Per-user cache, keyed by the user id.
  User(String),
  /// Cross-user cache for shareable public data.
  Shared,
}

impl Namespace {
  pub fn user(id: impl Into<String>) -> Self {
    Namespace::User(id.into())
  }

  /// The namespace column value in storage.
  pub fn as_storage_key(&self) -> String {
    match self {
      Namespace::User(id) => format!("user:{}", id),
      Namespace::Shared => "shared".to_string(),
    }
  }
}

/// A single cached entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  /// The cached data
  pub data: T,
  /// When the entry was last written or touched
  pub synced_at: DateTime<Utc>,
  /// ETag from the last full fetch, for conditional refreshes
  pub etag: Option<String>,
}

/// Trait for cache storage backends.
///
/// Entries are small whole-entry overwrites; read-modify-write races are
/// tolerated by design. This is a performance cache, not a system of record.
pub trait CacheStore: Send + Sync {
  /// Get an entry, or None if absent or expired.
  fn get<T: DeserializeOwned>(&self, ns: &Namespace, key: &str) -> Result<Option<CacheEntry<T>>>;

  /// Write an entry, replacing any existing one.
  fn set<T: Serialize>(
    &self,
    ns: &Namespace,
    key: &str,
    data: &T,
    etag: Option<&str>,
    ttl: Option<Duration>,
  ) -> Result<()>;

  /// Bump `synced_at` without changing data, etag, or the remaining TTL.
  /// Returns false if no entry exists.
  fn touch(&self, ns: &Namespace, key: &str) -> Result<bool>;

  /// Delete all entries whose key starts with `prefix`. Returns the count.
  fn delete_by_prefix(&self, ns: &Namespace, prefix: &str) -> Result<usize>;

  /// Whether an entry exists and was synced within the given window.
  fn synced_within(&self, ns: &Namespace, key: &str, window: Duration) -> Result<bool>;
}

/// Store implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl CacheStore for NoopStore {
  fn get<T: DeserializeOwned>(&self, _ns: &Namespace, _key: &str) -> Result<Option<CacheEntry<T>>> {
    Ok(None) // Always miss
  }

  fn set<T: Serialize>(
    &self,
    _ns: &Namespace,
    _key: &str,
    _data: &T,
    _etag: Option<&str>,
    _ttl: Option<Duration>,
  ) -> Result<()> {
    Ok(()) // Discard
  }

  fn touch(&self, _ns: &Namespace, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn delete_by_prefix(&self, _ns: &Namespace, _prefix: &str) -> Result<usize> {
    Ok(0)
  }

  fn synced_within(&self, _ns: &Namespace, _key: &str, _window: Duration) -> Result<bool> {
    Ok(false)
  }
}
