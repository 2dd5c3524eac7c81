//! Namespaced key-value cache for upstream data.
//!
//! Two namespaces hold the same entry shape: a per-user namespace
//! (authoritative, consulted first, long-lived) and a shared namespace for
//! resource types whose data carries no viewer-specific fields. The shared
//! namespace is an optimization with a short TTL, never a system of record.

mod sqlite;
mod traits;

pub use sqlite::SqliteStore;
pub use traits::{CacheEntry, CacheStore, Namespace, NoopStore};
