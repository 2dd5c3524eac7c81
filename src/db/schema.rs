//! SQLite schema for the cache and job tables.

/// Schema for the key-value cache and the background sync job table.
pub const SCHEMA: &str = r#"
-- Namespaced key-value cache (stores serialized JSON)
CREATE TABLE IF NOT EXISTS kv_cache (
    namespace TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    data BLOB NOT NULL,
    etag TEXT,
    synced_at TEXT NOT NULL DEFAULT (datetime('now')),
    expires_at TEXT,
    PRIMARY KEY (namespace, cache_key)
);

CREATE INDEX IF NOT EXISTS idx_kv_cache_expires
    ON kv_cache(expires_at);

-- Background sync jobs, at most one live job per (user_id, dedupe_key)
CREATE TABLE IF NOT EXISTS sync_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    dedupe_key TEXT NOT NULL,
    job_type TEXT NOT NULL,
    payload BLOB NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT NOT NULL DEFAULT (datetime('now')),
    started_at TEXT,
    last_error TEXT,
    UNIQUE (user_id, dedupe_key)
);

CREATE INDEX IF NOT EXISTS idx_sync_jobs_due
    ON sync_jobs(user_id, status, next_attempt_at);
"#;
