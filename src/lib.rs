//! Local-first sync and caching engine for GitHub data.
//!
//! Every read from the upstream API goes through [`SyncEngine::read`]:
//! cached data is served immediately while a deduplicated background job
//! refreshes it, shareable public data is reused across users, and rate
//! limiting surfaces as a typed error instead of being silently retried.
//! Background work piggybacks on read traffic; no dedicated worker process
//! is required.

pub mod config;
pub mod db;
pub mod github;
pub mod jobs;
pub mod store;
pub mod sync;

pub use config::Config;
pub use db::Database;
pub use github::error::{classify, rate_limit, ErrorClass, NotFoundError, RateLimitError};
pub use github::GitHubClient;
pub use jobs::{
  DrainConfig, Drainer, FetchPriority, Fetched, JobHandler, JobRegistry, JobSpec, JobStatus,
  JobTable, SqliteJobTable, SyncJob,
};
pub use store::{CacheEntry, CacheStore, Namespace, NoopStore, SqliteStore};
pub use sync::{ReadRequest, SyncEngine};
