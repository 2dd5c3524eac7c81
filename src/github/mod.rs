//! GitHub remote fetcher: HTTP client, failure classification, cache-key
//! builders, and the per-resource job handlers.

pub mod client;
pub mod error;
pub mod handlers;
pub mod keys;

pub use client::GitHubClient;
