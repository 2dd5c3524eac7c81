//! Deterministic cache keys.
//!
//! Keys are structured plain-text strings so that prefix invalidation
//! works: everything under one issue shares the `issue:<owner>/<repo>/<n>`
//! prefix, so posting a comment can bust the issue and all of its comment
//! pages in one call. Free-form search queries are collapsed to a short
//! sha256 segment for stable, bounded-length keys.

use sha2::{Digest, Sha256};

/// Repository metadata.
pub fn repo(owner: &str, name: &str) -> String {
  format!("repo:{}/{}", norm(owner), norm(name))
}

/// A single issue or pull request.
pub fn issue(owner: &str, name: &str, number: u64) -> String {
  format!("issue:{}/{}/{}", norm(owner), norm(name), number)
}

/// One page of an issue's comments. Shares the issue's key prefix.
pub fn issue_comments(owner: &str, name: &str, number: u64, page: u64) -> String {
  format!("{}:comments:page={}", issue(owner, name, number), page)
}

/// A user's public profile.
pub fn user_profile(login: &str) -> String {
  format!("user:{}", norm(login))
}

/// One page of issue search results for a free-form query.
pub fn issue_search(query: &str, page: u64) -> String {
  format!("issue_search:{}:page={}", query_hash(query), page)
}

/// One page of the viewer's notifications.
pub fn notifications(page: u64) -> String {
  format!("notifications:page={}", page)
}

/// Normalize an identifying parameter for consistent keys.
/// GitHub logins and repo names are case-insensitive.
fn norm(s: &str) -> String {
  s.trim().to_lowercase()
}

/// Short stable hash of a normalized query string.
fn query_hash(query: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(norm(query).as_bytes());
  let digest = hasher.finalize();
  hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_keys_normalize_case_and_whitespace() {
    assert_eq!(repo("Rust-Lang", " Rust "), "repo:rust-lang/rust");
    assert_eq!(user_profile("Octocat"), "user:octocat");
  }

  #[test]
  fn test_comment_pages_share_the_issue_prefix() {
    let issue_key = issue("o", "r", 5);
    let page_key = issue_comments("o", "r", 5, 2);
    assert!(page_key.starts_with(&issue_key));
    assert_eq!(page_key, "issue:o/r/5:comments:page=2");
  }

  #[test]
  fn test_search_keys_are_stable_and_bounded() {
    let a = issue_search("repo:rust-lang/rust is:open label:bug", 1);
    let b = issue_search("  repo:rust-lang/rust is:open LABEL:BUG ", 1);
    assert_eq!(a, b);

    let c = issue_search("different query", 1);
    assert_ne!(a, c);
  }
}
