//! Cache key derivation.
//!
//! ## Key Format
//!
//! `{prefix}:{method}:{resolved path}:{query as JSON}`, e.g.
//! `api:get:/users/42:{"page":"2"}`. The query map is sorted by name so two
//! requests that differ only in parameter order share a key.

use std::fmt;

use groupcast_core::RequestDescriptor;

/// Deterministic key of a cacheable request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the cache key of a request under the given namespace prefix.
pub fn compute_key(prefix: &str, request: &RequestDescriptor) -> CacheKey {
    let query = serde_json::to_string(&request.normalized_query()).unwrap_or_else(|_| "{}".into());
    CacheKey(format!(
        "{prefix}:{}:{}:{query}",
        request.method_lowercase(),
        request.resolved_path()
    ))
}
