//! Shared HTTP response cache.
//!
//! ## Flow
//!
//! ```text
//! request → compute_key → lookup (GET+TTL, one round trip)
//!              hit  → cached response (+ X-Cache: HIT headers)
//!              miss → handler → store (SET EX) (+ X-Cache: MISS headers)
//! ```
//!
//! ## Graceful Degradation
//!
//! Backend faults on these paths are logged and swallowed: a failed lookup
//! is a miss, a failed store leaves the response uncached.
//!
//! Concurrent identical misses are not coordinated. Each computes and stores
//! its own response, and the last write wins.

pub mod coordinator;
pub mod key;
pub mod response;

use groupcast_core::BackendError;

pub use coordinator::{CacheCoordinator, CacheEntry, CachePolicy};
pub use key::{CacheKey, compute_key};
pub use response::CachedResponse;

/// Failures inside the coordinator. They are logged and never reach the
/// request path.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
