//! Cache lookups and writes against the shared backend.

use std::future::Future;
use std::sync::Arc;

use groupcast_core::{RequestDescriptor, SharedBackend};
use serde::{Deserialize, Serialize};

use super::CacheError;
use super::key::{CacheKey, compute_key};
use super::response::CachedResponse;
use crate::config::CacheConfig;
use crate::metrics;

/// Max age used when neither the route nor the configuration sets one.
const FALLBACK_MAX_AGE_SECS: u64 = 60;

/// Per-route caching options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Whether responses of this route may be cached.
    #[serde(default)]
    pub cache: bool,
    /// Route-specific max age in seconds.
    #[serde(default)]
    pub expires: Option<u64>,
}

impl CachePolicy {
    pub fn cached() -> Self {
        Self {
            cache: true,
            expires: None,
        }
    }

    pub fn cached_for(expires_secs: u64) -> Self {
        Self {
            cache: true,
            expires: Some(expires_secs),
        }
    }
}

/// A cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub response: CachedResponse,
    /// Seconds left before the entry expires, as reported by the backend.
    pub ttl_remaining: i64,
    /// Seconds since the entry was stored, within `0..=max_age`.
    pub age: u64,
}

/// Computes cache keys and reads/writes cached responses.
#[derive(Clone)]
pub struct CacheCoordinator {
    backend: Arc<dyn SharedBackend>,
    config: CacheConfig,
}

impl CacheCoordinator {
    pub fn new(backend: Arc<dyn SharedBackend>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Key of a request under the configured prefix.
    pub fn compute_key(&self, request: &RequestDescriptor) -> CacheKey {
        compute_key(&self.config.prefix, request)
    }

    /// Whether responses under `policy` go through the cache at all.
    pub fn is_cacheable(&self, policy: &CachePolicy) -> bool {
        self.config.enabled && policy.cache
    }

    /// Effective max age: route override, then configuration, then 60 s.
    pub fn max_age(&self, policy: &CachePolicy) -> u64 {
        policy
            .expires
            .filter(|secs| *secs > 0)
            .or(Some(self.config.expires_secs).filter(|secs| *secs > 0))
            .unwrap_or(FALLBACK_MAX_AGE_SECS)
    }

    /// Look up a cached response.
    ///
    /// Value and remaining TTL come from one atomic backend call. Any backend
    /// or decoding failure is reported as a miss.
    pub async fn lookup(&self, key: &CacheKey, max_age: u64) -> Option<CacheEntry> {
        let (mut response, ttl) = match self.fetch(key).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                tracing::debug!(key = %key, "cache miss");
                metrics::record_cache_miss();
                return None;
            }
            Err(CacheError::Serialization(e)) => {
                tracing::warn!(key = %key, error = %e, "Failed to deserialize cached response");
                self.invalidate(key).await;
                metrics::record_cache_miss();
                return None;
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache lookup failed, treating as miss");
                metrics::record_cache_backend_error("lookup");
                metrics::record_cache_miss();
                return None;
            }
        };

        let age = age_from_ttl(max_age, ttl);
        if self.config.add_cache_headers {
            response.set_header("X-Cache", "HIT");
            response.set_header("X-Cache-Age", age);
            response.set_header("X-Cache-Expires", max_age);
        }

        tracing::debug!(key = %key, age, ttl, "cache hit");
        metrics::record_cache_hit();

        Some(CacheEntry {
            response,
            ttl_remaining: ttl,
            age,
        })
    }

    async fn fetch(&self, key: &CacheKey) -> Result<Option<(CachedResponse, i64)>, CacheError> {
        let Some((data, ttl)) = self.backend.get_with_ttl(key.as_str()).await? else {
            return Ok(None);
        };
        let response = serde_json::from_slice::<CachedResponse>(&data)?;
        Ok(Some((response, ttl)))
    }

    /// Store a response for `ttl_secs` seconds.
    ///
    /// The stored copy is taken before the MISS headers are added to
    /// `response`. Backend failures are logged, never returned.
    pub async fn store(&self, key: &CacheKey, response: &mut CachedResponse, ttl_secs: u64) {
        match self.write(key, response, ttl_secs).await {
            Ok(()) => tracing::debug!(key = %key, ttl_secs, "cache set"),
            Err(CacheError::Serialization(e)) => {
                tracing::warn!(key = %key, error = %e, "Failed to serialize response for cache");
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache store failed");
                metrics::record_cache_backend_error("store");
            }
        }

        if self.config.add_cache_headers {
            response.set_header("X-Cache", "MISS");
            response.set_header("X-Cache-Age", 0);
            response.set_header("X-Cache-Expires", ttl_secs);
        }
    }

    async fn write(&self, key: &CacheKey, response: &CachedResponse, ttl_secs: u64) -> Result<(), CacheError> {
        let data = serde_json::to_vec(response)?;
        self.backend.set_ex(key.as_str(), &data, ttl_secs).await?;
        Ok(())
    }

    /// Drop a cached entry. Failures are logged.
    pub async fn invalidate(&self, key: &CacheKey) {
        if let Err(e) = self.backend.del(key.as_str()).await {
            tracing::warn!(key = %key, error = %e, "cache invalidation failed");
            metrics::record_cache_backend_error("invalidate");
        } else {
            tracing::debug!(key = %key, "cache invalidated");
        }
    }

    /// Invalidate the entry a request would be cached under.
    pub async fn invalidate_request(&self, request: &RequestDescriptor) {
        self.invalidate(&self.compute_key(request)).await;
    }

    /// Serve `request` from the cache, or run `handler` and cache its result.
    ///
    /// When caching is disabled or the policy opts out the handler always
    /// runs. Handler errors are returned unchanged and nothing is stored.
    pub async fn cached_or_compute<F, Fut, E>(
        &self,
        request: &RequestDescriptor,
        policy: &CachePolicy,
        handler: F,
    ) -> Result<CachedResponse, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse, E>>,
    {
        if !self.is_cacheable(policy) {
            return handler().await;
        }

        let key = self.compute_key(request);
        let max_age = self.max_age(policy);

        if let Some(entry) = self.lookup(&key, max_age).await {
            return Ok(entry.response);
        }

        let mut response = handler().await?;
        self.store(&key, &mut response, max_age).await;
        Ok(response)
    }
}

/// `max_age - ttl`, kept within `0..=max_age`.
///
/// A negative TTL (key without expiry) counts as fully aged; a TTL above
/// `max_age` (stored under a longer max age) counts as fresh.
fn age_from_ttl(max_age: u64, ttl: i64) -> u64 {
    let ttl = u64::try_from(ttl).unwrap_or(0).min(max_age);
    max_age - ttl
}
