//! Shared backend selection.
//!
//! ## Modes
//!
//! - **Memory**: single-instance mode, state lives in this process
//! - **Redis**: multi-instance mode, every process shares one Redis
//!
//! ## Graceful Degradation
//!
//! If Redis is disabled or unreachable at startup the server falls back to the
//! in-process backend. Cached responses, duplicate windows and group fan-out
//! then only span this process.

mod redis;

use std::sync::Arc;
use std::time::Duration;

use groupcast_core::{MemoryBackend, SharedBackend};

use crate::config::RedisConfig;

pub use self::redis::RedisBackend;

/// Create the shared backend based on configuration.
pub async fn create_backend(config: &RedisConfig) -> Arc<dyn SharedBackend> {
    if !config.enabled {
        tracing::info!("Redis disabled, using in-process backend");
        return Arc::new(MemoryBackend::new());
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let timeout = Some(Duration::from_millis(config.timeout_ms));
    let pool_config = redis_config
        .pool
        .get_or_insert_with(|| deadpool_redis::PoolConfig::new(config.pool_size));
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = timeout;
    pool_config.timeouts.create = timeout;
    pool_config.timeouts.recycle = timeout;

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to in-process backend."
            );
            return Arc::new(MemoryBackend::new());
        }
    };

    // Test connection
    if let Err(e) = pool.get().await {
        tracing::warn!(
            error = %e,
            "Failed to connect to Redis. Falling back to in-process backend."
        );
        return Arc::new(MemoryBackend::new());
    }

    match RedisBackend::new(pool, &config.url) {
        Ok(backend) => {
            tracing::info!("Connected to Redis successfully");
            Arc::new(backend)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Invalid Redis URL for pub/sub. Falling back to in-process backend."
            );
            Arc::new(MemoryBackend::new())
        }
    }
}
