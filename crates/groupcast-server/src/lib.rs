//! Fleet-wide coordination for HTTP and websocket servers.
//!
//! Three components share one [`SharedBackend`](groupcast_core::SharedBackend):
//!
//! - [`cache::CacheCoordinator`]: response caching with age tracking
//! - [`guard::DuplicateRequestGuard`]: rejects repeats of a request inside a window
//! - [`groups::GroupBroadcaster`]: named websocket groups spanning every process

pub mod backend;
pub mod cache;
pub mod config;
pub mod groups;
pub mod guard;
pub mod handlers;
pub mod metrics;
pub mod observability;
pub mod server;

#[cfg(test)]
mod testing;

pub use backend::{RedisBackend, create_backend};
pub use cache::{CacheCoordinator, CacheEntry, CacheError, CacheKey, CachePolicy, CachedResponse};
pub use config::{
    AppConfig, CacheConfig, DuplicateGuardConfig, LoggingConfig, RedisConfig, ServerConfig,
    WebSocketConfig,
};
pub use groups::{Group, GroupBroadcaster, GroupError, GroupHooks, RawConnection};
pub use guard::{DuplicateRequestGuard, GuardError, GuardMode};
pub use observability::init_tracing;
pub use server::{AppState, GroupcastServer, ServerBuilder, build_app};
