//! Redis implementation of [`SharedBackend`].
//!
//! Commands go through the `deadpool-redis` pool. Each subscription gets its
//! own pub/sub connection (pooled connections can't enter SUBSCRIBE mode),
//! drained by a spawned task that forwards payloads into the subscription
//! receiver. Dropping that task closes the connection, which unsubscribes.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::Pool;
use futures_util::StreamExt;
use groupcast_core::{BackendError, SharedBackend, Subscription, SubscriptionId};
use redis::{self, AsyncCommands, RedisError, Script};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Reads the value and its TTL in one round trip so the entry can't expire
/// between the two reads.
const GET_WITH_TTL_SCRIPT: &str = r"
local value = redis.call('GET', KEYS[1])
local ttl = redis.call('TTL', KEYS[1])
return {value, ttl}
";

struct ActiveSubscription {
    channel: String,
    task: JoinHandle<()>,
}

/// Shared backend over Redis.
pub struct RedisBackend {
    pool: Pool,
    client: redis::Client,
    get_with_ttl: Script,
    subscriptions: DashMap<SubscriptionId, ActiveSubscription>,
    next_id: AtomicU64,
}

impl RedisBackend {
    /// Create a backend from a connection pool and the URL used to open
    /// dedicated pub/sub connections.
    pub fn new(pool: Pool, redis_url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BackendError::unavailable(format!("failed to create Redis client: {e}")))?;

        Ok(Self {
            pool,
            client,
            get_with_ttl: Script::new(GET_WITH_TTL_SCRIPT),
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(0),
        })
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, BackendError> {
        self.pool
            .get()
            .await
            .map_err(|e| BackendError::unavailable(format!("failed to get Redis connection: {e}")))
    }
}

fn map_redis_error(e: RedisError) -> BackendError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
    {
        BackendError::Unavailable(e.to_string())
    } else {
        BackendError::Command(e.to_string())
    }
}

#[async_trait]
impl SharedBackend for RedisBackend {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let mut conn = self.connection().await?;
        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(map_redis_error)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), BackendError> {
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(map_redis_error)
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<bool, BackendError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), BackendError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key).await.map_err(map_redis_error)
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Vec<u8>, i64)>, BackendError> {
        let mut conn = self.connection().await?;
        let (value, ttl): (Option<Vec<u8>>, i64) = self
            .get_with_ttl
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(value.map(|data| (data, ttl)))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BackendError> {
        let mut conn = self.connection().await?;
        conn.publish::<_, _, usize>(channel, payload)
            .await
            .map_err(map_redis_error)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackendError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BackendError::unavailable(format!("failed to get pub/sub connection: {e}")))?;

        pubsub.subscribe(channel).await.map_err(map_redis_error)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let task_channel = channel.to_string();

        let task = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<Vec<u8>>() {
                    Ok(payload) => {
                        if sender.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(channel = %task_channel, error = %e, "failed to read pub/sub payload");
                    }
                }
            }
            debug!(channel = %task_channel, "pub/sub stream ended");
        });

        self.subscriptions.insert(
            id,
            ActiveSubscription {
                channel: channel.to_string(),
                task,
            },
        );

        debug!(channel = %channel, subscription_id = id, "subscribed (redis)");

        Ok(Subscription {
            id,
            channel: channel.to_string(),
            receiver,
        })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BackendError> {
        if let Some((_, subscription)) = self.subscriptions.remove(&id) {
            subscription.task.abort();
            debug!(channel = %subscription.channel, subscription_id = id, "unsubscribed (redis)");
        }
        Ok(())
    }

    fn subscriber_count(&self, channel: &str) -> usize {
        self.subscriptions
            .iter()
            .filter(|entry| entry.channel == channel && !entry.task.is_finished())
            .count()
    }
}

impl Drop for RedisBackend {
    fn drop(&mut self) {
        for entry in self.subscriptions.iter() {
            entry.task.abort();
        }
    }
}
