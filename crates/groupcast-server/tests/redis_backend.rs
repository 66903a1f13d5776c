//! Integration tests for the Redis backend.
//!
//! Tests use testcontainers to spin up a real Redis instance.

use std::sync::Arc;
use std::time::Duration;

use groupcast_core::SharedBackend;
use groupcast_server::cache::{CacheCoordinator, CachedResponse};
use groupcast_server::groups::{GroupBroadcaster, NoopHooks, Outbound, channel_connection};
use groupcast_server::guard::{DuplicateRequestGuard, GuardError, GuardMode};
use groupcast_server::{CacheConfig, RedisConfig, create_backend};
use serde_json::json;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

/// Get or create the shared Redis container
async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn redis_backend() -> Arc<dyn SharedBackend> {
    let config = RedisConfig {
        enabled: true,
        url: get_redis_url().await,
        pool_size: 4,
        timeout_ms: 5000,
    };
    let backend = create_backend(&config).await;
    assert_eq!(backend.kind(), "redis");
    backend
}

#[tokio::test]
async fn test_redis_set_get_with_ttl() {
    let backend = redis_backend().await;

    backend.set_ex("it:ttl", b"value", 60).await.unwrap();
    let (value, ttl) = backend.get_with_ttl("it:ttl").await.unwrap().unwrap();
    assert_eq!(value, b"value");
    assert!((59..=60).contains(&ttl), "ttl = {ttl}");

    backend.del("it:ttl").await.unwrap();
    assert!(backend.get_with_ttl("it:ttl").await.unwrap().is_none());
    assert!(backend.get("it:ttl").await.unwrap().is_none());
}

#[tokio::test]
async fn test_redis_set_nx_ex() {
    let backend = redis_backend().await;
    backend.del("it:nx").await.unwrap();

    assert!(backend.set_nx_ex("it:nx", b"1", 5).await.unwrap());
    assert!(!backend.set_nx_ex("it:nx", b"1", 5).await.unwrap());
}

#[tokio::test]
async fn test_redis_pubsub_roundtrip() {
    let backend = redis_backend().await;

    let mut subscription = backend.subscribe("it:channel").await.unwrap();
    assert_eq!(backend.subscriber_count("it:channel"), 1);

    backend.publish("it:channel", b"first").await.unwrap();
    backend.publish("it:channel", b"second").await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .unwrap();
    assert_eq!(first.as_deref(), Some(&b"first"[..]));
    assert_eq!(second.as_deref(), Some(&b"second"[..]));

    backend.unsubscribe(subscription.id).await.unwrap();
    assert_eq!(backend.subscriber_count("it:channel"), 0);
}

#[tokio::test]
async fn test_cache_shared_between_instances() {
    let config = CacheConfig {
        enabled: true,
        prefix: "it-cache".into(),
        expires_secs: 60,
        add_cache_headers: true,
    };
    let first = CacheCoordinator::new(redis_backend().await, config.clone());
    let second = CacheCoordinator::new(redis_backend().await, config);

    let request = groupcast_core::RequestDescriptor::new("GET", "/items/:id").with_param("id", "42");
    let key = first.compute_key(&request);
    first.invalidate(&key).await;

    let mut response = CachedResponse::json(200, json!({"id": 42}));
    first.store(&key, &mut response, 60).await;

    let entry = second.lookup(&key, 60).await.expect("hit from other instance");
    assert_eq!(entry.response.body, json!({"id": 42}));
    assert_eq!(entry.response.header("X-Cache"), Some("HIT"));
    assert!(entry.age <= 1);
}

#[tokio::test]
async fn test_guard_shared_between_instances() {
    let first = DuplicateRequestGuard::new(redis_backend().await, Duration::from_secs(5), GuardMode::Atomic);
    let second =
        DuplicateRequestGuard::new(redis_backend().await, Duration::from_secs(5), GuardMode::GetThenSet);

    let body = json!({"nonce": groupcast_core::generate_id()}).to_string();
    first.check("10.1.1.1", &body).await.unwrap();
    assert!(matches!(
        second.check("10.1.1.1", &body).await,
        Err(GuardError::Duplicate)
    ));
}

#[tokio::test]
async fn test_groups_fan_out_over_redis() {
    let one = GroupBroadcaster::new(redis_backend().await, Duration::from_secs(30));
    let two = GroupBroadcaster::new(redis_backend().await, Duration::from_secs(30));

    let (raw_a, mut peer_a) = channel_connection();
    let (raw_b, mut peer_b) = channel_connection();
    let (_, group) = one.attach("it-room", Arc::new(NoopHooks), raw_a).await.unwrap();
    two.attach("it-room", Arc::new(NoopHooks), raw_b).await.unwrap();

    group.broadcast_message(&json!({"text": "hi"})).await.unwrap();

    for peer in [&mut peer_a, &mut peer_b] {
        let frame = tokio::time::timeout(Duration::from_secs(5), peer.recv())
            .await
            .unwrap();
        assert_eq!(frame, Some(Outbound::Text(r#"{"text":"hi"}"#.into())));
    }

    one.shutdown().await;
    two.shutdown().await;
}
