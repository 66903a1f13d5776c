//! Group behaviour across processes.
//!
//! Two `GroupBroadcaster`s over one `MemoryBackend` stand in for two server
//! processes sharing Redis.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use groupcast_core::{MemoryBackend, SharedBackend};
use groupcast_server::groups::{
    CloseReason, ConnectionPeer, GroupBroadcaster, GroupHooks, HookError, InboundMessage,
    NoopHooks, Outbound, channel_connection,
};
use serde_json::json;
use tokio::sync::{Mutex, Notify};

const HEARTBEAT: Duration = Duration::from_secs(30);

fn process(backend: &MemoryBackend) -> GroupBroadcaster {
    GroupBroadcaster::new(Arc::new(backend.clone()), HEARTBEAT)
}

async fn next_text(peer: &mut ConnectionPeer) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), peer.recv())
            .await
            .expect("frame in time")
            .expect("connection open");
        if let Outbound::Text(text) = frame {
            return text;
        }
    }
}

/// Records every callback.
#[derive(Default)]
struct RecordingHooks {
    received: Mutex<Vec<InboundMessage>>,
    closed: Mutex<Vec<(String, CloseReason)>>,
    closed_calls: AtomicUsize,
}

#[async_trait]
impl GroupHooks for RecordingHooks {
    fn name(&self) -> &str {
        "recording"
    }

    async fn on_message_received(&self, message: InboundMessage) -> Result<(), HookError> {
        self.received.lock().await.push(message);
        Ok(())
    }

    async fn on_connection_closed(
        &self,
        _group: &str,
        connection_id: &str,
        reason: CloseReason,
    ) -> Result<(), HookError> {
        self.closed_calls.fetch_add(1, Ordering::SeqCst);
        self.closed
            .lock()
            .await
            .push((connection_id.to_string(), reason));
        Ok(())
    }
}

/// Fails or panics on every callback.
struct FaultyHooks {
    panic: bool,
}

#[async_trait]
impl GroupHooks for FaultyHooks {
    async fn on_message_received(&self, _message: InboundMessage) -> Result<(), HookError> {
        if self.panic {
            panic!("message hook exploded");
        }
        Err(HookError::new("message hook failed"))
    }

    async fn on_connection_closed(
        &self,
        _group: &str,
        _connection_id: &str,
        _reason: CloseReason,
    ) -> Result<(), HookError> {
        if self.panic {
            panic!("close hook exploded");
        }
        Err(HookError::new("close hook failed"))
    }
}

/// Holds the message hook until released.
#[derive(Default)]
struct StallingHooks {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl GroupHooks for StallingHooks {
    async fn on_message_received(&self, _message: InboundMessage) -> Result<(), HookError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

#[tokio::test]
async fn broadcast_reaches_members_in_every_process() {
    let backend = MemoryBackend::new();
    let one = process(&backend);
    let two = process(&backend);

    let (raw_a, mut peer_a) = channel_connection();
    let (raw_b, mut peer_b) = channel_connection();
    let (_, group_one) = one.attach("room-1", Arc::new(NoopHooks), raw_a).await.unwrap();
    two.attach("room-1", Arc::new(NoopHooks), raw_b).await.unwrap();

    let receivers = group_one.broadcast_message(&json!({"text": "hi"})).await.unwrap();
    assert_eq!(receivers, 2);

    assert_eq!(next_text(&mut peer_a).await, r#"{"text":"hi"}"#);
    assert_eq!(next_text(&mut peer_b).await, r#"{"text":"hi"}"#);

    one.shutdown().await;
    two.shutdown().await;
}

#[tokio::test]
async fn publish_broadcast_needs_no_local_member() {
    let backend = MemoryBackend::new();
    let one = process(&backend);
    let two = process(&backend);

    let (raw, mut peer) = channel_connection();
    two.attach("room-1", Arc::new(NoopHooks), raw).await.unwrap();

    one.publish_broadcast("room-1", &json!(["a", 1])).await.unwrap();
    assert_eq!(next_text(&mut peer).await, r#"["a",1]"#);
    assert!(one.local_group("room-1").is_none());

    two.shutdown().await;
}

#[tokio::test]
async fn broadcasts_keep_publish_order() {
    let backend = MemoryBackend::new();
    let one = process(&backend);
    let two = process(&backend);

    let (raw, mut peer) = channel_connection();
    two.attach("room-1", Arc::new(NoopHooks), raw).await.unwrap();

    for n in 0..20 {
        one.publish_broadcast("room-1", &json!({ "n": n })).await.unwrap();
    }
    for n in 0..20 {
        assert_eq!(next_text(&mut peer).await, json!({ "n": n }).to_string());
    }

    two.shutdown().await;
}

#[tokio::test]
async fn individual_message_reaches_only_its_target() {
    let backend = MemoryBackend::new();
    let one = process(&backend);
    let two = process(&backend);

    let (raw_a, mut peer_a) = channel_connection();
    let (raw_b, mut peer_b) = channel_connection();
    let (raw_c, mut peer_c) = channel_connection();
    let (_, group_one) = one.attach("room-1", Arc::new(NoopHooks), raw_a).await.unwrap();
    let (b, _) = two.attach("room-1", Arc::new(NoopHooks), raw_b).await.unwrap();
    two.attach("room-1", Arc::new(NoopHooks), raw_c).await.unwrap();

    group_one
        .individual_message(&b, &json!({"secret": true}))
        .await
        .unwrap();
    assert_eq!(next_text(&mut peer_b).await, r#"{"secret":true}"#);

    // A broadcast sent afterwards is the first thing the others see
    group_one.broadcast_message(&json!("marker")).await.unwrap();
    assert_eq!(next_text(&mut peer_a).await, r#""marker""#);
    assert_eq!(next_text(&mut peer_c).await, r#""marker""#);
    assert_eq!(next_text(&mut peer_b).await, r#""marker""#);

    one.shutdown().await;
    two.shutdown().await;
}

#[tokio::test]
async fn client_messages_are_relayed_to_every_process() {
    let backend = MemoryBackend::new();
    let one = process(&backend);
    let two = process(&backend);
    let hooks_one = Arc::new(RecordingHooks::default());
    let hooks_two = Arc::new(RecordingHooks::default());

    let (raw_a, peer_a) = channel_connection();
    let (raw_b, _peer_b) = channel_connection();
    let (a, _) = one.attach("room-1", hooks_one.clone(), raw_a).await.unwrap();
    two.attach("room-1", hooks_two.clone(), raw_b).await.unwrap();

    peer_a.message("ping from a");

    for hooks in [&hooks_one, &hooks_two] {
        tokio::time::timeout(Duration::from_secs(5), async {
            while hooks.received.lock().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("relay in time");

        let received = hooks.received.lock().await;
        assert_eq!(
            received[0],
            InboundMessage {
                group_name: "room-1".into(),
                connection_id: a.clone(),
                message: "ping from a".into(),
            }
        );
    }

    one.shutdown().await;
    two.shutdown().await;
}

#[tokio::test]
async fn lifecycle_subscribes_and_releases_three_channels() {
    let backend = MemoryBackend::new();
    let groups = process(&backend);
    let channels = ["room-1_broadcast", "room-1_individualMessage", "room-1_messageReceived"];

    let (raw, peer) = channel_connection();
    let (first_id, first) = groups.attach("room-1", Arc::new(NoopHooks), raw).await.unwrap();
    for channel in channels {
        assert_eq!(backend.subscriber_count(channel), 1, "{channel}");
    }

    peer.close();
    first.wait_drained().await;
    for channel in channels {
        assert_eq!(backend.subscriber_count(channel), 0, "{channel}");
    }
    assert!(groups.active_groups().is_empty());

    let (raw, _peer) = channel_connection();
    let (second_id, second) = groups.attach("room-1", Arc::new(NoopHooks), raw).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_ne!(first_id, second_id);
    assert_eq!(second.connection_ids(), vec![second_id]);
    for channel in channels {
        assert_eq!(backend.subscriber_count(channel), 1, "{channel}");
    }

    groups.shutdown().await;
}

#[tokio::test]
async fn concurrent_first_attaches_share_one_group() {
    let backend = MemoryBackend::new();
    let groups = process(&backend);

    let mut peers = Vec::new();
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let (raw, peer) = channel_connection();
        peers.push(peer);
        let groups = groups.clone();
        tasks.push(tokio::spawn(async move {
            groups.attach("race", Arc::new(NoopHooks), raw).await
        }));
    }

    let mut instances = Vec::new();
    for task in tasks {
        let (_, group) = task.await.unwrap().unwrap();
        instances.push(group);
    }

    assert!(instances.iter().all(|g| Arc::ptr_eq(g, &instances[0])));
    assert_eq!(instances[0].connection_count(), 16);
    assert_eq!(backend.subscriber_count("race_broadcast"), 1);

    groups.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_connection_is_evicted_after_one_missed_heartbeat() {
    let backend = MemoryBackend::new();
    let groups = process(&backend);
    let hooks = Arc::new(RecordingHooks::default());

    let (raw, mut peer) = channel_connection();
    let (id, group) = groups.attach("room-1", hooks.clone(), raw).await.unwrap();
    let started = tokio::time::Instant::now();

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(peer.drain(), vec![Outbound::Ping]);
    assert!(group.contains(&id));

    group.wait_drained().await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(60) && elapsed < Duration::from_secs(61), "{elapsed:?}");
    assert_eq!(peer.drain(), vec![Outbound::Close]);

    assert_eq!(hooks.closed_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        hooks.closed.lock().await.as_slice(),
        &[(id, CloseReason::HeartbeatTimeout)]
    );
    assert_eq!(backend.subscriber_count("room-1_broadcast"), 0);
}

#[tokio::test(start_paused = true)]
async fn answering_pings_keeps_connection() {
    let backend = MemoryBackend::new();
    let groups = process(&backend);

    let (raw, mut peer) = channel_connection();
    let (id, group) = groups.attach("room-1", Arc::new(NoopHooks), raw).await.unwrap();

    let responder = tokio::spawn(async move {
        let mut pings = 0;
        while let Some(frame) = peer.recv().await {
            if frame == Outbound::Ping {
                pings += 1;
                peer.pong();
            }
        }
        pings
    });

    tokio::time::sleep(Duration::from_secs(30 * 5 + 1)).await;
    assert!(group.contains(&id));

    groups.shutdown().await;
    assert_eq!(responder.await.unwrap(), 5);
}

#[tokio::test]
async fn faulty_hooks_do_not_break_the_group() {
    for panic in [false, true] {
        let backend = MemoryBackend::new();
        let groups = process(&backend);
        let hooks = Arc::new(FaultyHooks { panic });

        let (raw_a, peer_a) = channel_connection();
        let (raw_b, mut peer_b) = channel_connection();
        let (_, group) = groups.attach("room-1", hooks.clone(), raw_a).await.unwrap();
        groups.attach("room-1", hooks.clone(), raw_b).await.unwrap();

        // message hook fails, relay pump keeps running
        peer_a.message("boom");
        group.broadcast_message(&json!("after message")).await.unwrap();
        assert_eq!(next_text(&mut peer_b).await, r#""after message""#);

        // close hook fails, removal and fan-out continue
        peer_a.close();
        tokio::time::timeout(Duration::from_secs(5), async {
            while group.connection_count() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("removal in time");

        group.broadcast_message(&json!("after close")).await.unwrap();
        assert_eq!(next_text(&mut peer_b).await, r#""after close""#);

        // last member leaves: drain still completes
        peer_b.close();
        tokio::time::timeout(Duration::from_secs(5), group.wait_drained())
            .await
            .expect("drain in time");
        assert_eq!(backend.subscriber_count("room-1_broadcast"), 0);
    }
}

#[tokio::test]
async fn error_event_removes_only_that_connection() {
    let backend = MemoryBackend::new();
    let groups = process(&backend);
    let hooks = Arc::new(RecordingHooks::default());

    let (raw_a, peer_a) = channel_connection();
    let (raw_b, _peer_b) = channel_connection();
    let (a, group) = groups.attach("room-1", hooks.clone(), raw_a).await.unwrap();
    let (b, _) = groups.attach("room-1", hooks.clone(), raw_b).await.unwrap();

    peer_a.error("connection reset");
    tokio::time::timeout(Duration::from_secs(5), async {
        while group.contains(&a) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("removal in time");

    assert!(group.contains(&b));
    assert!(!group.is_draining());
    assert_eq!(hooks.closed.lock().await.as_slice(), &[(a, CloseReason::Error)]);

    groups.shutdown().await;
    assert_eq!(hooks.closed_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn slow_message_hook_does_not_delay_broadcasts() {
    let backend = MemoryBackend::new();
    let groups = process(&backend);
    let hooks = Arc::new(StallingHooks::default());

    let (raw, mut peer) = channel_connection();
    let (_, group) = groups.attach("room-1", hooks.clone(), raw).await.unwrap();

    assert!(peer.message("hold on"));
    hooks.entered.notified().await;

    group.broadcast_message(&json!({"text": "still flowing"})).await.unwrap();
    assert_eq!(next_text(&mut peer).await, r#"{"text":"still flowing"}"#);

    hooks.release.notify_one();
    groups.shutdown().await;
}
