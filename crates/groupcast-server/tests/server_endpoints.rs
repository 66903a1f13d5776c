use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use groupcast_core::MemoryBackend;
use groupcast_server::groups::{NoopHooks, Outbound, channel_connection};
use groupcast_server::{AppConfig, AppState, build_app};
use serde_json::{Value, json};
use tower::ServiceExt;

fn state(backend: &MemoryBackend) -> AppState {
    let mut config = AppConfig::default();
    config.cache.add_cache_headers = true;
    AppState::new(config, Arc::new(backend.clone()))
}

fn post_json(uri: &str, body: &Value, client: &str) -> Request<Body> {
    let mut request = Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let addr: SocketAddr = format!("{client}:40000").parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, body)
}

#[tokio::test]
async fn healthz_reports_backend() {
    let app = build_app(state(&MemoryBackend::new()));

    let (status, _, body) = send(&app, Request::get("/healthz").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "backend": "memory"}));
}

#[tokio::test]
async fn broadcast_endpoint_publishes_and_rejects_duplicates() {
    let backend = MemoryBackend::new();
    let app_state = state(&backend);
    let groups = app_state.groups.clone();
    let app = build_app(app_state);

    let (raw, mut peer) = channel_connection();
    groups.attach("room-1", Arc::new(NoopHooks), raw).await.unwrap();

    let payload = json!({"text": "hi"});
    let (status, _, body) = send(&app, post_json("/groups/room-1/broadcast", &payload, "10.0.0.1")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["group"], "room-1");
    assert_eq!(body["receivers"], 1);
    assert_eq!(peer.recv().await, Some(Outbound::Text(r#"{"text":"hi"}"#.into())));

    // Same client, same body, inside the window
    let (status, _, body) = send(&app, post_json("/groups/room-1/broadcast", &payload, "10.0.0.1")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body, json!({"error": "Too many requests"}));

    // Another client is not affected
    let (status, _, _) = send(&app, post_json("/groups/room-1/broadcast", &payload, "10.0.0.2")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    groups.shutdown().await;
}

#[tokio::test]
async fn duplicate_window_spans_instances() {
    let backend = MemoryBackend::new();
    let first = build_app(state(&backend));
    let second = build_app(state(&backend));

    let payload = json!({"order": 7});
    let (status, _, _) = send(&first, post_json("/groups/orders/broadcast", &payload, "10.0.0.1")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, _) = send(&second, post_json("/groups/orders/broadcast", &payload, "10.0.0.1")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn group_summary_is_cached() {
    let backend = MemoryBackend::new();
    let app_state = state(&backend);
    let groups = app_state.groups.clone();
    let app = build_app(app_state);

    let (raw, _peer) = channel_connection();
    let (id, _) = groups.attach("room-1", Arc::new(NoopHooks), raw).await.unwrap();

    let (status, headers, body) =
        send(&app, Request::get("/groups/room-1").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-cache"], "MISS");
    assert_eq!(headers["x-cache-age"], "0");
    assert_eq!(headers["x-cache-expires"], "5");
    assert_eq!(body["active"], true);
    assert_eq!(body["connectionCount"], 1);
    assert_eq!(body["connectionIds"], json!([id]));

    let (status, headers, cached) =
        send(&app, Request::get("/groups/room-1").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-cache"], "HIT");
    assert_eq!(headers["x-cache-expires"], "5");
    assert_eq!(cached, body);

    // A different query is a different key
    let (_, headers, _) =
        send(&app, Request::get("/groups/room-1?verbose=1").body(Body::empty()).unwrap()).await;
    assert_eq!(headers["x-cache"], "MISS");

    groups.shutdown().await;
}

#[tokio::test]
async fn unknown_group_summary_is_inactive() {
    let app = build_app(state(&MemoryBackend::new()));

    let (status, _, body) =
        send(&app, Request::get("/groups/nobody").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], false);
    assert_eq!(body["connectionCount"], 0);
}

#[tokio::test]
async fn websocket_route_requires_upgrade() {
    let app = build_app(state(&MemoryBackend::new()));

    let response = app
        .oneshot(Request::get("/ws/room-1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}
