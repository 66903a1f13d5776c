use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    extract::{ConnectInfo, FromRequestParts, Path, Query, State, WebSocketUpgrade},
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use groupcast_core::RequestDescriptor;
use serde::Serialize;
use serde_json::{Value, json};

use crate::cache::{CachePolicy, CachedResponse};
use crate::groups::{GroupError, LoggingHooks, ws};
use crate::guard::GuardError;
use crate::metrics::render_metrics;
use crate::server::AppState;

/// Max age of the cached group summary.
const GROUP_SUMMARY_MAX_AGE_SECS: u64 = 5;

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
    backend: &'a str,
}

/// Remote address of the caller, `unknown` when the server was started
/// without connect info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddress(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientAddress {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let address = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Self(address))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Group(#[from] GroupError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Guard(e) => e.into_response(),
            Self::Group(e) => e.into_response(),
        }
    }
}

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            backend: state.backend.kind(),
        }),
    )
}

pub async fn metrics() -> Response {
    match render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}

/// `GET /ws/{group}`: upgrade and join the group.
pub async fn join_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let broadcaster = state.groups.clone();
    upgrade.on_upgrade(move |socket| ws::serve_socket(socket, broadcaster, group, Arc::new(LoggingHooks)))
}

/// `POST /groups/{group}/broadcast`: publish the JSON body to every member.
pub async fn broadcast(
    State(state): State<AppState>,
    Path(group): Path<String>,
    ClientAddress(client): ClientAddress,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let request = RequestDescriptor::new("POST", "/groups/{group}/broadcast")
        .with_param("group", group.as_str())
        .with_client_address(client)
        .with_body(body);

    state.guard.check_request(&request).await?;

    let payload = request.body.unwrap_or(Value::Null);
    let receivers = state.groups.publish_broadcast(&group, &payload).await?;
    tracing::debug!(group = %group, receivers, "broadcast accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "group": group, "receivers": receivers })),
    ))
}

/// `GET /groups/{group}`: this process's members of the group.
pub async fn group_summary(
    State(state): State<AppState>,
    Path(group): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
) -> Response {
    let mut request =
        RequestDescriptor::new("GET", "/groups/{group}").with_param("group", group.as_str());
    for (name, value) in query {
        request = request.with_query(name, value);
    }

    let groups = state.groups.clone();
    let result = state
        .cache
        .cached_or_compute(
            &request,
            &CachePolicy::cached_for(GROUP_SUMMARY_MAX_AGE_SECS),
            || async move {
                let (active, connections) = match groups.local_group(&group) {
                    Some(local) => (true, local.connection_ids()),
                    None => (false, Vec::new()),
                };
                Ok::<_, Infallible>(CachedResponse::json(
                    200,
                    json!({
                        "group": group,
                        "active": active,
                        "connectionCount": connections.len(),
                        "connectionIds": connections,
                    }),
                ))
            },
        )
        .await;

    match result {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}
