//! Realtime connection groups coordinated through the shared backend.
//!
//! Each process keeps its own members of a named group in a [`Group`]. The
//! name is the only thing shared between processes: every group instance
//! subscribes to three channels derived from it.
//!
//! | Channel                     | Payload                                   | Effect                                   |
//! |-----------------------------|-------------------------------------------|------------------------------------------|
//! | `{name}_broadcast`          | any JSON                                  | sent to every local connection           |
//! | `{name}_individualMessage`  | `{"connectionId": .., "message": ..}`     | sent to the local connection with the id |
//! | `{name}_messageReceived`    | `{"groupName", "connectionId", "message"}`| passed to `on_message_received`          |
//!
//! Lifecycle: a group is created on first attach, pings its connections
//! every heartbeat interval, evicts connections that miss a pong, and drains
//! once its last connection leaves.

pub mod connection;
pub mod group;
pub mod hooks;
pub mod registry;
pub mod ws;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use groupcast_core::BackendError;
use serde_json::json;

pub use connection::{
    ConnectionError, ConnectionEvent, ConnectionId, ConnectionPeer, ConnectionSink, Outbound,
    RawConnection, channel_connection,
};
pub use group::{
    Group, IndividualEnvelope, broadcast_channel, individual_channel, message_received_channel,
};
pub use hooks::{CloseReason, GroupHooks, HookError, InboundMessage, LoggingHooks, NoopHooks};
pub use registry::GroupBroadcaster;

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("group backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("failed to encode group payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The group stopped accepting connections.
    #[error("group '{0}' is draining")]
    Draining(String),

    #[error("group '{0}' did not receive all channel subscriptions")]
    Subscription(String),
}

impl IntoResponse for GroupError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Backend(_) | Self::Subscription(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Serialization(_) => StatusCode::BAD_REQUEST,
            Self::Draining(_) => StatusCode::CONFLICT,
        };
        tracing::warn!(error = %self, status = status.as_u16(), "group request failed");
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
