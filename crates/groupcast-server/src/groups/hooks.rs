//! Caller-supplied callbacks for group activity.
//!
//! Hooks run inside the group's own tasks. Errors and panics are logged and
//! swallowed so a faulty hook never tears down a group or its connections.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Client message relayed on the `{group}_messageReceived` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub group_name: String,
    pub connection_id: String,
    /// Raw text sent by the client. Not parsed here.
    pub message: String,
}

/// Why a connection left its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the connection.
    Closed,
    /// The transport reported an error.
    Error,
    /// No pong arrived within one heartbeat period.
    HeartbeatTimeout,
    /// Removed by the server.
    Removed,
    /// The group or the broadcaster shut down.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Error => "error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Removed => "removed",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether the server side still has to close the transport.
    pub(crate) fn server_initiated(&self) -> bool {
        matches!(self, Self::HeartbeatTimeout | Self::Removed | Self::Shutdown)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Callbacks supplied when a group is created.
///
/// `on_message_received` runs in every process hosting the group, for every
/// client message published by any of them.
#[async_trait]
pub trait GroupHooks: Send + Sync {
    fn name(&self) -> &str {
        "group-hooks"
    }

    async fn on_message_received(&self, _message: InboundMessage) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_connection_closed(
        &self,
        _group: &str,
        _connection_id: &str,
        _reason: CloseReason,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl GroupHooks for NoopHooks {}

/// Hooks that log each callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHooks;

#[async_trait]
impl GroupHooks for LoggingHooks {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_message_received(&self, message: InboundMessage) -> Result<(), HookError> {
        info!(
            group = %message.group_name,
            connection_id = %message.connection_id,
            bytes = message.message.len(),
            "message received"
        );
        Ok(())
    }

    async fn on_connection_closed(
        &self,
        group: &str,
        connection_id: &str,
        reason: CloseReason,
    ) -> Result<(), HookError> {
        info!(group = %group, connection_id = %connection_id, reason = %reason, "connection closed");
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Await a hook future, logging its error or panic instead of propagating it.
/// Returns `true` when the hook completed successfully.
pub(crate) async fn run_isolated<F>(group: &str, hook: &str, callback: &'static str, fut: F) -> bool
where
    F: Future<Output = Result<(), HookError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {
            debug!(group = %group, hook = %hook, callback, "hook completed");
            true
        }
        Ok(Err(e)) => {
            warn!(group = %group, hook = %hook, callback, error = %e, "hook failed");
            false
        }
        Err(panic) => {
            error!(
                group = %group,
                hook = %hook,
                callback,
                panic = %panic_message(panic.as_ref()),
                "hook panicked"
            );
            false
        }
    }
}
