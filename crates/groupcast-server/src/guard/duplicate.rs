use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use groupcast_core::{BackendError, RequestDescriptor, SharedBackend};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::config::DuplicateGuardConfig;
use crate::metrics;

/// Sentinel stored under a guard key.
const SENTINEL: &[u8] = b"1";

/// How the check-and-mark step talks to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuardMode {
    /// Read the key, then write it. Two requests racing within the gap
    /// between both calls can both pass.
    #[default]
    GetThenSet,
    /// One `SET NX EX`; exactly one of several racing requests passes.
    Atomic,
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// An identical request from this client is still inside its window.
    #[error("Too many requests")]
    Duplicate,

    #[error("duplicate guard backend error: {0}")]
    Backend(#[from] BackendError),
}

impl GuardError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Duplicate => StatusCode::TOO_MANY_REQUESTS,
            Self::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for GuardError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

/// Backend key for a client address and the JSON text of a request body:
/// `hashedRequests:{client}:{sha256(sha256(body))}`, both digests hex encoded.
pub fn guard_key(client_address: &str, body_json: &str) -> String {
    let body_hash = sha256_hex(body_json.as_bytes());
    let fingerprint = sha256_hex(body_hash.as_bytes());
    format!("hashedRequests:{client_address}:{fingerprint}")
}

/// Rejects repeats of a request from the same client within a time window.
#[derive(Clone)]
pub struct DuplicateRequestGuard {
    backend: Arc<dyn SharedBackend>,
    window: Duration,
    mode: GuardMode,
}

impl DuplicateRequestGuard {
    pub fn new(backend: Arc<dyn SharedBackend>, window: Duration, mode: GuardMode) -> Self {
        Self {
            backend,
            window,
            mode,
        }
    }

    pub fn from_config(backend: Arc<dyn SharedBackend>, config: &DuplicateGuardConfig) -> Self {
        let mode = if config.atomic {
            GuardMode::Atomic
        } else {
            GuardMode::GetThenSet
        };
        Self::new(backend, Duration::from_secs(config.window_secs), mode)
    }

    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Let the request through and open its window, or fail with
    /// [`GuardError::Duplicate`] if the window is already open.
    pub async fn check(&self, client_address: &str, body_json: &str) -> Result<(), GuardError> {
        let key = guard_key(client_address, body_json);
        let ttl_secs = self.window.as_secs().max(1);

        let admitted = match self.mode {
            GuardMode::GetThenSet => {
                if self.backend.get(&key).await?.is_some() {
                    false
                } else {
                    self.backend.set_ex(&key, SENTINEL, ttl_secs).await?;
                    true
                }
            }
            GuardMode::Atomic => self.backend.set_nx_ex(&key, SENTINEL, ttl_secs).await?,
        };

        if admitted {
            tracing::debug!(client = %client_address, key = %key, "request admitted");
            Ok(())
        } else {
            tracing::info!(client = %client_address, key = %key, "duplicate request rejected");
            metrics::record_duplicate_rejected();
            Err(GuardError::Duplicate)
        }
    }

    /// [`check`](Self::check) for a normalized request descriptor.
    pub async fn check_request(&self, request: &RequestDescriptor) -> Result<(), GuardError> {
        self.check(&request.client_address, &request.body_json())
            .await
    }
}
