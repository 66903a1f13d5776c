//! Test doubles shared by unit tests.

use async_trait::async_trait;
use groupcast_core::{BackendError, SharedBackend, Subscription, SubscriptionId};

/// A backend that is never reachable.
pub(crate) struct UnavailableBackend;

fn down<T>() -> Result<T, BackendError> {
    Err(BackendError::unavailable("connection refused"))
}

#[async_trait]
impl SharedBackend for UnavailableBackend {
    fn kind(&self) -> &'static str {
        "unavailable"
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        down()
    }

    async fn set_ex(&self, _key: &str, _value: &[u8], _ttl_secs: u64) -> Result<(), BackendError> {
        down()
    }

    async fn set_nx_ex(
        &self,
        _key: &str,
        _value: &[u8],
        _ttl_secs: u64,
    ) -> Result<bool, BackendError> {
        down()
    }

    async fn del(&self, _key: &str) -> Result<(), BackendError> {
        down()
    }

    async fn get_with_ttl(&self, _key: &str) -> Result<Option<(Vec<u8>, i64)>, BackendError> {
        down()
    }

    async fn publish(&self, _channel: &str, _payload: &[u8]) -> Result<usize, BackendError> {
        down()
    }

    async fn subscribe(&self, _channel: &str) -> Result<Subscription, BackendError> {
        down()
    }

    async fn unsubscribe(&self, _id: SubscriptionId) -> Result<(), BackendError> {
        down()
    }

    fn subscriber_count(&self, _channel: &str) -> usize {
        0
    }
}
