//! The shared key-value / publish-subscribe seam.
//!
//! Every process in a fleet talks to the same backend. The components built on
//! top of it only rely on the primitives below, so a Redis deployment and the
//! in-process [`MemoryBackend`](crate::MemoryBackend) are interchangeable.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Identifier of one live subscription, unique per backend instance.
pub type SubscriptionId = u64;

/// A live subscription to one channel.
///
/// Payloads arrive on [`Subscription::receiver`] in the order they were
/// published to the channel. The receiver yields `None` once the subscription
/// has been removed with [`SharedBackend::unsubscribe`] or the backend lost the
/// underlying connection.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub channel: String,
    pub receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    /// Receive the next payload published on the channel.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }
}

/// Primitives offered by the shared backend.
#[async_trait]
pub trait SharedBackend: Send + Sync {
    /// Short name used in logs and health output (`memory`, `redis`).
    fn kind(&self) -> &'static str;

    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value that expires after `ttl_secs` seconds.
    async fn set_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()>;

    /// Write a value only if the key is absent. Returns `true` when written.
    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<bool>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn del(&self, key: &str) -> Result<()>;

    /// Read a value together with its remaining time-to-live in one atomic
    /// operation.
    ///
    /// The remaining TTL is reported in whole seconds. A key that exists
    /// without an expiry reports `-1`.
    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Vec<u8>, i64)>>;

    /// Publish a payload. Returns the number of receivers reported by the
    /// backend.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize>;

    /// Subscribe to a channel. The subscription is active when this returns:
    /// anything published afterwards is delivered.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Remove a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    /// Number of subscriptions this backend instance holds on `channel`.
    fn subscriber_count(&self, channel: &str) -> usize;
}
