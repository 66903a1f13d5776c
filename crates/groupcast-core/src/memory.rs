//! In-process implementation of [`SharedBackend`].
//!
//! Used when Redis is disabled or unreachable, and by tests that model
//! several processes by handing clones of one `MemoryBackend` to several
//! components. Expiry uses [`tokio::time::Instant`], so tests running with a
//! paused clock can advance time deterministically.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::backend::{SharedBackend, Subscription, SubscriptionId};
use crate::error::{BackendError, Result};

#[derive(Debug, Clone)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn new(data: &[u8], ttl_secs: u64) -> Self {
        Self {
            data: data.to_vec(),
            expires_at: Instant::now() + Duration::from_secs(ttl_secs),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime in whole seconds, rounded up.
    fn remaining_secs(&self, now: Instant) -> i64 {
        let remaining = self.expires_at.saturating_duration_since(now);
        remaining.as_millis().div_ceil(1000) as i64
    }
}

type Subscribers = Vec<(SubscriptionId, mpsc::UnboundedSender<Vec<u8>>)>;

/// Minimum time between two sweeps of expired keys.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Inner {
    values: DashMap<String, StoredValue>,
    channels: DashMap<String, Subscribers>,
    subscriptions: DashMap<SubscriptionId, String>,
    next_id: AtomicU64,
    last_sweep: Mutex<Instant>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            values: DashMap::new(),
            channels: DashMap::new(),
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(0),
            last_sweep: Mutex::new(Instant::now()),
        }
    }
}

/// Process-local key-value store with TTLs and channel fan-out.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .values
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        *self.inner.last_sweep.lock() = now;
        let before = self.inner.values.len();
        self.inner.values.retain(|_, value| !value.is_expired(now));
        before.saturating_sub(self.inner.values.len())
    }

    /// Keys written once and never read again would otherwise stay until
    /// the process exits. Writes trigger a sweep at most every
    /// [`SWEEP_INTERVAL`].
    fn sweep_if_due(&self) {
        {
            let last = self.inner.last_sweep.lock();
            if last.elapsed() < SWEEP_INTERVAL {
                return;
            }
        }
        let removed = self.purge_expired();
        if removed > 0 {
            tracing::debug!(removed, "expired keys swept (memory)");
        }
    }

    fn ensure_ttl(ttl_secs: u64) -> Result<()> {
        if ttl_secs == 0 {
            return Err(BackendError::command("invalid expire time in 'set' command"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("keys", &self.inner.values.len())
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}

#[async_trait]
impl SharedBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get_with_ttl(key).await?.map(|(data, _)| data))
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()> {
        Self::ensure_ttl(ttl_secs)?;
        self.sweep_if_due();
        self.inner
            .values
            .insert(key.to_string(), StoredValue::new(value, ttl_secs));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<bool> {
        Self::ensure_ttl(ttl_secs)?;
        self.sweep_if_due();
        let now = Instant::now();
        match self.inner.values.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredValue::new(value, ttl_secs));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl_secs));
                Ok(true)
            }
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.inner.values.remove(key);
        Ok(())
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Vec<u8>, i64)>> {
        let now = Instant::now();
        // Value and TTL are read under one shard guard.
        let found = match self.inner.values.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                return Ok(Some((entry.data.clone(), entry.remaining_secs(now))));
            }
            Some(_) => true,
            None => false,
        };

        if found {
            self.inner
                .values
                .remove_if(key, |_, value| value.is_expired(now));
        }
        Ok(None)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize> {
        let Some(mut subscribers) = self.inner.channels.get_mut(channel) else {
            return Ok(0);
        };
        subscribers.retain(|(_, sender)| sender.send(payload.to_vec()).is_ok());
        Ok(subscribers.len())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();

        self.inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .push((id, sender));
        self.inner.subscriptions.insert(id, channel.to_string());

        tracing::debug!(channel = %channel, subscription_id = id, "subscribed (memory)");

        Ok(Subscription {
            id,
            channel: channel.to_string(),
            receiver,
        })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let Some((_, channel)) = self.inner.subscriptions.remove(&id) else {
            return Ok(());
        };

        if let Entry::Occupied(mut occupied) = self.inner.channels.entry(channel.clone()) {
            occupied.get_mut().retain(|(sub_id, _)| *sub_id != id);
            if occupied.get().is_empty() {
                occupied.remove();
            }
        }

        tracing::debug!(channel = %channel, subscription_id = id, "unsubscribed (memory)");
        Ok(())
    }

    fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .get(channel)
            .map(|subs| subs.iter().filter(|(_, sender)| !sender.is_closed()).count())
            .unwrap_or(0)
    }
}
