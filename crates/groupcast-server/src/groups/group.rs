//! One process's view of a named group.
//!
//! A [`Group`] owns the connections this process holds for a name and the
//! three backend subscriptions that tie it to every other process hosting
//! the same name. It lives from its first connection until its connection
//! count returns to zero, then drains: unsubscribe, stop the heartbeat,
//! leave the registry. A later attach builds a fresh instance.
//!
//! A subscription that ends while the group is live (the backend dropped
//! the connection) closes the group the same way, so members reconnect into
//! a freshly subscribed instance.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use groupcast_core::{BackendError, SharedBackend, Subscription, SubscriptionId, generate_id};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::GroupError;
use super::connection::{ConnectionEvent, ConnectionId, ConnectionSink, RawConnection};
use super::hooks::{CloseReason, GroupHooks, InboundMessage, run_isolated};
use super::registry::Registry;
use crate::metrics;

/// Channel carrying payloads for every member of the group.
pub fn broadcast_channel(group: &str) -> String {
    format!("{group}_broadcast")
}

/// Channel carrying payloads addressed to one connection id.
pub fn individual_channel(group: &str) -> String {
    format!("{group}_individualMessage")
}

/// Channel carrying client messages relayed for central handling.
pub fn message_received_channel(group: &str) -> String {
    format!("{group}_messageReceived")
}

/// Payload published on the individual-message channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndividualEnvelope {
    pub connection_id: String,
    pub message: Value,
}

enum Delivery {
    Broadcast(Vec<u8>),
    Individual(Vec<u8>),
}

struct ConnectionEntry {
    sink: Arc<dyn ConnectionSink>,
    alive: bool,
    cancel: CancellationToken,
}

#[derive(Default)]
struct GroupState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    draining: bool,
}

/// Local state of a named group.
pub struct Group {
    name: String,
    backend: Arc<dyn SharedBackend>,
    hooks: Arc<dyn GroupHooks>,
    state: Mutex<GroupState>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    /// Stops the channel pump, the heartbeat and per-connection tasks.
    shutdown: CancellationToken,
    /// Fired once draining has finished.
    drained: CancellationToken,
    registry: Weak<Registry>,
}

impl Group {
    /// Subscribe the three group channels and start the background tasks.
    pub(crate) async fn create(
        name: &str,
        backend: Arc<dyn SharedBackend>,
        hooks: Arc<dyn GroupHooks>,
        heartbeat_interval: Duration,
        registry: Weak<Registry>,
    ) -> Result<Arc<Self>, GroupError> {
        let channels = [
            broadcast_channel(name),
            individual_channel(name),
            message_received_channel(name),
        ];

        let mut subscriptions: Vec<Subscription> = Vec::with_capacity(channels.len());
        for channel in &channels {
            match backend.subscribe(channel).await {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => {
                    for subscription in &subscriptions {
                        if let Err(unsub_err) = backend.unsubscribe(subscription.id).await {
                            warn!(channel = %subscription.channel, error = %unsub_err, "rollback unsubscribe failed");
                        }
                    }
                    warn!(group = %name, channel = %channel, error = %e, "failed to subscribe group channel");
                    return Err(e.into());
                }
            }
        }

        let mut receivers = subscriptions.into_iter();
        let (Some(broadcast), Some(individual), Some(received)) =
            (receivers.next(), receivers.next(), receivers.next())
        else {
            return Err(GroupError::Subscription(name.to_string()));
        };

        let group = Arc::new(Self {
            name: name.to_string(),
            backend,
            hooks,
            state: Mutex::new(GroupState::default()),
            subscriptions: Mutex::new(vec![broadcast.id, individual.id, received.id]),
            shutdown: CancellationToken::new(),
            drained: CancellationToken::new(),
            registry,
        });

        tokio::spawn(Arc::clone(&group).pump_delivery(broadcast, individual));
        tokio::spawn(Arc::clone(&group).pump_relay(received));
        tokio::spawn(Arc::clone(&group).run_heartbeat(heartbeat_interval));

        info!(group = %name, "group created");
        Ok(group)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.state.lock().connections.keys().cloned().collect()
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.state.lock().connections.contains_key(connection_id)
    }

    /// Whether the group has started draining. A draining group accepts no
    /// new connections.
    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    /// Resolves once draining has finished and the group left its registry.
    pub async fn wait_drained(&self) {
        self.drained.cancelled().await;
    }

    /// Add a connection and start consuming its events.
    pub fn add_connection(self: &Arc<Self>, connection: RawConnection) -> Result<ConnectionId, GroupError> {
        self.try_add(connection)
            .map_err(|_| GroupError::Draining(self.name.clone()))
    }

    /// Like [`add_connection`](Self::add_connection) but hands the connection
    /// back if the group is draining, so the caller can retry elsewhere.
    pub(crate) fn try_add(self: &Arc<Self>, connection: RawConnection) -> Result<ConnectionId, RawConnection> {
        let RawConnection { sink, events } = connection;
        let id = generate_id();
        let cancel = self.shutdown.child_token();

        {
            let mut state = self.state.lock();
            if state.draining {
                return Err(RawConnection::new(sink, events));
            }
            state.connections.insert(
                id.clone(),
                ConnectionEntry {
                    sink,
                    alive: true,
                    cancel: cancel.clone(),
                },
            );
        }

        metrics::record_connection_added();
        debug!(group = %self.name, connection_id = %id, "connection added");

        tokio::spawn(Arc::clone(self).run_connection(id.clone(), events, cancel));
        Ok(id)
    }

    /// Publish a payload to every member of the group in every process.
    /// Returns the receiver count reported by the backend.
    pub async fn broadcast_message<T: Serialize + ?Sized>(&self, payload: &T) -> Result<usize, GroupError> {
        let bytes = serde_json::to_vec(payload)?;
        let receivers = self
            .backend
            .publish(&broadcast_channel(&self.name), &bytes)
            .await?;
        trace!(group = %self.name, receivers, "broadcast published");
        Ok(receivers)
    }

    /// Publish a payload for one connection id. Only the process holding
    /// that connection delivers it.
    pub async fn individual_message<T: Serialize + ?Sized>(
        &self,
        connection_id: &str,
        payload: &T,
    ) -> Result<usize, GroupError> {
        let envelope = IndividualEnvelope {
            connection_id: connection_id.to_string(),
            message: serde_json::to_value(payload)?,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        let receivers = self
            .backend
            .publish(&individual_channel(&self.name), &bytes)
            .await?;
        trace!(group = %self.name, connection_id = %connection_id, receivers, "individual message published");
        Ok(receivers)
    }

    /// Close one local connection from the server side.
    pub async fn close_connection(&self, connection_id: &str) -> bool {
        self.remove_connection(connection_id, CloseReason::Removed)
            .await
    }

    /// Close every local connection and drain the group. Returns once the
    /// group is fully drained, including when another task drains it.
    pub async fn close(&self) {
        let ids = {
            let mut state = self.state.lock();
            if state.draining {
                None
            } else {
                state.draining = true;
                Some(state.connections.keys().cloned().collect::<Vec<_>>())
            }
        };

        if let Some(ids) = ids {
            for id in ids {
                self.remove_connection(&id, CloseReason::Shutdown).await;
            }
            self.drain().await;
        }

        self.wait_drained().await;
    }

    /// Remove a connection, notify the closed hook and drain if it was the
    /// last one. Returns `false` if the id was not present.
    pub(crate) async fn remove_connection(&self, connection_id: &str, reason: CloseReason) -> bool {
        let (entry, drain) = {
            let mut state = self.state.lock();
            let Some(entry) = state.connections.remove(connection_id) else {
                return false;
            };
            let drain = state.connections.is_empty() && !state.draining;
            if drain {
                state.draining = true;
            }
            (entry, drain)
        };

        entry.cancel.cancel();
        if reason.server_initiated() {
            entry.sink.close().await;
        }

        info!(group = %self.name, connection_id = %connection_id, reason = %reason, "connection removed");

        run_isolated(
            &self.name,
            self.hooks.name(),
            "on_connection_closed",
            self.hooks
                .on_connection_closed(&self.name, connection_id, reason),
        )
        .await;

        if drain {
            self.drain().await;
        }
        true
    }

    /// Unsubscribe, stop background tasks, leave the registry. In that order.
    async fn drain(&self) {
        debug!(group = %self.name, "group draining");

        let ids = std::mem::take(&mut *self.subscriptions.lock());
        for id in ids {
            if let Err(e) = self.backend.unsubscribe(id).await {
                warn!(group = %self.name, subscription_id = id, error = %e, "failed to unsubscribe group channel");
            }
        }

        self.shutdown.cancel();

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_group(self);
        }

        self.drained.cancel();
        info!(group = %self.name, "group drained");
    }

    #[cfg(test)]
    pub(crate) fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.subscriptions.lock().clone()
    }

    fn mark_alive(&self, connection_id: &str) {
        if let Some(entry) = self.state.lock().connections.get_mut(connection_id) {
            entry.alive = true;
        }
    }

    fn sink(&self, connection_id: &str) -> Option<Arc<dyn ConnectionSink>> {
        self.state
            .lock()
            .connections
            .get(connection_id)
            .map(|entry| Arc::clone(&entry.sink))
    }

    fn sinks(&self) -> Vec<(ConnectionId, Arc<dyn ConnectionSink>)> {
        self.state
            .lock()
            .connections
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.sink)))
            .collect()
    }

    async fn run_connection(
        self: Arc<Self>,
        connection_id: ConnectionId,
        mut events: tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                event = events.recv() => event,
            };

            match event {
                Some(ConnectionEvent::Message(text)) => self.relay_inbound(&connection_id, text).await,
                Some(ConnectionEvent::Pong) => self.mark_alive(&connection_id),
                Some(ConnectionEvent::Close) | None => {
                    self.remove_connection(&connection_id, CloseReason::Closed)
                        .await;
                    return;
                }
                Some(ConnectionEvent::Error(reason)) => {
                    warn!(group = %self.name, connection_id = %connection_id, error = %reason, "connection error");
                    self.remove_connection(&connection_id, CloseReason::Error)
                        .await;
                    return;
                }
            }
        }
    }

    async fn relay_inbound(&self, connection_id: &str, message: String) {
        let envelope = InboundMessage {
            group_name: self.name.clone(),
            connection_id: connection_id.to_string(),
            message,
        };

        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(group = %self.name, error = %e, "failed to encode inbound message");
                return;
            }
        };

        if let Err(e) = self
            .backend
            .publish(&message_received_channel(&self.name), &bytes)
            .await
        {
            warn!(group = %self.name, connection_id = %connection_id, error = %e, "failed to relay inbound message");
        }
    }

    /// Forward broadcast and individual payloads to local connections. One
    /// loop keeps the order of each channel intact.
    async fn pump_delivery(self: Arc<Self>, mut broadcast: Subscription, mut individual: Subscription) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                payload = broadcast.recv() => payload
                    .map(Delivery::Broadcast)
                    .ok_or_else(|| broadcast_channel(&self.name)),
                payload = individual.recv() => payload
                    .map(Delivery::Individual)
                    .ok_or_else(|| individual_channel(&self.name)),
            };

            match next {
                Ok(Delivery::Broadcast(payload)) => self.deliver_broadcast(&payload).await,
                Ok(Delivery::Individual(payload)) => self.deliver_individual(&payload).await,
                Err(channel) => {
                    self.subscription_lost(channel).await;
                    return;
                }
            }
        }
    }

    /// Run the message-received hook for relayed client messages. Separate
    /// from delivery so a slow hook never holds up fan-out.
    async fn pump_relay(self: Arc<Self>, mut received: Subscription) {
        loop {
            let payload = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                payload = received.recv() => payload,
            };

            match payload {
                Some(payload) => self.handle_received(&payload).await,
                None => {
                    self.subscription_lost(message_received_channel(&self.name))
                        .await;
                    return;
                }
            }
        }
    }

    /// A subscription stream ended. Expected while draining; otherwise the
    /// group can no longer hear its channels and is closed.
    async fn subscription_lost(&self, channel: String) {
        if self.shutdown.is_cancelled() || self.is_draining() {
            debug!(group = %self.name, channel = %channel, "channel pump stopped");
            return;
        }

        let err = BackendError::closed(channel);
        warn!(group = %self.name, error = %err, "group subscription lost, closing group");
        self.close().await;
    }

    async fn deliver_broadcast(&self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        for (id, sink) in self.sinks() {
            if let Err(e) = sink.send(&text).await {
                debug!(group = %self.name, connection_id = %id, error = %e, "broadcast delivery failed");
            }
        }
    }

    async fn deliver_individual(&self, payload: &[u8]) {
        let envelope: IndividualEnvelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(group = %self.name, error = %e, "malformed individual message");
                return;
            }
        };

        let Some(sink) = self.sink(&envelope.connection_id) else {
            trace!(group = %self.name, connection_id = %envelope.connection_id, "individual message for connection held elsewhere");
            return;
        };

        let text = envelope.message.to_string();
        if let Err(e) = sink.send(&text).await {
            debug!(group = %self.name, connection_id = %envelope.connection_id, error = %e, "individual delivery failed");
        }
    }

    async fn handle_received(&self, payload: &[u8]) {
        let message: InboundMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(group = %self.name, error = %e, "malformed relayed message");
                return;
            }
        };

        run_isolated(
            &self.name,
            self.hooks.name(),
            "on_message_received",
            self.hooks.on_message_received(message),
        )
        .await;
    }

    async fn run_heartbeat(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.heartbeat_tick().await,
            }
        }
    }

    /// Evict connections that missed the previous ping, then ping the rest.
    async fn heartbeat_tick(&self) {
        let (dead, to_ping) = {
            let mut state = self.state.lock();
            let mut dead = Vec::new();
            let mut to_ping = Vec::new();
            for (id, entry) in state.connections.iter_mut() {
                if entry.alive {
                    entry.alive = false;
                    to_ping.push((id.clone(), Arc::clone(&entry.sink)));
                } else {
                    dead.push(id.clone());
                }
            }
            (dead, to_ping)
        };

        for id in dead {
            if self
                .remove_connection(&id, CloseReason::HeartbeatTimeout)
                .await
            {
                metrics::record_heartbeat_eviction();
            }
        }

        for (id, sink) in to_ping {
            if let Err(e) = sink.ping().await {
                debug!(group = %self.name, connection_id = %id, error = %e, "heartbeat ping failed");
            }
        }
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("connections", &self.connection_count())
            .field("draining", &self.is_draining())
            .finish()
    }
}
