//! Per-broadcaster registry of local groups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use groupcast_core::SharedBackend;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::GroupError;
use super::connection::{ConnectionId, RawConnection};
use super::group::{Group, broadcast_channel};
use super::hooks::GroupHooks;
use crate::metrics;

/// Placeholder claimed before a group's subscriptions exist, so concurrent
/// first attaches for one name wait on the same creation.
#[derive(Default)]
struct GroupSlot {
    cell: OnceCell<Arc<Group>>,
}

pub(crate) struct Registry {
    backend: Arc<dyn SharedBackend>,
    heartbeat_interval: Duration,
    slots: Mutex<HashMap<String, Arc<GroupSlot>>>,
}

impl Registry {
    /// Drop the slot holding `group`, if it still does.
    pub(crate) fn remove_group(&self, group: &Group) {
        let mut slots = self.slots.lock();
        let holds_group = slots
            .get(group.name())
            .and_then(|slot| slot.cell.get())
            .is_some_and(|current| std::ptr::eq(current.as_ref(), group));
        if holds_group {
            slots.remove(group.name());
            debug!(group = %group.name(), "group removed from registry");
        }
        metrics::set_active_groups(Self::live_count(&slots));
    }

    fn live_count(slots: &HashMap<String, Arc<GroupSlot>>) -> usize {
        slots.values().filter(|slot| slot.cell.initialized()).count()
    }

    fn forget_empty_slot(&self, name: &str, slot: &Arc<GroupSlot>) {
        let mut slots = self.slots.lock();
        if slots
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.cell.initialized())
        {
            slots.remove(name);
        }
    }

    fn groups(&self) -> Vec<Arc<Group>> {
        self.slots
            .lock()
            .values()
            .filter_map(|slot| slot.cell.get().cloned())
            .collect()
    }
}

/// Hosts this process's share of every named group.
///
/// Each broadcaster owns its registry, so several independent broadcasters
/// can coexist in one process (two of them over one backend behave like two
/// processes). Call [`shutdown`](Self::shutdown) to tear everything down.
#[derive(Clone)]
pub struct GroupBroadcaster {
    registry: Arc<Registry>,
}

impl GroupBroadcaster {
    pub fn new(backend: Arc<dyn SharedBackend>, heartbeat_interval: Duration) -> Self {
        Self {
            registry: Arc::new(Registry {
                backend,
                heartbeat_interval: heartbeat_interval.max(Duration::from_millis(1)),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn SharedBackend> {
        &self.registry.backend
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.registry.heartbeat_interval
    }

    /// Get the live local group for `name`, creating it with `hooks` if
    /// there is none. Hooks of an existing group are kept.
    ///
    /// A group created here with no connection stays active until
    /// [`Group::close`] or [`shutdown`](Self::shutdown).
    pub async fn group(&self, name: &str, hooks: Arc<dyn GroupHooks>) -> Result<Arc<Group>, GroupError> {
        loop {
            let slot = {
                let mut slots = self.registry.slots.lock();
                Arc::clone(slots.entry(name.to_string()).or_default())
            };

            let created = slot
                .cell
                .get_or_try_init(|| {
                    Group::create(
                        name,
                        Arc::clone(&self.registry.backend),
                        Arc::clone(&hooks),
                        self.registry.heartbeat_interval,
                        Arc::downgrade(&self.registry),
                    )
                })
                .await;

            let group = match created {
                Ok(group) => Arc::clone(group),
                Err(e) => {
                    self.registry.forget_empty_slot(name, &slot);
                    return Err(e);
                }
            };

            if group.is_draining() {
                debug!(group = %name, "waiting for draining group");
                group.wait_drained().await;
                continue;
            }

            metrics::set_active_groups(Registry::live_count(&self.registry.slots.lock()));
            return Ok(group);
        }
    }

    /// Add a connection to the group `name`, creating the group if needed.
    pub async fn attach(
        &self,
        name: &str,
        hooks: Arc<dyn GroupHooks>,
        connection: RawConnection,
    ) -> Result<(ConnectionId, Arc<Group>), GroupError> {
        let mut connection = connection;
        loop {
            let group = self.group(name, Arc::clone(&hooks)).await?;
            match group.try_add(connection) {
                Ok(id) => {
                    debug!(group = %name, connection_id = %id, "connection attached");
                    return Ok((id, group));
                }
                Err(returned) => {
                    connection = returned;
                    group.wait_drained().await;
                }
            }
        }
    }

    /// The live local group for `name`, if this process hosts one.
    pub fn local_group(&self, name: &str) -> Option<Arc<Group>> {
        let group = self
            .registry
            .slots
            .lock()
            .get(name)
            .and_then(|slot| slot.cell.get().cloned())?;
        (!group.is_draining()).then_some(group)
    }

    /// Names of the live local groups, sorted.
    pub fn active_groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registry
            .groups()
            .iter()
            .filter(|group| !group.is_draining())
            .map(|group| group.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Publish to a group's broadcast channel without holding a local member.
    pub async fn publish_broadcast<T: Serialize + ?Sized>(
        &self,
        name: &str,
        payload: &T,
    ) -> Result<usize, GroupError> {
        let bytes = serde_json::to_vec(payload)?;
        Ok(self
            .registry
            .backend
            .publish(&broadcast_channel(name), &bytes)
            .await?)
    }

    /// Close every local connection and drain every local group.
    pub async fn shutdown(&self) {
        let groups = self.registry.groups();
        info!(groups = groups.len(), "shutting down group broadcaster");
        for group in groups {
            group.close().await;
        }
    }
}

impl std::fmt::Debug for GroupBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupBroadcaster")
            .field("backend", &self.registry.backend.kind())
            .field("heartbeat_interval", &self.registry.heartbeat_interval)
            .finish()
    }
}
