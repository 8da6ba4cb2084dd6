//! Id-keyed Instance registry.
//!
//! Records are stored and iterated in the Manager's ordering, and every
//! supervisor addresses its record by Instance id, never by position: the
//! list can be resorted or shrunk by any sync without invalidating anything
//! a supervisor holds.

use adit_types::{InstanceDescriptor, InstanceRecord};
use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot};
use url::Url;
use uuid::Uuid;

use crate::supervisor::{EngineEvent, SupervisorHandle, SupervisorTiming};

/// Everything needed to bring up a supervisor for a newly registered
/// Instance.
#[derive(Clone, Debug)]
pub struct SupervisorSpawner {
    pub control_interface_id: Uuid,
    pub timing: SupervisorTiming,
    pub events: mpsc::UnboundedSender<EngineEvent>,
}

impl SupervisorSpawner {
    fn control_url(&self, desc: &InstanceDescriptor) -> Option<Url> {
        let raw = format!(
            "ws://{}:{}/{}",
            desc.ip_address, desc.control_port, self.control_interface_id
        );
        match raw.parse() {
            Ok(url) => Some(url),
            Err(err) => {
                tracing::error!(instance = %desc.name, id = %desc.id, %raw, %err, "invalid control endpoint");
                None
            }
        }
    }

    fn spawn(&self, desc: &InstanceDescriptor, epoch: u64) -> Option<SupervisorHandle> {
        let url = self.control_url(desc)?;
        Some(SupervisorHandle::spawn(
            desc.id.clone(),
            desc.name.clone(),
            url,
            self.timing,
            epoch,
            self.events.clone(),
        ))
    }
}

pub struct RegistryEntry {
    pub record: InstanceRecord,
    /// Guards against events from a torn-down supervisor of the same id.
    pub epoch: u64,
    supervisor: Option<SupervisorHandle>,
}

/// Registry of Instances for the selected channel, in Manager order.
#[derive(Default)]
pub struct Registry {
    entries: IndexMap<String, RegistryEntry>,
    next_epoch: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.entries.values().filter(|e| e.record.healthy()).count()
    }

    pub fn get(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut RegistryEntry> {
        self.entries.get_mut(id)
    }

    /// Records in Manager order.
    pub fn records(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.entries.values().map(|e| &e.record)
    }

    /// Diff the registry against the Manager-supplied list: tear down
    /// departed Instances, spawn supervisors for new ones, refresh metadata
    /// on survivors in place, and adopt the list's ordering verbatim.
    ///
    /// A live transport is deliberately not reset when a survivor's control
    /// endpoint changes; the new endpoint takes effect on the next natural
    /// reconnect.
    pub fn sync_against(&mut self, list: &[InstanceDescriptor], spawner: &SupervisorSpawner) {
        let mut next = IndexMap::with_capacity(list.len());
        for desc in list {
            if next.contains_key(&desc.id) {
                tracing::warn!(id = %desc.id, "manager listed the same instance twice; keeping the first");
                continue;
            }
            match self.entries.shift_remove(&desc.id) {
                Some(mut entry) => {
                    let endpoint_changed = entry.record.ip_address != desc.ip_address
                        || entry.record.control_port != desc.control_port;
                    entry.record.update_metadata(desc);
                    if endpoint_changed {
                        if let (Some(supervisor), Some(url)) =
                            (&entry.supervisor, spawner.control_url(desc))
                        {
                            tracing::info!(instance = %desc.name, id = %desc.id, %url, "control endpoint changed; applies on next reconnect");
                            supervisor.update_endpoint(url);
                        }
                    }
                    next.insert(desc.id.clone(), entry);
                }
                None => {
                    tracing::info!(instance = %desc.name, id = %desc.id, "discovered instance");
                    let epoch = self.next_epoch;
                    self.next_epoch += 1;
                    next.insert(
                        desc.id.clone(),
                        RegistryEntry {
                            record: InstanceRecord::new(desc),
                            epoch,
                            supervisor: spawner.spawn(desc, epoch),
                        },
                    );
                }
            }
        }
        for (id, entry) in self.entries.drain(..) {
            tracing::info!(instance = %entry.record.name, %id, "instance removed by manager");
            if let Some(supervisor) = &entry.supervisor {
                supervisor.shutdown();
            }
        }
        self.entries = next;
    }

    /// Close every supervisor and forget all records.
    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain(..) {
            if let Some(supervisor) = &entry.supervisor {
                supervisor.shutdown();
            }
        }
    }

    /// Queue a frame on every connected Instance's transport, returning one
    /// ack receiver per target.
    pub fn send_to_connected(&self, text: &str) -> Vec<oneshot::Receiver<bool>> {
        self.entries
            .values()
            .filter(|e| e.record.healthy())
            .filter_map(|e| e.supervisor.as_ref())
            .map(|s| s.send(text.to_string()))
            .collect()
    }

    /// Deliver a heartbeat tick to every supervisor; non-connected ones
    /// ignore it.
    pub fn heartbeat_all(&self) {
        for entry in self.entries.values() {
            if let Some(supervisor) = &entry.supervisor {
                supervisor.heartbeat();
            }
        }
    }
}
