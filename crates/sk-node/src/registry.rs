//! Machine registry
//!
//! The single authoritative table of known machines, keyed by machine id.
//! Entries are written from the beacon listener, from every cluster link
//! and from the periodic expiry sweep. Each write goes through the map's
//! entry lock for that id, so concurrent writers never lose updates.
//!
//! Remote entries are never deleted: silence marks them offline, and only
//! a fresh beacon or registration brings them back.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;

use sk_core::types::{MachineDescriptor, MachineId, MachineStatus};

/// What an upsert did to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerChange {
    /// First time this id was seen
    Inserted,
    /// Was offline, now online again
    Revived,
    /// Already present; refreshed
    Refreshed,
}

/// Outcome of `MachineRegistry::upsert`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    pub change: PeerChange,
    /// Set when the incoming descriptor disagrees with the stored one
    /// about who this machine is
    pub anomaly: Option<String>,
    /// The stored descriptor after the write
    pub descriptor: MachineDescriptor,
}

/// Table of known machines with liveness expiry
pub struct MachineRegistry {
    machines: DashMap<MachineId, MachineDescriptor>,
    local_id: MachineId,
    silence_window: Duration,
}

impl MachineRegistry {
    /// Create a registry containing only the local machine
    pub fn new(local: MachineDescriptor, silence_window: Duration) -> Self {
        let machines = DashMap::new();
        let local_id = local.machine_id.clone();
        machines.insert(local_id.clone(), local);
        Self {
            machines,
            local_id,
            silence_window,
        }
    }

    pub fn local_id(&self) -> &MachineId {
        &self.local_id
    }

    pub fn silence_window(&self) -> Duration {
        self.silence_window
    }

    /// Insert or refresh an entry.
    ///
    /// `last_seen` never moves backwards. Identity fields follow the newest
    /// write; a hostname or address change under the same id is reported
    /// as an anomaly rather than merged.
    pub fn upsert(&self, incoming: MachineDescriptor) -> Upserted {
        match self.machines.entry(incoming.machine_id.clone()) {
            Entry::Vacant(slot) => {
                let mut descriptor = incoming;
                descriptor.status = MachineStatus::Online;
                slot.insert(descriptor.clone());
                Upserted {
                    change: PeerChange::Inserted,
                    anomaly: None,
                    descriptor,
                }
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get_mut();

                let anomaly = if current.hostname != incoming.hostname
                    || current.primary_ip != incoming.primary_ip
                {
                    Some(format!(
                        "machine id {} moved from {} ({}) to {} ({})",
                        incoming.machine_id,
                        current.hostname,
                        current.primary_ip,
                        incoming.hostname,
                        incoming.primary_ip
                    ))
                } else {
                    None
                };

                let change = if current.status == MachineStatus::Offline {
                    PeerChange::Revived
                } else {
                    PeerChange::Refreshed
                };

                let last_seen = current.last_seen.max(incoming.last_seen);
                *current = MachineDescriptor {
                    last_seen,
                    status: MachineStatus::Online,
                    ..incoming
                };

                Upserted {
                    change,
                    anomaly,
                    descriptor: current.clone(),
                }
            }
        }
    }

    /// Current descriptor for a machine
    pub fn get(&self, machine_id: &MachineId) -> Option<MachineDescriptor> {
        self.machines.get(machine_id).map(|r| r.clone())
    }

    /// All machines that are online or degraded, the local one included
    pub fn list_online(&self) -> Vec<MachineDescriptor> {
        let mut online: Vec<_> = self
            .machines
            .iter()
            .filter(|r| r.status.is_present())
            .map(|r| r.clone())
            .collect();
        online.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        online
    }

    /// Every entry, offline ones included
    pub fn snapshot(&self) -> Vec<MachineDescriptor> {
        let mut all: Vec<_> = self.machines.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        all
    }

    /// Mark remote machines silent for at least the silence window as
    /// offline. Returns the ids that changed.
    pub fn expire_stale(&self, now: u64) -> Vec<MachineId> {
        let window = self.silence_window.as_millis() as u64;
        let mut expired = Vec::new();

        for mut entry in self.machines.iter_mut() {
            if entry.machine_id == self.local_id || !entry.status.is_present() {
                continue;
            }
            if now.saturating_sub(entry.last_seen) >= window {
                entry.status = MachineStatus::Offline;
                expired.push(entry.machine_id.clone());
            }
        }

        expired
    }

    /// Refresh liveness from link traffic.
    ///
    /// Does nothing for unknown or offline machines: only a beacon or a
    /// registration brings an offline machine back.
    pub fn touch(&self, machine_id: &MachineId, now: u64) -> bool {
        match self.machines.get_mut(machine_id) {
            Some(mut entry) if entry.status.is_present() => {
                entry.last_seen = entry.last_seen.max(now);
                true
            }
            _ => false,
        }
    }

    /// Set a present machine to online or degraded. Offline machines are
    /// left alone.
    pub fn set_link_health(&self, machine_id: &MachineId, degraded: bool) -> bool {
        match self.machines.get_mut(machine_id) {
            Some(mut entry) if entry.status.is_present() => {
                entry.status = if degraded {
                    MachineStatus::Degraded
                } else {
                    MachineStatus::Online
                };
                true
            }
            _ => false,
        }
    }

    /// Replace the local entry, e.g. after the advertised services changed
    pub fn update_local(&self, mut local: MachineDescriptor) {
        local.machine_id = self.local_id.clone();
        local.status = MachineStatus::Online;
        self.machines.insert(self.local_id.clone(), local);
    }

    /// Number of remote machines, any status
    pub fn remote_count(&self) -> usize {
        self.machines.len().saturating_sub(1)
    }

    /// Number of remote machines online or degraded
    pub fn remote_online_count(&self) -> usize {
        self.machines
            .iter()
            .filter(|r| r.machine_id != self.local_id && r.status.is_present())
            .count()
    }
}
