//! Authoritative in-memory map of known devices.
//!
//! Every method takes the lock for exactly one logical update and never
//! across an await point, so the registry is safe to share between the
//! discovery, health and dispatch tasks.

use std::collections::HashMap;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use chrono::DateTime;
use chrono::Utc;
use tracing::info;
use tracing::warn;

use super::command::Command;
use super::device::Device;
use super::device::DeviceStatus;
use super::device::DeviceType;
use crate::error::Error;
use crate::error::Result;

/// Whether an upsert created a new entry or merged into an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Registered,
    Refreshed,
}

#[derive(Debug, Default)]
pub struct Registry {
    devices: RwLock<HashMap<String, Device>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Device>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Device>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new device, or merge a re-probed one into the existing entry
    pub fn upsert(&self, device: Device) -> UpsertOutcome {
        let mut devices = self.write();
        match devices.get_mut(device.device_id()) {
            Some(existing) => {
                existing.merge_probe(device);
                UpsertOutcome::Refreshed
            }
            None => {
                info!(
                    "Registered device {} at {} ({})",
                    device.device_id(),
                    device.address,
                    device.device_type
                );
                devices.insert(device.device_id().to_string(), device);
                UpsertOutcome::Registered
            }
        }
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.read().get(device_id).cloned()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.read().contains_key(device_id)
    }

    /// All devices, sorted by id
    pub fn list(&self) -> Vec<Device> {
        self.filtered(|_| true)
    }

    pub fn list_online(&self) -> Vec<Device> {
        self.filtered(Device::is_online)
    }

    pub fn list_by_type(&self, device_type: DeviceType) -> Vec<Device> {
        self.filtered(|d| d.device_type == device_type)
    }

    fn filtered(&self, predicate: impl Fn(&Device) -> bool) -> Vec<Device> {
        let mut devices: Vec<Device> = self.read().values().filter(|d| predicate(d)).cloned().collect();
        devices.sort_by(|a, b| a.device_id().cmp(b.device_id()));
        devices
    }

    pub fn remove(&self, device_id: &str) -> Option<Device> {
        let removed = self.write().remove(device_id);
        if removed.is_some() {
            info!("Unregistered device {}", device_id);
        }
        removed
    }

    /// Apply `f` to one device under the write lock
    pub fn update<R>(&self, device_id: &str, f: impl FnOnce(&mut Device) -> R) -> Result<R> {
        let mut devices = self.write();
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| Error::not_found("device", device_id))?;
        Ok(f(device))
    }

    pub fn set_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        reason: impl Into<String>,
    ) -> Result<()> {
        self.update(device_id, |d| d.set_status(status, reason))
    }

    pub fn push_command(&self, device_id: &str, command: Command) -> Result<usize> {
        self.update(device_id, |d| d.push_command(command))
    }

    pub fn pop_command(&self, device_id: &str) -> Option<Command> {
        self.update(device_id, |d| d.pop_command()).ok().flatten()
    }

    pub fn clear_queue(&self, device_id: &str) -> Result<usize> {
        self.update(device_id, |d| d.clear_queue())
    }

    /// Empty every device queue, returning the total dropped
    pub fn clear_all_queues(&self) -> usize {
        self.write().values_mut().map(|d| d.clear_queue()).sum()
    }

    /// Demote Online devices not seen since `now - timeout` to Offline.
    ///
    /// Returns the ids that were demoted.
    pub fn demote_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<String> {
        let mut demoted = Vec::new();
        for device in self.write().values_mut() {
            if !device.is_online() {
                continue;
            }
            let stale = match device.last_seen {
                Some(seen) => now - seen > timeout,
                None => true,
            };
            if stale {
                warn!(
                    "Device {} not seen for over {}s, marking offline",
                    device.device_id(),
                    timeout.num_seconds()
                );
                device.set_status(DeviceStatus::Offline, "stale");
                demoted.push(device.device_id().to_string());
            }
        }
        demoted.sort();
        demoted
    }

    /// Serialized snapshot of every device, for an external persistence layer
    pub fn export(&self) -> Vec<Device> {
        self.list()
    }

    /// Load devices from a previous export, replacing entries with the same id.
    ///
    /// Imported devices start with an empty queue.
    pub fn import(&self, devices: Vec<Device>) -> usize {
        let mut map = self.write();
        let n = devices.len();
        for device in devices {
            map.insert(device.device_id().to_string(), device);
        }
        info!("Imported {} devices", n);
        n
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.read().values().filter(|d| d.is_online()).count()
    }

    /// Count of devices per status
    pub fn status_counts(&self) -> HashMap<DeviceStatus, usize> {
        let mut counts = HashMap::new();
        for device in self.read().values() {
            *counts.entry(device.status).or_insert(0) += 1;
        }
        counts
    }

    /// Count of devices per type
    pub fn type_counts(&self) -> HashMap<DeviceType, usize> {
        let mut counts = HashMap::new();
        for device in self.read().values() {
            *counts.entry(device.device_type).or_insert(0) += 1;
        }
        counts
    }
}
