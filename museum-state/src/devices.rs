//! Device presence registry.
//!
//! Devices announce themselves on `devices/<id>/status`. A device counts as
//! online while it keeps talking; once it has been silent for longer than the
//! staleness window it is reported offline, both by queries and by the
//! periodic [`sweep`](DeviceRegistry::sweep). Entries are never deleted.

use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::RegistryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceStatus::Online => write!(f, "online"),
            PresenceStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Last known state of one field device.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: String,
    pub status: PresenceStatus,
    #[serde(skip)]
    pub last_seen: Instant,
    pub last_seen_at: DateTime<Utc>,
    pub last_payload: String,
}

/// Why a device's presence changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceReason {
    /// The device published an explicit `online`/`offline` status
    Reported,
    /// Any other payload, taken as proof of life
    Heartbeat,
    /// First seen through a retained message, registered as offline
    Discovered,
    /// Silent for longer than the staleness window
    Stale,
}

/// A device went online or offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceChange {
    pub device_id: String,
    /// `None` for a device seen for the first time
    pub previous: Option<PresenceStatus>,
    pub current: PresenceStatus,
    pub reason: PresenceReason,
}

impl fmt::Display for PresenceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.previous {
            Some(previous) => write!(
                f,
                "{}: {} -> {} ({:?})",
                self.device_id, previous, self.current, self.reason
            ),
            None => write!(f, "{}: new, {} ({:?})", self.device_id, self.current, self.reason),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} devices ({} online, {} offline)",
            self.total, self.online, self.offline
        )
    }
}

/// Concurrent map of device presence.
pub struct DeviceRegistry {
    devices: DashMap<String, Device>,
    config: RegistryConfig,
}

impl DeviceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            devices: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Apply one status message. Returns the presence change it caused, if any.
    ///
    /// A retained `online` is a replay of what the device said at some point
    /// in the past, so it only registers an unknown device as offline.
    pub fn update(
        &self,
        device_id: &str,
        payload: &str,
        retained: bool,
        now: Instant,
    ) -> Option<PresenceChange> {
        let payload = payload.trim();
        if device_id.is_empty() || payload.is_empty() {
            tracing::debug!("Ignoring empty device status for '{}'", device_id);
            return None;
        }

        let reported = match payload.to_ascii_lowercase().as_str() {
            "online" => Some(PresenceStatus::Online),
            "offline" => Some(PresenceStatus::Offline),
            _ => None,
        };

        if retained && reported == Some(PresenceStatus::Online) {
            tracing::debug!("Ignoring retained 'online' status for {}", device_id);
            if self.devices.contains_key(device_id) {
                return None;
            }
            self.devices
                .insert(device_id.to_string(), self.record(device_id, PresenceStatus::Offline, payload, now));
            return Some(PresenceChange {
                device_id: device_id.to_string(),
                previous: None,
                current: PresenceStatus::Offline,
                reason: PresenceReason::Discovered,
            });
        }

        let (current, reason) = match reported {
            Some(status) => (status, PresenceReason::Reported),
            None => (PresenceStatus::Online, PresenceReason::Heartbeat),
        };

        let previous = self
            .devices
            .insert(device_id.to_string(), self.record(device_id, current, payload, now))
            .map(|device| self.effective_status(&device, now));

        tracing::debug!("Device {} status: {}", device_id, payload);

        if previous == Some(current) {
            return None;
        }
        let change = PresenceChange {
            device_id: device_id.to_string(),
            previous,
            current,
            reason,
        };
        match current {
            PresenceStatus::Online => tracing::warn!("Device {} connected", device_id),
            PresenceStatus::Offline => tracing::warn!("Device {} disconnected", device_id),
        }
        Some(change)
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.get(device_id).map(|entry| entry.value().clone())
    }

    /// Ids of devices that are online right now.
    pub fn list_online(&self) -> Vec<String> {
        self.list_online_at(Instant::now())
    }

    /// Ids of devices online at `now`, sorted. Stale devices are excluded even
    /// if no sweep has demoted them yet.
    pub fn list_online_at(&self, now: Instant) -> Vec<String> {
        let mut online: Vec<String> = self
            .devices
            .iter()
            .filter(|entry| self.effective_status(entry.value(), now) == PresenceStatus::Online)
            .map(|entry| entry.key().clone())
            .collect();
        online.sort();
        online
    }

    /// Every known device with its presence as of `now`, sorted by id.
    pub fn list_all_at(&self, now: Instant) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .iter()
            .map(|entry| {
                let mut device = entry.value().clone();
                device.status = self.effective_status(&device, now);
                device
            })
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn list_all(&self) -> Vec<Device> {
        self.list_all_at(Instant::now())
    }

    pub fn summary_at(&self, now: Instant) -> DeviceSummary {
        let mut summary = DeviceSummary::default();
        for entry in self.devices.iter() {
            summary.total += 1;
            match self.effective_status(entry.value(), now) {
                PresenceStatus::Online => summary.online += 1,
                PresenceStatus::Offline => summary.offline += 1,
            }
        }
        summary
    }

    pub fn summary(&self) -> DeviceSummary {
        self.summary_at(Instant::now())
    }

    /// Demote every online device that has gone stale.
    pub fn sweep(&self, now: Instant) -> Vec<PresenceChange> {
        let mut changes = Vec::new();
        for mut entry in self.devices.iter_mut() {
            let device = entry.value_mut();
            if device.status == PresenceStatus::Online && self.is_stale(device, now) {
                tracing::warn!(
                    "Device {} timeout - marking as offline (silent for more than {}s)",
                    device.id,
                    self.config.stale_after.as_secs()
                );
                device.status = PresenceStatus::Offline;
                changes.push(PresenceChange {
                    device_id: device.id.clone(),
                    previous: Some(PresenceStatus::Online),
                    current: PresenceStatus::Offline,
                    reason: PresenceReason::Stale,
                });
            }
        }
        changes.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        changes
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn record(&self, id: &str, status: PresenceStatus, payload: &str, now: Instant) -> Device {
        Device {
            id: id.to_string(),
            status,
            last_seen: now,
            last_seen_at: Utc::now(),
            last_payload: payload.to_string(),
        }
    }

    fn is_stale(&self, device: &Device, now: Instant) -> bool {
        now.saturating_duration_since(device.last_seen) > self.config.stale_after
    }

    fn effective_status(&self, device: &Device, now: Instant) -> PresenceStatus {
        if device.status == PresenceStatus::Online && self.is_stale(device, now) {
            PresenceStatus::Offline
        } else {
            device.status
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
