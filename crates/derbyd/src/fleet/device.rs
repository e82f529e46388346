//! Device model for the LED controller boards.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use super::command::Command;
use super::command::CommandQueue;
use crate::error::Error;
use crate::error::Result;

/// Connection/activity status of a device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Unknown,
    Online,
    Offline,
    Busy,
    Error,
    Updating,
}

/// Physical role of a board in the venue.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceType {
    CupBase,
    MatrixWall,
    StripController,
    #[default]
    #[serde(other)]
    Unknown,
}

/// LED hardware description reported by the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub led_count: u32,
    pub led_type: String,
    pub color_order: String,
    pub max_brightness: u8,
    pub current_brightness: u8,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            led_count: 50,
            led_type: "WS2812B".to_string(),
            color_order: "RGB".to_string(),
            max_brightness: 255,
            current_brightness: 128,
        }
    }
}

/// Last known system health of the board.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Seconds since the board booted
    pub uptime: u64,
    /// Degrees Celsius
    pub temperature: Option<f64>,
    /// Bytes
    pub free_memory: Option<u64>,
    pub firmware_version: Option<String>,
    pub last_error: Option<String>,
}

/// Command delivery counters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Counters {
    pub commands_sent: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    /// Exponential moving average in seconds, `None` until the first sample
    pub avg_response_time: Option<f64>,
}

impl Counters {
    /// Record one command outcome.
    ///
    /// The response-time average is `old * 0.8 + sample * 0.2`, seeded with the
    /// first sample.
    pub fn record(&mut self, success: bool, response_time: f64) {
        self.commands_sent += 1;
        if success {
            self.commands_succeeded += 1;
        } else {
            self.commands_failed += 1;
        }
        self.avg_response_time = Some(match self.avg_response_time {
            Some(old) => old * 0.8 + response_time * 0.2,
            None => response_time,
        });
    }

    /// Percentage of successful commands (0-100)
    pub fn success_rate(&self) -> f64 {
        if self.commands_sent == 0 {
            return 0.0;
        }
        self.commands_succeeded as f64 / self.commands_sent as f64 * 100.0
    }
}

/// A network-attached LED controller board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    device_id: String,
    /// `host:port`
    pub address: String,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub health: HealthSnapshot,
    #[serde(default)]
    pub counters: Counters,
    #[serde(default)]
    pub last_command: Option<String>,
    #[serde(default)]
    pub last_response: Option<String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    queue: CommandQueue,
}

impl Device {
    /// Create a device after validating its id and address.
    pub fn new(device_id: impl Into<String>, address: impl Into<String>) -> Result<Self> {
        let device_id = validate_device_id(device_id.into())?;
        let address = validate_address(address.into())?;
        let now = Utc::now();
        Ok(Self {
            device_id,
            address,
            device_type: DeviceType::Unknown,
            status: DeviceStatus::Unknown,
            status_reason: None,
            mac_address: None,
            capabilities: Capabilities::default(),
            health: HealthSnapshot::default(),
            counters: Counters::default(),
            last_command: None,
            last_response: None,
            last_seen: None,
            created_at: now,
            updated_at: now,
            queue: CommandQueue::default(),
        })
    }

    /// Stable identity; immutable once constructed.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_online(&self) -> bool {
        self.status == DeviceStatus::Online
    }

    /// Online, or Online and executing a command
    pub fn is_responsive(&self) -> bool {
        matches!(self.status, DeviceStatus::Online | DeviceStatus::Busy)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.address)
    }

    /// Number of commands waiting in this device's queue
    pub fn queue_length(&self) -> usize {
        self.queue.len()
    }

    /// Transition to `status`, logging the reason.
    pub fn set_status(&mut self, status: DeviceStatus, reason: impl Into<String>) {
        let reason = reason.into();
        let old = self.status;
        self.status = status;
        self.updated_at = Utc::now();
        if status == DeviceStatus::Online {
            self.last_seen = Some(self.updated_at);
        }
        if status == DeviceStatus::Error {
            self.health.last_error = Some(reason.clone());
        }
        if old != status {
            info!(
                "Device {} status: {} -> {} ({})",
                self.device_id, old, status, reason
            );
        } else {
            debug!("Device {} status unchanged: {} ({})", self.device_id, status, reason);
        }
        self.status_reason = Some(reason);
    }

    /// Merge a freshly probed view of the same board into this one.
    ///
    /// Keeps counters, queue and creation time; overwrites address, type,
    /// capabilities and health fields.
    pub fn merge_probe(&mut self, probed: Device) {
        self.address = probed.address;
        if probed.device_type != DeviceType::Unknown {
            self.device_type = probed.device_type;
        }
        if probed.mac_address.is_some() {
            self.mac_address = probed.mac_address;
        }
        self.capabilities = probed.capabilities;
        let last_error = self.health.last_error.take();
        self.health = probed.health;
        if self.health.last_error.is_none() {
            self.health.last_error = last_error;
        }
        if probed.last_seen.is_some() {
            self.last_seen = probed.last_seen;
        }
        if probed.status != DeviceStatus::Unknown {
            let reason = probed
                .status_reason
                .unwrap_or_else(|| "refreshed".to_string());
            self.set_status(probed.status, reason);
        }
        self.updated_at = Utc::now();
    }

    pub fn record_command_result(&mut self, success: bool, response_time: f64) {
        self.counters.record(success, response_time);
        self.updated_at = Utc::now();
    }

    pub(crate) fn push_command(&mut self, command: Command) -> usize {
        self.queue.push(command);
        self.queue.len()
    }

    pub(crate) fn pop_command(&mut self) -> Option<Command> {
        self.queue.pop()
    }

    pub(crate) fn clear_queue(&mut self) -> usize {
        let cleared = self.queue.clear();
        if cleared > 0 {
            info!("Cleared {} commands from device {} queue", cleared, self.device_id);
        }
        cleared
    }
}

/// Device ids are non-empty and limited to `[A-Za-z0-9_-]`.
pub fn validate_device_id(device_id: String) -> Result<String> {
    if device_id.is_empty() {
        return Err(Error::validation("device_id", "must be a non-empty string"));
    }
    if !device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::validation(
            "device_id",
            "must contain only alphanumeric characters, hyphens, and underscores",
        ));
    }
    Ok(device_id)
}

/// Addresses are `host:port` with a numeric port.
pub fn validate_address(address: String) -> Result<String> {
    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(Error::validation("address", "expected host:port"));
    };
    if host.is_empty() {
        return Err(Error::validation("address", "host is empty"));
    }
    if port.parse::<u16>().is_err() {
        return Err(Error::validation("address", format!("invalid port '{}'", port)));
    }
    Ok(address)
}
