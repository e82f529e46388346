//! Configuration file parsing and structures.
//!
//! Every section and field has a default, so an empty file yields a working
//! daemon that scans `192.168.1.0/24` and runs the full race profile.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;

use crate::fleet::device::DeviceType;
use crate::fleet::discovery::AddressRange;
use crate::show::phase::Phase;
use crate::show::phase::ProfileKind;

/// Top-level configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub discovery: DiscoveryConfig,
    pub devices: Vec<StaticDevice>,
    pub dispatcher: DispatcherConfig,
    pub health: HealthConfig,
    pub show: ShowConfig,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: LogLevel,

    /// Per-target levels, e.g. `"derbyd::fleet" = "debug"`
    pub overrides: HashMap<String, LogLevel>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// IPv4 CIDR block to scan
    pub network_range: String,
    pub port: u16,
    /// TCP connect timeout per candidate host
    pub host_timeout_ms: u64,
    pub info_timeout_ms: u64,
    pub scan_interval_secs: u64,
    /// Concurrent probes
    pub workers: usize,
    /// Value of the `system` field in `/info` identifying our boards
    pub family_marker: String,
    /// Online devices not seen for this long are demoted to Offline
    pub device_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            network_range: "192.168.1.0/24".to_string(),
            port: 80,
            host_timeout_ms: 1_000,
            info_timeout_ms: 5_000,
            scan_interval_secs: 30,
            workers: 10,
            family_marker: "DDM-ESP32".to_string(),
            device_timeout_secs: 60,
        }
    }
}

impl DiscoveryConfig {
    pub fn host_timeout(&self) -> Duration {
        Duration::from_millis(self.host_timeout_ms)
    }

    pub fn info_timeout(&self) -> Duration {
        Duration::from_millis(self.info_timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }
}

/// A device registered at startup without scanning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StaticDevice {
    pub device_id: String,
    pub address: String,
    #[serde(default)]
    pub device_type: DeviceType,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Commands executing concurrently across all devices
    pub workers: usize,
    pub broadcast_timeout_secs: u64,
    pub command_timeout_ms: u64,
    pub command_retries: u32,
    pub command_priority: u8,
    /// Linear backoff step used by the retry decorator
    pub retry_backoff_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            broadcast_timeout_secs: 30,
            command_timeout_ms: 5_000,
            command_retries: 3,
            command_priority: 5,
            retry_backoff_ms: 500,
        }
    }
}

impl DispatcherConfig {
    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_secs(self.broadcast_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub ping_interval_secs: u64,
    pub deep_interval_secs: u64,
    pub ping_timeout_ms: u64,
    pub status_timeout_ms: u64,
    /// Metrics kept per device
    pub history_size: usize,
    pub thresholds: Thresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 10,
            deep_interval_secs: 30,
            ping_timeout_ms: 2_000,
            status_timeout_ms: 5_000,
            history_size: 100,
            thresholds: Thresholds::default(),
        }
    }
}

impl HealthConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn deep_interval(&self) -> Duration {
        Duration::from_secs(self.deep_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

/// Warning and critical limits for each health metric
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Thresholds {
    /// Degrees Celsius, higher is worse
    pub temperature_warning: f64,
    pub temperature_critical: f64,
    /// Bytes, lower is worse
    pub free_memory_warning: u64,
    pub free_memory_critical: u64,
    /// Seconds, higher is worse
    pub response_time_warning: f64,
    pub response_time_critical: f64,
    /// dBm, lower is worse
    pub signal_warning: i32,
    pub signal_critical: i32,
    pub error_count_warning: u32,
    pub error_count_critical: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            temperature_warning: 70.0,
            temperature_critical: 85.0,
            free_memory_warning: 5_120,
            free_memory_critical: 1_024,
            response_time_warning: 2.0,
            response_time_critical: 5.0,
            signal_warning: -80,
            signal_critical: -90,
            error_count_warning: 5,
            error_count_critical: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShowConfig {
    pub name: String,
    pub profile: ProfileKind,
    /// Include BettingOpen in the simple profile
    pub betting: bool,
    /// Phase duration overrides in seconds, keyed by phase name or alias
    pub durations: HashMap<String, u64>,
    pub entity_count: usize,
    /// 0.0 (chalk) to 1.0 (chaos); spreads speed and stamina
    pub randomness: f64,
    /// Generate mock entities on create and reset
    pub simulated: bool,
    pub tick_ms: u64,
    pub odds_drift: OddsDriftConfig,
    /// Fixed RNG seed for reproducible shows
    pub seed: Option<u64>,
    pub autostart: bool,
    /// Settle results from simulated progress when a settling phase is
    /// entered with none recorded
    pub auto_results: bool,
}

impl Default for ShowConfig {
    fn default() -> Self {
        Self {
            name: "Derby Day".to_string(),
            profile: ProfileKind::Full,
            betting: false,
            durations: HashMap::new(),
            entity_count: 8,
            randomness: 0.3,
            simulated: true,
            tick_ms: 500,
            odds_drift: OddsDriftConfig::default(),
            seed: None,
            autostart: false,
            auto_results: true,
        }
    }
}

impl ShowConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.entity_count == 0 {
            return invalid("show.entity_count must be at least 1");
        }
        if self.tick_ms == 0 {
            return invalid("show.tick_ms must be positive");
        }
        if !(0.0..=1.0).contains(&self.randomness) {
            return invalid("show.randomness must be between 0 and 1");
        }
        let drift = &self.odds_drift;
        if drift.min_interval_ms == 0 || drift.min_interval_ms > drift.max_interval_ms {
            return invalid("show.odds_drift: need 0 < min_interval_ms <= max_interval_ms");
        }
        if drift.floor < 1.0 || !(0.0..1.0).contains(&drift.percent) {
            return invalid("show.odds_drift: floor must be >= 1.0 and percent in [0, 1)");
        }
        self.duration_overrides()?;
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Duration overrides with keys resolved to phases
    pub fn duration_overrides(&self) -> Result<HashMap<Phase, Duration>, ConfigError> {
        self.durations
            .iter()
            .map(|(name, secs)| {
                let phase = Phase::resolve(name).map_err(|_| {
                    ConfigError::Invalid(format!("show.durations: unknown phase '{}'", name))
                })?;
                Ok((phase, Duration::from_secs(*secs)))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OddsDriftConfig {
    /// Symmetric drift fraction, 0.05 = ±5%
    pub percent: f64,
    pub floor: f64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
}

impl Default for OddsDriftConfig {
    fn default() -> Self {
        Self {
            percent: 0.05,
            floor: 1.1,
            min_interval_ms: 3_000,
            max_interval_ms: 6_000,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        AddressRange::parse(&self.discovery.network_range)
            .map_err(|e| ConfigError::Invalid(format!("discovery.network_range: {}", e)))?;
        if self.discovery.workers == 0 {
            return invalid("discovery.workers must be at least 1");
        }
        if self.discovery.scan_interval_secs == 0 {
            return invalid("discovery.scan_interval_secs must be positive");
        }
        if self.dispatcher.workers == 0 {
            return invalid("dispatcher.workers must be at least 1");
        }
        if self.dispatcher.command_priority > crate::fleet::command::MAX_PRIORITY {
            return invalid("dispatcher.command_priority must be 0-10");
        }
        if self.health.history_size == 0 {
            return invalid("health.history_size must be at least 1");
        }
        if self.health.ping_interval_secs == 0 || self.health.deep_interval_secs == 0 {
            return invalid("health intervals must be positive");
        }

        let t = &self.health.thresholds;
        if t.temperature_warning > t.temperature_critical
            || t.response_time_warning > t.response_time_critical
            || t.error_count_warning > t.error_count_critical
        {
            return invalid("health.thresholds: warning must not exceed critical");
        }
        if t.free_memory_warning < t.free_memory_critical || t.signal_warning < t.signal_critical {
            return invalid("health.thresholds: warning must not be below critical");
        }

        self.show.validate()?;

        for device in &self.devices {
            crate::fleet::device::Device::new(&device.device_id, &device.address)
                .map_err(|e| ConfigError::Invalid(format!("devices: {}", e)))?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
