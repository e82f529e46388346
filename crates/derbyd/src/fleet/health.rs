//! Device health monitoring.
//!
//! Two loops run side by side: a cheap ping loop that keeps Online/Offline
//! status current, and a deep loop that polls `/status`, classifies the
//! result and keeps a bounded per-device history. A deep check that is
//! still waiting on a slow board never delays the ping loop.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::client::DeviceClient;
use super::client::StatusResponse;
use super::client::TransportError;
use super::device::Device;
use super::device::DeviceStatus;
use super::registry::Registry;
use crate::config::HealthConfig;
use crate::config::Thresholds;
use crate::error::Error;
use crate::error::Result;
use crate::event::Event;
use crate::event::EventBus;
use crate::event::Subscribers;
use crate::event::SubscriptionId;

/// Derived severity, ordered from best to worst
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthClass {
    Healthy,
    Warning,
    Critical,
    Offline,
}

/// One health reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: HealthClass,
    pub uptime: Option<u64>,
    pub temperature: Option<f64>,
    pub free_memory: Option<u64>,
    pub cpu_usage: Option<f64>,
    pub wifi_strength: Option<i32>,
    pub error_count: Option<u32>,
    /// Seconds taken by the `/status` request
    pub response_time: Option<f64>,
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl HealthMetrics {
    fn offline(device_id: &str, reason: impl Into<String>) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            status: HealthClass::Offline,
            uptime: None,
            temperature: None,
            free_memory: None,
            cpu_usage: None,
            wifi_strength: None,
            error_count: None,
            response_time: None,
            firmware_version: None,
            issues: vec![reason.into()],
        }
    }
}

/// Raised whenever a reading is Warning or Critical
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub device_id: String,
    pub severity: HealthClass,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: HealthMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub total_devices: usize,
    pub healthy: usize,
    pub warning: usize,
    pub critical: usize,
    pub offline: usize,
    /// Devices without a reading yet
    pub unchecked: usize,
    /// Worst class across checked devices
    pub overall: HealthClass,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorStats {
    pub checks_performed: u64,
    pub alerts_generated: u64,
    pub status_changes: u64,
    pub devices_monitored: usize,
    pub metrics_stored: usize,
    pub subscribers: usize,
    pub last_ping_check: Option<DateTime<Utc>>,
    pub last_deep_check: Option<DateTime<Utc>>,
}

/// Classify a `/status` reply.
///
/// Each metric is checked only if the board reported it. Returns the worst
/// class found and a description of every threshold crossed.
pub fn classify(
    status: &StatusResponse,
    response_time: Option<f64>,
    t: &Thresholds,
) -> (HealthClass, Vec<String>) {
    let mut class = HealthClass::Healthy;
    let mut issues = Vec::new();
    let mut flag = |severity: HealthClass, issue: String| {
        class = class.max(severity);
        issues.push(issue);
    };

    if let Some(temp) = status.temperature {
        if temp > t.temperature_critical {
            flag(HealthClass::Critical, format!("critical temperature: {:.1}°C", temp));
        } else if temp > t.temperature_warning {
            flag(HealthClass::Warning, format!("high temperature: {:.1}°C", temp));
        }
    }
    if let Some(free) = status.free_memory {
        if free < t.free_memory_critical {
            flag(HealthClass::Critical, format!("critical low memory: {} bytes", free));
        } else if free < t.free_memory_warning {
            flag(HealthClass::Warning, format!("low memory: {} bytes", free));
        }
    }
    if let Some(rt) = response_time {
        if rt > t.response_time_critical {
            flag(HealthClass::Critical, format!("very slow response: {:.2}s", rt));
        } else if rt > t.response_time_warning {
            flag(HealthClass::Warning, format!("slow response: {:.2}s", rt));
        }
    }
    if let Some(signal) = status.wifi_strength {
        if signal < t.signal_critical {
            flag(HealthClass::Critical, format!("very weak WiFi: {} dBm", signal));
        } else if signal < t.signal_warning {
            flag(HealthClass::Warning, format!("weak WiFi: {} dBm", signal));
        }
    }
    if let Some(errors) = status.error_count {
        if errors > t.error_count_critical {
            flag(HealthClass::Critical, format!("error storm: {} errors", errors));
        } else if errors > t.error_count_warning {
            flag(HealthClass::Warning, format!("high error count: {}", errors));
        }
    }
    (class, issues)
}

#[derive(Debug, Default)]
struct Totals {
    checks: u64,
    alerts: u64,
    status_changes: u64,
    last_ping_check: Option<DateTime<Utc>>,
    last_deep_check: Option<DateTime<Utc>>,
}

struct Inner {
    registry: Arc<Registry>,
    client: Arc<dyn DeviceClient>,
    config: HealthConfig,
    device_timeout: Duration,
    history: Mutex<HashMap<String, VecDeque<HealthMetrics>>>,
    alerts: Subscribers<Alert>,
    events: Arc<EventBus>,
    totals: Mutex<Totals>,
}

#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    /// `device_timeout` is how long an Online device may go unseen before
    /// the ping loop demotes it.
    pub fn new(
        registry: Arc<Registry>,
        client: Arc<dyn DeviceClient>,
        config: HealthConfig,
        device_timeout: Duration,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                client,
                config,
                device_timeout,
                history: Mutex::new(HashMap::new()),
                alerts: Subscribers::new(),
                events,
                totals: Mutex::new(Totals::default()),
            }),
        }
    }

    fn history_map(&self) -> MutexGuard<'_, HashMap<String, VecDeque<HealthMetrics>>> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn totals(&self) -> MutexGuard<'_, Totals> {
        self.inner
            .totals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an alert handler
    pub fn subscribe(&self, handler: impl Fn(&Alert) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.alerts.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.alerts.unsubscribe(id)
    }

    /// Ping every device once, then demote any that have gone stale
    pub async fn ping_all(&self) {
        let mut tasks = JoinSet::new();
        for device in self.inner.registry.list() {
            let this = self.clone();
            tasks.spawn(async move { this.ping_one(device).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Ping task failed: {}", e);
            }
        }

        let timeout = chrono::Duration::from_std(self.inner.device_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        for device_id in self.inner.registry.demote_stale(Utc::now(), timeout) {
            self.record_offline(&device_id, "stale");
        }
        self.totals().last_ping_check = Some(Utc::now());
    }

    async fn ping_one(&self, device: Device) {
        let device_id = device.device_id();
        let result = self
            .inner
            .client
            .ping(&device.address, self.inner.config.ping_timeout())
            .await;
        let registry = &self.inner.registry;
        match result {
            Ok(()) if device.is_responsive() => {
                let _ = registry.update(device_id, |d| d.last_seen = Some(Utc::now()));
            }
            Ok(()) => {
                info!("Device {} answered ping, back online", device_id);
                let _ = registry.set_status(device_id, DeviceStatus::Online, "ping ok");
                self.totals().status_changes += 1;
            }
            Err(e) if device.status != DeviceStatus::Offline => {
                warn!("Device {} failed ping: {}", device_id, e);
                let _ = registry.set_status(device_id, DeviceStatus::Offline, "ping failed");
                self.totals().status_changes += 1;
                self.record_offline(device_id, format!("ping failed: {}", e));
            }
            Err(e) => debug!("Device {} still unreachable: {}", device_id, e),
        }
    }

    fn record_offline(&self, device_id: &str, reason: impl Into<String>) {
        let metrics = HealthMetrics::offline(device_id, reason);
        self.store(metrics.clone());
        self.inner.events.publish(Event::DeviceHealthUpdate(metrics));
    }

    /// Poll `/status` on every device
    pub async fn deep_check_all(&self) -> Vec<HealthMetrics> {
        let mut tasks = JoinSet::new();
        for device in self.inner.registry.list() {
            let this = self.clone();
            tasks.spawn(async move { this.deep_check(device).await });
        }
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(metrics) => results.push(metrics),
                Err(e) => error!("Health check task failed: {}", e),
            }
        }
        results.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        self.totals().last_deep_check = Some(Utc::now());
        results
    }

    async fn deep_check(&self, device: Device) -> HealthMetrics {
        let device_id = device.device_id().to_string();
        let start = Instant::now();
        let result = self
            .inner
            .client
            .fetch_status(&device.address, self.inner.config.status_timeout())
            .await;
        let response_time = start.elapsed().as_secs_f64();
        self.totals().checks += 1;

        let registry = &self.inner.registry;
        let metrics = match result {
            Ok(status) => {
                let (class, issues) =
                    classify(&status, Some(response_time), &self.inner.config.thresholds);
                let was_responsive = device.is_responsive();
                let _ = registry.update(&device_id, |d| {
                    if let Some(uptime) = status.uptime {
                        d.health.uptime = uptime;
                    }
                    if status.temperature.is_some() {
                        d.health.temperature = status.temperature;
                    }
                    if status.free_memory.is_some() {
                        d.health.free_memory = status.free_memory;
                    }
                    if status.firmware_version.is_some() {
                        d.health.firmware_version = status.firmware_version.clone();
                    }
                    if was_responsive {
                        d.last_seen = Some(Utc::now());
                    } else {
                        d.set_status(DeviceStatus::Online, "status ok");
                    }
                });
                if !was_responsive {
                    self.totals().status_changes += 1;
                }
                HealthMetrics {
                    device_id: device_id.clone(),
                    timestamp: Utc::now(),
                    status: class,
                    uptime: status.uptime,
                    temperature: status.temperature,
                    free_memory: status.free_memory,
                    cpu_usage: status.cpu_usage,
                    wifi_strength: status.wifi_strength,
                    error_count: status.error_count,
                    response_time: Some(response_time),
                    firmware_version: status.firmware_version,
                    issues,
                }
            }
            Err(TransportError::Status { code, body }) => {
                let reason = format!("status HTTP {}: {}", code, body);
                let _ = registry.set_status(&device_id, DeviceStatus::Error, reason.clone());
                HealthMetrics {
                    status: HealthClass::Critical,
                    response_time: Some(response_time),
                    ..HealthMetrics::offline(&device_id, reason)
                }
            }
            Err(TransportError::Decode(detail)) => {
                // The board answered, so it is alive but misbehaving
                let reason = format!("malformed status reply: {}", detail);
                let _ = registry.set_status(&device_id, DeviceStatus::Error, reason.clone());
                HealthMetrics {
                    status: HealthClass::Critical,
                    response_time: Some(response_time),
                    ..HealthMetrics::offline(&device_id, reason)
                }
            }
            Err(e) => {
                if device.status != DeviceStatus::Offline {
                    let reason = match e {
                        TransportError::Timeout => "timeout",
                        _ => "unreachable",
                    };
                    let _ = registry.set_status(&device_id, DeviceStatus::Offline, reason);
                    self.totals().status_changes += 1;
                }
                HealthMetrics::offline(&device_id, format!("status check failed: {}", e))
            }
        };

        self.store(metrics.clone());
        self.inner
            .events
            .publish(Event::DeviceHealthUpdate(metrics.clone()));
        if matches!(metrics.status, HealthClass::Warning | HealthClass::Critical) {
            self.raise_alert(&metrics);
        }
        metrics
    }

    fn raise_alert(&self, metrics: &HealthMetrics) {
        let alert = Alert {
            device_id: metrics.device_id.clone(),
            severity: metrics.status,
            message: metrics.issues.join("; "),
            timestamp: Utc::now(),
            metrics: metrics.clone(),
        };
        warn!(
            "Health alert for {} ({}): {}",
            alert.device_id, alert.severity, alert.message
        );
        self.totals().alerts += 1;
        self.inner.alerts.notify(&alert);
        self.inner.events.publish(Event::DeviceAlert(alert));
    }

    fn store(&self, metrics: HealthMetrics) {
        let cap = self.inner.config.history_size.max(1);
        let mut history = self.history_map();
        let entries = history.entry(metrics.device_id.clone()).or_default();
        entries.push_back(metrics);
        while entries.len() > cap {
            entries.pop_front();
        }
    }

    /// Most recent reading. A device the registry holds Offline is reported
    /// Offline regardless of its last reading.
    pub fn latest(&self, device_id: &str) -> Option<HealthMetrics> {
        let mut latest = self
            .history_map()
            .get(device_id)
            .and_then(|h| h.back().cloned())?;
        let offline = self
            .inner
            .registry
            .get(device_id)
            .map_or(true, |d| d.status == DeviceStatus::Offline);
        if offline && latest.status != HealthClass::Offline {
            latest.status = HealthClass::Offline;
            latest.issues.push("device offline".to_string());
        }
        Some(latest)
    }

    /// Up to `limit` most recent readings, oldest first
    pub fn history(&self, device_id: &str, limit: Option<usize>) -> Vec<HealthMetrics> {
        let history = self.history_map();
        let Some(entries) = history.get(device_id) else {
            return Vec::new();
        };
        let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn summary(&self) -> HealthSummary {
        let devices = self.inner.registry.list();
        let mut summary = HealthSummary {
            total_devices: devices.len(),
            healthy: 0,
            warning: 0,
            critical: 0,
            offline: 0,
            unchecked: 0,
            overall: HealthClass::Healthy,
            timestamp: Utc::now(),
        };
        for device in &devices {
            let Some(latest) = self.latest(device.device_id()) else {
                summary.unchecked += 1;
                continue;
            };
            summary.overall = summary.overall.max(latest.status);
            match latest.status {
                HealthClass::Healthy => summary.healthy += 1,
                HealthClass::Warning => summary.warning += 1,
                HealthClass::Critical => summary.critical += 1,
                HealthClass::Offline => summary.offline += 1,
            }
        }
        summary
    }

    /// Deep-check one device now, or all of them
    pub async fn force_check(&self, device_id: Option<&str>) -> Result<Vec<HealthMetrics>> {
        match device_id {
            Some(id) => {
                let device = self
                    .inner
                    .registry
                    .get(id)
                    .ok_or_else(|| Error::not_found("device", id))?;
                Ok(vec![self.deep_check(device).await])
            }
            None => Ok(self.deep_check_all().await),
        }
    }

    pub fn stats(&self) -> MonitorStats {
        let (devices_monitored, metrics_stored) = {
            let history = self.history_map();
            (history.len(), history.values().map(VecDeque::len).sum())
        };
        let totals = self.totals();
        MonitorStats {
            checks_performed: totals.checks,
            alerts_generated: totals.alerts,
            status_changes: totals.status_changes,
            devices_monitored,
            metrics_stored,
            subscribers: self.inner.alerts.len(),
            last_ping_check: totals.last_ping_check,
            last_deep_check: totals.last_deep_check,
        }
    }

    /// Run the ping and deep loops until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Health monitor started (ping every {}s, deep check every {}s)",
            self.inner.config.ping_interval_secs, self.inner.config.deep_interval_secs
        );
        tokio::join!(
            self.ping_loop(cancel.clone()),
            self.deep_loop(cancel.clone())
        );
        info!("Health monitor stopped");
    }

    // A round in progress always completes; cancellation is only observed
    // between rounds.
    async fn ping_loop(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            self.ping_all().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.inner.config.ping_interval()) => {}
            }
        }
    }

    async fn deep_loop(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            self.deep_check_all().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.inner.config.deep_interval()) => {}
            }
        }
    }
}
