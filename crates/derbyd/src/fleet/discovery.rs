//! Network scanning and manual registration of boards.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::client::DeviceClient;
use super::client::InfoResponse;
use super::client::TransportError;
use super::device::validate_device_id;
use super::device::Capabilities;
use super::device::Device;
use super::device::DeviceStatus;
use super::device::DeviceType;
use super::registry::Registry;
use super::registry::UpsertOutcome;
use crate::config::DiscoveryConfig;
use crate::error::Error;
use crate::error::Result;

/// Smallest prefix accepted; a /16 is already 65k probes
const MIN_PREFIX: u8 = 16;

/// An IPv4 CIDR block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    network: Ipv4Addr,
    prefix: u8,
}

impl AddressRange {
    /// Parse `a.b.c.d/nn`; a bare address is a /32
    pub fn parse(s: &str) -> Result<Self> {
        let bad = |msg: String| Error::validation("network_range", msg);
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (
                addr,
                prefix
                    .parse::<u8>()
                    .map_err(|_| bad(format!("invalid prefix in '{}'", s)))?,
            ),
            None => (s.trim(), 32),
        };
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| bad(format!("invalid IPv4 address in '{}'", s)))?;
        if !(MIN_PREFIX..=32).contains(&prefix) {
            return Err(bad(format!(
                "prefix /{} outside /{}../32",
                prefix, MIN_PREFIX
            )));
        }
        let mask = u32::MAX << (32 - prefix as u32);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    /// Usable host addresses; network and broadcast are skipped below /31
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u32::from(self.network);
        let size = 1u64 << (32 - self.prefix as u32);
        let (first, last) = if self.prefix >= 31 {
            (0, size - 1)
        } else {
            (1, size - 2)
        };
        (first..=last).map(move |offset| Ipv4Addr::from(base + offset as u32))
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Summary of a single scan
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanReport {
    pub probed: usize,
    pub registered: Vec<String>,
    pub refreshed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryStats {
    pub total_devices: usize,
    pub online_devices: usize,
    pub offline_devices: usize,
    pub devices_by_type: HashMap<DeviceType, usize>,
    pub last_scan: Option<DateTime<Utc>>,
    pub scans_performed: u64,
    pub scanning: bool,
    pub network_range: String,
    pub port: u16,
}

#[derive(Debug, Default)]
struct ScanState {
    last_scan: Option<DateTime<Utc>>,
    scans_performed: u64,
    scanning: bool,
}

pub struct Discovery {
    registry: Arc<Registry>,
    client: Arc<dyn DeviceClient>,
    config: DiscoveryConfig,
    state: Mutex<ScanState>,
}

impl Discovery {
    pub fn new(
        registry: Arc<Registry>,
        client: Arc<dyn DeviceClient>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            registry,
            client,
            config,
            state: Mutex::new(ScanState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Probe every host in `range` on `port` and reconcile responders into
    /// the registry. Never removes devices.
    pub async fn scan(&self, range: &AddressRange, port: u16, host_timeout: Duration) -> ScanReport {
        self.state().scanning = true;
        info!("Scanning {} port {} for devices", range, port);

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut report = ScanReport::default();
        for ip in range.hosts() {
            report.probed += 1;
            let address = format!("{}:{}", ip, port);
            let client = self.client.clone();
            let semaphore = semaphore.clone();
            let marker = self.config.family_marker.clone();
            let info_timeout = self.config.info_timeout();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                probe(client.as_ref(), &address, host_timeout, info_timeout, &marker)
                    .await
                    .ok()
                    .map(|info| (address, info))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (address, info) = match joined {
                Ok(Some(found)) => found,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Probe task failed: {}", e);
                    continue;
                }
            };
            let device = match device_from_info(&info, &address, None) {
                Ok(device) => device,
                Err(e) => {
                    warn!("Ignoring board at {}: {}", address, e);
                    continue;
                }
            };
            let id = device.device_id().to_string();
            match self.registry.upsert(device) {
                UpsertOutcome::Registered => report.registered.push(id),
                UpsertOutcome::Refreshed => report.refreshed.push(id),
            }
        }
        report.registered.sort();
        report.refreshed.sort();

        let mut state = self.state();
        state.scanning = false;
        state.scans_performed += 1;
        state.last_scan = Some(Utc::now());
        info!(
            "Scan of {} complete: {} new, {} refreshed",
            range,
            report.registered.len(),
            report.refreshed.len()
        );
        report
    }

    /// Scan the configured range
    pub async fn scan_configured(&self) -> Result<ScanReport> {
        let range = AddressRange::parse(&self.config.network_range)?;
        Ok(self
            .scan(&range, self.config.port, self.config.host_timeout())
            .await)
    }

    /// Register a device by hand. The caller's id is kept even when the
    /// board reports another; an unreachable board is registered as Unknown.
    pub async fn register(
        &self,
        device_id: &str,
        address: &str,
        device_type: DeviceType,
    ) -> Result<Device> {
        let mut device = Device::new(device_id, address)?;
        device.device_type = device_type;

        match probe(
            self.client.as_ref(),
            address,
            self.config.host_timeout(),
            self.config.info_timeout(),
            &self.config.family_marker,
        )
        .await
        {
            Ok(info) => {
                let mut probed = device_from_info(&info, address, Some(device_id))?;
                if device_type != DeviceType::Unknown {
                    probed.device_type = device_type;
                }
                device = probed;
            }
            Err(_) => {
                warn!(
                    "Device {} at {} did not answer the probe, registering as unknown",
                    device_id, address
                );
            }
        }

        self.registry.upsert(device);
        self.registry
            .get(device_id)
            .ok_or_else(|| Error::not_found("device", device_id))
    }

    pub fn unregister(&self, device_id: &str) -> Result<Device> {
        self.registry
            .remove(device_id)
            .ok_or_else(|| Error::not_found("device", device_id))
    }

    /// Re-probe one known device
    pub async fn refresh(&self, device_id: &str) -> Result<Device> {
        let known = self
            .registry
            .get(device_id)
            .ok_or_else(|| Error::not_found("device", device_id))?;

        match probe(
            self.client.as_ref(),
            &known.address,
            self.config.host_timeout(),
            self.config.info_timeout(),
            &self.config.family_marker,
        )
        .await
        {
            Ok(info) => {
                let probed = device_from_info(&info, &known.address, Some(device_id))?;
                self.registry.upsert(probed);
            }
            Err(ProbeMiss::Transport(
                e @ (TransportError::Decode(_) | TransportError::Status { .. }),
            )) => {
                self.registry
                    .set_status(device_id, DeviceStatus::Error, format!("info: {}", e))?;
            }
            Err(ProbeMiss::Foreign(system)) => {
                let reason = format!("unexpected system {:?}", system);
                self.registry
                    .set_status(device_id, DeviceStatus::Error, reason)?;
            }
            Err(_) => {
                self.registry
                    .set_status(device_id, DeviceStatus::Offline, "unreachable")?;
            }
        }
        self.registry
            .get(device_id)
            .ok_or_else(|| Error::not_found("device", device_id))
    }

    pub fn stats(&self) -> DiscoveryStats {
        let counts = self.registry.status_counts();
        let state = self.state();
        DiscoveryStats {
            total_devices: self.registry.len(),
            online_devices: counts.get(&DeviceStatus::Online).copied().unwrap_or(0),
            offline_devices: counts.get(&DeviceStatus::Offline).copied().unwrap_or(0),
            devices_by_type: self.registry.type_counts(),
            last_scan: state.last_scan,
            scans_performed: state.scans_performed,
            scanning: state.scanning,
            network_range: self.config.network_range.clone(),
            port: self.config.port,
        }
    }

    /// Scan on the configured interval until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let range = match AddressRange::parse(&self.config.network_range) {
            Ok(range) => range,
            Err(e) => {
                error!("Discovery disabled: {}", e);
                return;
            }
        };
        info!(
            "Discovery loop started ({} every {}s)",
            range, self.config.scan_interval_secs
        );
        // A scan in progress runs to completion before cancellation is seen
        while !cancel.is_cancelled() {
            self.scan(&range, self.config.port, self.config.host_timeout())
                .await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.scan_interval()) => {}
            }
        }
        info!("Discovery loop stopped");
    }
}

/// Why a probe found no usable board
#[derive(Debug)]
enum ProbeMiss {
    NoConnection,
    /// Answered, but with another family marker
    Foreign(Option<String>),
    /// Connected, but `/info` failed
    Transport(TransportError),
}

/// Connect, fetch `/info`, and check the family marker
async fn probe(
    client: &dyn DeviceClient,
    address: &str,
    host_timeout: Duration,
    info_timeout: Duration,
    marker: &str,
) -> std::result::Result<InfoResponse, ProbeMiss> {
    if !client.connect_check(address, host_timeout).await {
        return Err(ProbeMiss::NoConnection);
    }
    match client.fetch_info(address, info_timeout).await {
        Ok(info) if info.system.as_deref() == Some(marker) => Ok(info),
        Ok(info) => {
            debug!(
                "Ignoring {} (system {:?} is not {})",
                address, info.system, marker
            );
            Err(ProbeMiss::Foreign(info.system))
        }
        Err(e) => {
            debug!("No device info from {}: {}", address, e);
            Err(ProbeMiss::Transport(e))
        }
    }
}

/// Build a device from an `/info` reply. Without `id`, the board's own id is
/// used, falling back to one derived from the host.
pub(crate) fn device_from_info(
    info: &InfoResponse,
    address: &str,
    id: Option<&str>,
) -> Result<Device> {
    let id = match id {
        Some(id) => id.to_string(),
        None => info
            .device_id
            .clone()
            .and_then(|id| validate_device_id(id).ok())
            .unwrap_or_else(|| fallback_id(address)),
    };
    let mut device = Device::new(id, address)?;
    device.device_type = info.device_type;
    device.mac_address = info.mac_address.clone();

    let defaults = Capabilities::default();
    device.capabilities = Capabilities {
        led_count: info.led_count.unwrap_or(defaults.led_count),
        led_type: info.led_type.clone().unwrap_or(defaults.led_type),
        color_order: info.color_order.clone().unwrap_or(defaults.color_order),
        max_brightness: info.max_brightness.unwrap_or(defaults.max_brightness),
        current_brightness: info
            .current_brightness
            .unwrap_or(defaults.current_brightness),
    };
    device.health.uptime = info.uptime.unwrap_or(0);
    device.health.temperature = info.temperature;
    device.health.free_memory = info.free_memory;
    device.health.firmware_version = info.firmware_version.clone();
    device.set_status(DeviceStatus::Online, "discovered");
    Ok(device)
}

fn fallback_id(address: &str) -> String {
    let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
    format!("board-{}", host.replace(['.', ':'], "-"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::client::MockBoard;
    use crate::fleet::client::MockDeviceClient;

    fn discovery(client: Arc<MockDeviceClient>) -> (Arc<Registry>, Discovery) {
        let registry = Arc::new(Registry::new());
        let config = DiscoveryConfig {
            network_range: "10.0.0.0/29".to_string(),
            workers: 3,
            ..Default::default()
        };
        (
            registry.clone(),
            Discovery::new(registry, client, config),
        )
    }

    #[test]
    fn test_range_parse() {
        let range = AddressRange::parse("192.168.1.77/24").unwrap();
        assert_eq!(range.to_string(), "192.168.1.0/24");
        assert_eq!(range.hosts().count(), 254);
        assert_eq!(range.hosts().next(), Some(Ipv4Addr::new(192, 168, 1, 1)));

        let single = AddressRange::parse("127.0.0.1").unwrap();
        assert_eq!(single.hosts().collect::<Vec<_>>(), vec![Ipv4Addr::LOCALHOST]);

        assert!(AddressRange::parse("10.0.0.0/8").is_err());
        assert!(AddressRange::parse("10.0.0/24").is_err());
        assert!(AddressRange::parse("10.0.0.0/x").is_err());
    }

    #[test]
    fn test_fallback_id() {
        assert_eq!(fallback_id("10.0.0.5:80"), "board-10-0-0-5");
    }

    #[tokio::test]
    async fn test_scan_accepts_only_family() {
        let client = Arc::new(MockDeviceClient::new());
        client.add_board("10.0.0.2:80", MockBoard::family("DDM-ESP32", "cup-a"));
        client.add_board("10.0.0.3:80", MockBoard::family("SomeOtherThing", "printer"));
        let mut nameless = MockBoard::family("DDM-ESP32", "x");
        if let Some(info) = nameless.info.as_mut() {
            info.device_id = None;
        }
        client.add_board("10.0.0.4:80", nameless);
        let mut no_info = MockBoard::family("DDM-ESP32", "y");
        no_info.info = None;
        client.add_board("10.0.0.5:80", no_info);

        let (registry, discovery) = discovery(client);
        let range = AddressRange::parse("10.0.0.0/29").unwrap();
        let report = discovery.scan(&range, 80, Duration::from_millis(100)).await;

        assert_eq!(report.probed, 6);
        assert_eq!(report.registered, vec!["board-10-0-0-4", "cup-a"]);
        assert_eq!(registry.len(), 2);
        let cup = registry.get("cup-a").unwrap();
        assert!(cup.is_online());
        assert_eq!(cup.capabilities.led_count, 60);
        assert_eq!(cup.device_type, DeviceType::CupBase);
    }

    #[tokio::test]
    async fn test_rescan_refreshes_and_keeps_counters() {
        let client = Arc::new(MockDeviceClient::new());
        client.add_board("10.0.0.2:80", MockBoard::family("DDM-ESP32", "cup-a"));
        let (registry, discovery) = discovery(client);

        discovery.scan_configured().await.unwrap();
        registry
            .update("cup-a", |d| d.record_command_result(true, 0.1))
            .unwrap();
        let report = discovery.scan_configured().await.unwrap();

        assert_eq!(report.refreshed, vec!["cup-a"]);
        assert_eq!(registry.get("cup-a").unwrap().counters.commands_sent, 1);
        let stats = discovery.stats();
        assert_eq!(stats.scans_performed, 2);
        assert_eq!(stats.online_devices, 1);
        assert!(!stats.scanning);
        assert!(stats.last_scan.is_some());
    }

    #[tokio::test]
    async fn test_manual_registration() {
        let client = Arc::new(MockDeviceClient::new());
        client.add_board("10.0.0.2:80", MockBoard::family("DDM-ESP32", "reported-id"));
        let (registry, discovery) = discovery(client);

        let device = discovery
            .register("finish-line", "10.0.0.2:80", DeviceType::StripController)
            .await
            .unwrap();
        assert_eq!(device.device_id(), "finish-line");
        assert_eq!(device.device_type, DeviceType::StripController);
        assert!(device.is_online());

        let ghost = discovery
            .register("ghost", "10.0.0.6:80", DeviceType::Unknown)
            .await
            .unwrap();
        assert_eq!(ghost.status, DeviceStatus::Unknown);

        let err = discovery
            .register("bad id", "10.0.0.2:80", DeviceType::Unknown)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");

        assert!(discovery.unregister("ghost").is_ok());
        assert!(discovery.unregister("ghost").is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_marks_unreachable_offline() {
        let client = Arc::new(MockDeviceClient::new());
        client.add_board("10.0.0.2:80", MockBoard::family("DDM-ESP32", "cup-a"));
        let (registry, discovery) = discovery(client.clone());
        discovery.scan_configured().await.unwrap();

        client.update_board("10.0.0.2:80", |b| b.reachable = false);
        let device = discovery.refresh("cup-a").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
        assert_eq!(device.status_reason.as_deref(), Some("unreachable"));
        assert!(registry.contains("cup-a"));

        assert!(discovery.refresh("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_info_is_error_not_offline() {
        let client = Arc::new(MockDeviceClient::new());
        client.add_board("10.0.0.2:80", MockBoard::family("DDM-ESP32", "cup-a"));
        let (registry, discovery) = discovery(client.clone());
        discovery.scan_configured().await.unwrap();

        client.update_board("10.0.0.2:80", |b| b.malformed = true);
        let device = discovery.refresh("cup-a").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Error);
        assert_ne!(device.status_reason.as_deref(), Some("unreachable"));

        // An unparseable board is never picked up by a scan
        client.add_board("10.0.0.3:80", {
            let mut board = MockBoard::family("DDM-ESP32", "cup-b");
            board.malformed = true;
            board
        });
        let report = discovery.scan_configured().await.unwrap();
        assert!(report.registered.is_empty());
        assert!(!registry.contains("cup-b"));
    }
}
