//! Fleet components against fake boards over real HTTP.

mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use common::FakeBoard;
use derbyd::config::DiscoveryConfig;
use derbyd::config::DispatcherConfig;
use derbyd::config::HealthConfig;
use derbyd::fleet::client::DeviceClient;
use derbyd::fleet::client::HttpDeviceClient;
use derbyd::fleet::command::Command;
use derbyd::fleet::command::CommandKind;
use derbyd::fleet::command::CommandStatus;
use derbyd::fleet::device::DeviceStatus;
use derbyd::fleet::device::DeviceType;
use derbyd::fleet::discovery::Discovery;
use derbyd::fleet::dispatcher::Dispatcher;
use derbyd::fleet::health::HealthClass;
use derbyd::fleet::health::HealthMonitor;
use derbyd::fleet::registry::Registry;
use derbyd::Event;
use derbyd::EventBus;
use serde_json::json;

struct Fleet {
    registry: Arc<Registry>,
    discovery: Discovery,
    dispatcher: Dispatcher,
}

fn fleet(port: u16) -> Fleet {
    let registry = Arc::new(Registry::new());
    let client: Arc<dyn DeviceClient> = Arc::new(HttpDeviceClient::new().unwrap());
    let discovery = Discovery::new(
        registry.clone(),
        client.clone(),
        DiscoveryConfig {
            network_range: "127.0.0.1/32".to_string(),
            port,
            ..Default::default()
        },
    );
    let dispatcher = Dispatcher::new(
        registry.clone(),
        client,
        DispatcherConfig {
            command_timeout_ms: 2_000,
            ..Default::default()
        },
    );
    Fleet {
        registry,
        discovery,
        dispatcher,
    }
}

#[tokio::test]
async fn test_scan_finds_family_board() {
    let board = FakeBoard::start(common::family_info("cup-7")).await.unwrap();
    let fleet = fleet(board.port);

    let report = fleet.discovery.scan_configured().await.unwrap();
    assert_eq!(report.probed, 1);
    assert_eq!(report.registered, vec!["cup-7".to_string()]);

    let device = fleet.registry.get("cup-7").unwrap();
    assert_eq!(device.status, DeviceStatus::Online);
    assert_eq!(device.device_type, DeviceType::CupBase);
    assert_eq!(device.capabilities.led_count, 60);
    assert_eq!(device.mac_address.as_deref(), Some("AA:BB:CC:DD:EE:01"));

    // a second scan refreshes rather than duplicating
    let report = fleet.discovery.scan_configured().await.unwrap();
    assert_eq!(report.refreshed, vec!["cup-7".to_string()]);
    assert_eq!(fleet.registry.len(), 1);
    assert_eq!(fleet.discovery.stats().scans_performed, 2);
}

#[tokio::test]
async fn test_scan_ignores_other_systems() {
    let board = FakeBoard::start(json!({ "system": "SomeOtherThing", "device_id": "x" }))
        .await
        .unwrap();
    let fleet = fleet(board.port);
    let report = fleet.discovery.scan_configured().await.unwrap();
    assert!(report.registered.is_empty());
    assert!(fleet.registry.is_empty());
}

#[tokio::test]
async fn test_minimal_info_is_accepted() {
    let board = FakeBoard::start(json!({ "system": "DDM-ESP32" })).await.unwrap();
    let fleet = fleet(board.port);
    let report = fleet.discovery.scan_configured().await.unwrap();
    assert_eq!(report.registered, vec!["board-127-0-0-1".to_string()]);
    let device = fleet.registry.get("board-127-0-0-1").unwrap();
    assert_eq!(device.device_type, DeviceType::Unknown);
    assert_eq!(device.capabilities.led_count, 50);
}

#[tokio::test]
async fn test_command_round_trip() {
    let board = FakeBoard::start(common::family_info("cup-7")).await.unwrap();
    let fleet = fleet(board.port);
    fleet
        .discovery
        .register("stage-left", &board.address, DeviceType::MatrixWall)
        .await
        .unwrap();

    let outcome = fleet
        .dispatcher
        .send_now("stage-left", Command::new(CommandKind::animation("welcome")))
        .await;
    assert_eq!(outcome.status, CommandStatus::Success);
    assert_eq!(outcome.message, "animation executed");
    assert_eq!(outcome.data, Some(json!({ "ok": true })));

    assert_eq!(
        board.commands(),
        vec![json!({ "command": "animation", "parameters": { "name": "welcome" } })]
    );
    let device = fleet.registry.get("stage-left").unwrap();
    assert_eq!(device.device_type, DeviceType::MatrixWall);
    assert_eq!(device.counters.commands_succeeded, 1);
}

#[tokio::test]
async fn test_device_reported_error() {
    let board = FakeBoard::start_with(
        common::family_info("cup-7"),
        common::nominal_status(),
        Some((500, "strip fault")),
    )
    .await
    .unwrap();
    let fleet = fleet(board.port);
    fleet.discovery.scan_configured().await.unwrap();

    let outcome = fleet
        .dispatcher
        .send_now("cup-7", Command::new(CommandKind::AllOn))
        .await;
    assert_eq!(outcome.status, CommandStatus::Failed);
    assert_eq!(outcome.http_status, Some(500));
    assert_eq!(outcome.message, "HTTP 500: strip fault");
    assert_eq!(
        fleet.registry.get("cup-7").unwrap().status,
        DeviceStatus::Error
    );
}

#[tokio::test]
async fn test_unreachable_registration_is_refused_commands() {
    let address = common::dead_address().await.unwrap();
    let fleet = fleet(80);
    let device = fleet
        .discovery
        .register("ghost", &address, DeviceType::StripController)
        .await
        .unwrap();
    assert_eq!(device.status, DeviceStatus::Unknown);

    let outcome = fleet
        .dispatcher
        .send_now("ghost", Command::new(CommandKind::Ping))
        .await;
    assert_eq!(outcome.status, CommandStatus::DeviceOffline);
}

#[tokio::test]
async fn test_broadcast_with_one_dead_board() {
    let a = FakeBoard::start(common::family_info("a")).await.unwrap();
    let b = FakeBoard::start(common::family_info("b")).await.unwrap();
    let fleet = fleet(80);
    fleet
        .discovery
        .register("a", &a.address, DeviceType::CupBase)
        .await
        .unwrap();
    fleet
        .discovery
        .register("b", &b.address, DeviceType::CupBase)
        .await
        .unwrap();
    drop(b);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let results = fleet
        .dispatcher
        .broadcast(Command::new(CommandKind::AllOff), |_| true)
        .await;
    assert_eq!(results.len(), 2);
    let ok: Vec<_> = results.iter().filter(|o| o.is_success()).collect();
    assert_eq!(ok.len(), 1);
    assert_eq!(ok[0].device_id, "a");
    let failed = results.iter().find(|o| o.device_id == "b").unwrap();
    assert!(matches!(
        failed.status,
        CommandStatus::DeviceOffline | CommandStatus::Failed
    ));
}

#[tokio::test]
async fn test_health_check_classifies_and_alerts() {
    let board = FakeBoard::start_with(
        common::family_info("cup-7"),
        json!({ "uptime": 10, "free_memory": 512, "temperature": 40.0 }),
        None,
    )
    .await
    .unwrap();
    let fleet = fleet(board.port);
    fleet.discovery.scan_configured().await.unwrap();

    let events = Arc::new(EventBus::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    events.subscribe(move |e: &Event| sink.lock().unwrap().push(e.name()));
    let monitor = HealthMonitor::new(
        fleet.registry.clone(),
        Arc::new(HttpDeviceClient::new().unwrap()),
        HealthConfig::default(),
        Duration::from_secs(60),
        events,
    );
    let alerts = Arc::new(Mutex::new(Vec::new()));
    let alert_sink = alerts.clone();
    monitor.subscribe(move |a| alert_sink.lock().unwrap().push(a.severity));

    let metrics = monitor.force_check(Some("cup-7")).await.unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].status, HealthClass::Critical);
    assert_eq!(metrics[0].free_memory, Some(512));
    assert_eq!(*alerts.lock().unwrap(), vec![HealthClass::Critical]);
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["device_health_update", "device_alert"]
    );
    assert_eq!(monitor.latest("cup-7").unwrap().status, HealthClass::Critical);
    assert_eq!(monitor.history("cup-7", None).len(), 1);
    assert!(monitor.force_check(Some("nobody")).await.is_err());
}

fn monitor(fleet: &Fleet) -> HealthMonitor {
    HealthMonitor::new(
        fleet.registry.clone(),
        Arc::new(HttpDeviceClient::new().unwrap()),
        HealthConfig::default(),
        Duration::from_secs(60),
        Arc::new(EventBus::new()),
    )
}

#[tokio::test]
async fn test_oddly_typed_fields_are_tolerated() {
    let mut info = common::family_info("cup-9");
    info["max_brightness"] = json!(1000);
    info["uptime"] = json!("a while");
    let mut status = common::nominal_status();
    status["uptime"] = json!(3600.5);
    status["cpu_usage"] = json!("n/a");
    let board = FakeBoard::start_with(info, status, None).await.unwrap();
    let fleet = fleet(board.port);

    let report = fleet.discovery.scan_configured().await.unwrap();
    assert_eq!(report.registered, vec!["cup-9".to_string()]);

    let metrics = monitor(&fleet).force_check(Some("cup-9")).await.unwrap();
    assert_eq!(metrics[0].status, HealthClass::Healthy);
    assert_eq!(metrics[0].uptime, Some(3600));
    assert!(metrics[0].cpu_usage.is_none());
    assert_eq!(fleet.registry.get("cup-9").unwrap().status, DeviceStatus::Online);
}

#[tokio::test]
async fn test_unparseable_status_is_error_not_offline() {
    let board = FakeBoard::start_with(common::family_info("cup-9"), json!("rebooting"), None)
        .await
        .unwrap();
    let fleet = fleet(board.port);
    fleet.discovery.scan_configured().await.unwrap();

    let metrics = monitor(&fleet).force_check(Some("cup-9")).await.unwrap();
    assert_eq!(metrics[0].status, HealthClass::Critical);
    let device = fleet.registry.get("cup-9").unwrap();
    assert_eq!(device.status, DeviceStatus::Error);
    assert_ne!(device.status_reason.as_deref(), Some("unreachable"));
}

#[tokio::test]
async fn test_unknown_device_has_its_own_code() {
    let board = FakeBoard::start(common::family_info("cup-7")).await.unwrap();
    let fleet = fleet(board.port);
    fleet.discovery.scan_configured().await.unwrap();

    let outcome = fleet
        .dispatcher
        .send_now("cup-8", Command::new(CommandKind::AllOn))
        .await;
    assert_eq!(outcome.status, CommandStatus::NotFound);
    assert_eq!(outcome.code.as_deref(), Some("not_found"));
    assert!(board.commands().is_empty());

    let err = fleet
        .dispatcher
        .send("cup-8", Command::new(CommandKind::AllOn))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}
