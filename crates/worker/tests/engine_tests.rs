//! Integration tests for the health engine.
//!
//! Each test seeds a [`MemoryTelemetry`] tree, runs a full scan and then
//! feeds transport events through the engine, checking the published
//! snapshot, the projected state and the events put on the bus.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use fleetwatch_core::blacklist::{
    Blacklist, BlacklistConfig, DeviceBlacklistEntry, InstanceBlacklistEntry,
};
use fleetwatch_core::config::{EngineConfig, SourceSettings};
use fleetwatch_core::profile::SourceRegistry;
use fleetwatch_core::reachability::DeviceStatus;
use fleetwatch_core::record::{HealthKind, InstanceHealth};
use fleetwatch_core::types::ObjectMeta;
use fleetwatch_core::{FieldState, Timestamp};
use fleetwatch_events::{EventBus, EventCategory, EventKind, HealthEvent, MemorySink};
use fleetwatch_worker::transport::TransportEvent;
use fleetwatch_worker::{Engine, MemoryTelemetry, Telemetry};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const DOOR: &str = "zigbee.0.door";
const DOOR_MAIN: &str = "zigbee.0.door.link_quality";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn minutes_ago(minutes: i64) -> Timestamp {
    Utc::now() - ChronoDuration::minutes(minutes)
}

fn config_with(sources: &[(&str, i64)]) -> EngineConfig {
    EngineConfig {
        sources: sources
            .iter()
            .map(|(id, max)| (id.to_string(), SourceSettings { max_minutes: *max }))
            .collect::<BTreeMap<_, _>>(),
        check_instances: false,
        check_adapter_updates: false,
        ..Default::default()
    }
}

/// A reachable zigbee door sensor on a connected, settled instance.
fn zigbee_tree() -> Arc<MemoryTelemetry> {
    let telemetry = MemoryTelemetry::new();
    let at = minutes_ago(1);
    telemetry.insert_field(DOOR_MAIN, FieldState::new(128.0, at));
    telemetry.insert_field("zigbee.0.door.battery", FieldState::new(50.0, at));
    telemetry.insert_field("zigbee.0.door.available", FieldState::new(true, at));
    telemetry.insert_field("zigbee.0.info.connection", FieldState::new(true, minutes_ago(10)));
    telemetry.insert_object(DOOR, ObjectMeta::named("Door sensor"));
    Arc::new(telemetry)
}

struct Harness {
    engine: Engine,
    telemetry: Arc<MemoryTelemetry>,
    transport: broadcast::Receiver<TransportEvent>,
    bus: broadcast::Receiver<HealthEvent>,
    sink: Arc<MemorySink>,
}

fn harness(telemetry: Arc<MemoryTelemetry>, config: EngineConfig, blacklist: Blacklist) -> Harness {
    let event_bus = Arc::new(EventBus::default());
    let sink = Arc::new(MemorySink::new());
    let transport = telemetry.events();
    let bus = event_bus.subscribe();
    let engine = Engine::new(
        telemetry.clone(),
        Arc::new(SourceRegistry::builtin().unwrap()),
        Arc::new(config),
        Arc::new(blacklist),
        event_bus,
        sink.clone(),
    );
    Harness {
        engine,
        telemetry,
        transport,
        bus,
        sink,
    }
}

impl Harness {
    /// Write a field and route the resulting transport event.
    async fn set(&mut self, path: &str, value: impl Into<fleetwatch_core::FieldValue>) {
        self.telemetry.set_field(path, value, Utc::now());
        self.pump().await;
    }

    async fn pump(&mut self) {
        while let Ok(event) = self.transport.try_recv() {
            self.engine.handle_transport_event(event).await;
        }
    }

    fn events(&mut self) -> Vec<HealthEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.bus.try_recv() {
            events.push(event);
        }
        events
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scan_builds_canonical_record() {
    let mut h = harness(zigbee_tree(), config_with(&[("zigbee", 0)]), Blacklist::default());
    assert!(h.engine.full_scan().await);

    let snapshot = h.engine.snapshot().borrow().clone();
    let door = &snapshot.devices[DOOR];
    assert_eq!(door.name, "Door sensor");
    assert_eq!(door.adapter, "Zigbee");
    assert_eq!(door.instance, "zigbee.0");
    assert_eq!(door.signal.to_string(), "50%");
    assert_eq!(door.battery.to_string(), "50%");
    assert!(door.is_battery_device);
    assert!(!door.is_low_battery);
    assert_eq!(door.status, DeviceStatus::Online);
    assert_eq!(door.instance_connected, Some(true));

    assert_eq!(h.sink.get("devices.countAll").await, Some(json!(1)));
    assert_eq!(h.sink.get("devices.batteryCount").await, Some(json!(1)));
    assert_eq!(h.sink.get("devices.offlineCount").await, Some(json!(0)));
    // The startup state is not notified.
    assert!(h.events().is_empty());
}

#[tokio::test]
async fn offline_and_back_restores_signal() {
    let mut h = harness(zigbee_tree(), config_with(&[("zigbee", 0)]), Blacklist::default());
    h.engine.full_scan().await;

    h.set("zigbee.0.door.available", false).await;
    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].category, EventCategory::Device);
    assert_eq!(events[0].kind, EventKind::Offline);
    assert_eq!(events[0].identity, DOOR_MAIN);
    let door = h.engine.devices().get(DOOR).unwrap();
    assert_eq!(door.status, DeviceStatus::Offline);
    assert_eq!(door.signal.to_string(), "0%");
    assert_eq!(h.sink.get("devices.offlineCount").await, Some(json!(1)));

    h.set("zigbee.0.door.available", true).await;
    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Online);
    let door = h.engine.devices().get(DOOR).unwrap();
    assert_eq!(door.signal.to_string(), "50%");
}

#[tokio::test]
async fn repeated_value_does_not_notify_twice() {
    let mut h = harness(zigbee_tree(), config_with(&[("zigbee", 0)]), Blacklist::default());
    h.engine.full_scan().await;

    h.set("zigbee.0.door.available", false).await;
    h.set("zigbee.0.door.available", false).await;
    assert_eq!(h.events().len(), 1);
}

#[tokio::test]
async fn zero_battery_glitch_is_ignored() {
    let mut h = harness(zigbee_tree(), config_with(&[("zigbee", 0)]), Blacklist::default());
    h.engine.full_scan().await;

    h.set("zigbee.0.door.battery", 0.0).await;
    let door = h.engine.devices().get(DOOR).unwrap();
    assert_eq!(door.battery.to_string(), "50%");
}

#[tokio::test]
async fn low_battery_rising_edge_notifies() {
    let mut h = harness(zigbee_tree(), config_with(&[("zigbee", 0)]), Blacklist::default());
    h.engine.full_scan().await;

    h.set("zigbee.0.door.battery", 8.0).await;
    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::LowBattery);
    assert_eq!(h.sink.get("devices.lowBatteryCount").await, Some(json!(1)));

    h.set("zigbee.0.door.battery", 7.0).await;
    assert!(h.events().is_empty());
}

#[tokio::test]
async fn unsettled_connection_suppresses_status_events() {
    let telemetry = zigbee_tree();
    telemetry.insert_field("zigbee.0.info.connection", FieldState::new(true, Utc::now()));
    let mut h = harness(telemetry, config_with(&[("zigbee", 0)]), Blacklist::default());
    h.engine.full_scan().await;

    h.set("zigbee.0.door.available", false).await;
    assert!(h.events().is_empty());
    // The record still follows the field.
    let door = h.engine.devices().get(DOOR).unwrap();
    assert_eq!(door.status, DeviceStatus::Offline);
}

#[tokio::test]
async fn staleness_threshold_delays_offline() {
    let telemetry = zigbee_tree();
    telemetry.insert_field("zigbee.0.door.available", FieldState::new(false, minutes_ago(10)));
    let mut h = harness(telemetry.clone(), config_with(&[("zigbee", 30)]), Blacklist::default());
    h.engine.full_scan().await;
    assert_eq!(h.engine.devices().get(DOOR).unwrap().status, DeviceStatus::Online);

    telemetry.insert_field("zigbee.0.door.available", FieldState::new(false, minutes_ago(45)));
    h.engine.refresh().await;
    assert_eq!(h.engine.devices().get(DOOR).unwrap().status, DeviceStatus::Offline);
}

#[tokio::test]
async fn muted_device_is_listed_but_silent() {
    let config = BlacklistConfig {
        devices: vec![DeviceBlacklistEntry {
            device: DOOR_MAIN.into(),
            notify: true,
            ..Default::default()
        }],
        ..Default::default()
    };
    let (blacklist, errors) = Blacklist::from_config(&config);
    assert!(errors.is_empty());

    let mut h = harness(zigbee_tree(), config_with(&[("zigbee", 0)]), blacklist);
    h.engine.full_scan().await;
    h.set("zigbee.0.door.available", false).await;

    assert!(h.events().is_empty());
    assert_eq!(h.sink.get("devices.offlineCount").await, Some(json!(1)));
}

#[tokio::test]
async fn new_device_triggers_rescan_and_deletion_removes_it() {
    let mut h = harness(zigbee_tree(), config_with(&[("zigbee", 0)]), Blacklist::default());
    h.engine.full_scan().await;

    h.set("zigbee.0.window.link_quality", 255.0).await;
    assert!(h.engine.devices().get("zigbee.0.window").is_some());
    assert_eq!(h.sink.get("devices.countAll").await, Some(json!(2)));

    h.telemetry.delete("zigbee.0.window.link_quality");
    h.pump().await;
    assert!(h.engine.devices().get("zigbee.0.window").is_none());
    assert_eq!(h.sink.get("devices.countAll").await, Some(json!(1)));
}

#[tokio::test]
async fn battery_only_listing_skips_mains_devices() {
    let telemetry = zigbee_tree();
    telemetry.insert_field("zigbee.0.plug.link_quality", FieldState::new(200.0, Utc::now()));
    telemetry.insert_field("zigbee.0.plug.available", FieldState::new(true, Utc::now()));
    let config = EngineConfig {
        list_only_battery: true,
        ..config_with(&[("zigbee", 0)])
    };
    let mut h = harness(telemetry, config, Blacklist::default());
    h.engine.full_scan().await;

    assert!(h.engine.devices().get(DOOR).is_some());
    assert!(h.engine.devices().get("zigbee.0.plug").is_none());
    // A skipped device does not count as new on its next change.
    h.set("zigbee.0.plug.link_quality", 180.0).await;
    assert!(h.engine.devices().get("zigbee.0.plug").is_none());
}

#[tokio::test]
async fn disabled_sources_are_not_scanned() {
    let mut h = harness(zigbee_tree(), config_with(&[("hue", 0)]), Blacklist::default());
    h.engine.full_scan().await;
    assert!(h.engine.devices().devices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn confirmed_presence_flag_is_reread() {
    let telemetry = MemoryTelemetry::new();
    let at = Utc::now();
    telemetry.insert_field("alexa2.0.Echo-Devices.kitchen.online", FieldState::new(false, at));
    telemetry.insert_field("alexa2.0.Echo-Devices.living.online", FieldState::new(true, at));
    let mut h = harness(Arc::new(telemetry), config_with(&[("alexa2", 0)]), Blacklist::default());
    h.engine.full_scan().await;

    let devices = h.engine.devices();
    assert_eq!(
        devices.get("alexa2.0.Echo-Devices.kitchen").unwrap().status,
        DeviceStatus::Offline
    );
    assert_eq!(
        devices.get("alexa2.0.Echo-Devices.living").unwrap().status,
        DeviceStatus::Online
    );
}

#[tokio::test]
async fn stale_presence_flag_is_reread_before_offline() {
    let telemetry = MemoryTelemetry::new();
    let stale = minutes_ago(45);
    telemetry.insert_field("alexa2.0.Echo-Devices.kitchen.online", FieldState::new(false, stale));
    telemetry.insert_field("alexa2.0.Echo-Devices.living.online", FieldState::new(true, stale));
    telemetry.insert_field(
        "alexa2.0.Echo-Devices.hall.online",
        FieldState::new(false, minutes_ago(10)),
    );
    let config = config_with(&[("alexa2", 30)]);
    let mut h = harness(Arc::new(telemetry), config, Blacklist::default());
    h.engine.full_scan().await;

    let devices = h.engine.devices();
    let status = |name: &str| {
        devices
            .get(&format!("alexa2.0.Echo-Devices.{name}"))
            .unwrap()
            .status
    };
    // Past the threshold the second read decides.
    assert_eq!(status("kitchen"), DeviceStatus::Offline);
    assert_eq!(status("living"), DeviceStatus::Online);
    // Within the threshold the flag is not consulted.
    assert_eq!(status("hall"), DeviceStatus::Online);
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

fn instance_tree() -> Arc<MemoryTelemetry> {
    let telemetry = MemoryTelemetry::new();
    let at = minutes_ago(5);
    telemetry.insert_object(
        "system.adapter.hue.0",
        ObjectMeta::named("hue")
            .with_attribute("mode", json!("daemon"))
            .with_attribute("version", json!("3.0.2")),
    );
    telemetry.insert_field("system.adapter.hue.0.alive", FieldState::new(true, at));
    telemetry.insert_field("system.adapter.hue.0.connected", FieldState::new(true, at));
    telemetry.insert_field("hue.0.info.connection", FieldState::new(true, at));
    Arc::new(telemetry)
}

fn instance_config() -> EngineConfig {
    EngineConfig {
        check_instances: true,
        error_timeout_secs: 120,
        deactivation_timeout_secs: 120,
        ..config_with(&[])
    }
}

#[tokio::test]
async fn instance_scan_commits_health_directly() {
    let mut h = harness(instance_tree(), instance_config(), Blacklist::default());
    h.engine.full_scan().await;

    let hue = &h.engine.instances().instances()["hue.0"];
    assert_eq!(hue.adapter, "Hue");
    assert_eq!(hue.version.as_deref(), Some("3.0.2"));
    assert_eq!(hue.health, InstanceHealth::Healthy);
    assert_eq!(
        h.sink.get("adapterAndInstances.countAllActiveInstances").await,
        Some(json!(1))
    );
}

#[tokio::test]
async fn short_flap_is_suppressed() {
    let mut h = harness(instance_tree(), instance_config(), Blacklist::default());
    h.engine.full_scan().await;

    h.set("system.adapter.hue.0.connected", false).await;
    assert_eq!(h.engine.instances().pending_timers(), 1);
    h.set("system.adapter.hue.0.connected", true).await;

    assert_eq!(h.engine.instances().pending_timers(), 0);
    assert_eq!(
        h.engine.instances().instances()["hue.0"].health,
        InstanceHealth::Healthy
    );
    assert!(h.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn error_is_committed_after_both_confirmation_stages() {
    let telemetry = instance_tree();
    let Harness {
        engine,
        telemetry,
        mut bus,
        ..
    } = harness(telemetry, instance_config(), Blacklist::default());

    let mut snapshot = engine.snapshot();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(engine.run(cancel.clone()));
    snapshot.changed().await.unwrap();

    telemetry.set_field("system.adapter.hue.0.connected", false, Utc::now());

    // First stage is half of the error timeout.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(bus.try_recv().is_err());

    tokio::time::sleep(Duration::from_secs(61)).await;
    let event = bus.try_recv().unwrap();
    assert_eq!(event.category, EventCategory::Instance);
    assert_eq!(event.kind, EventKind::InstanceError);
    assert_eq!(event.identity, "hue.0");
    assert_eq!(
        snapshot.borrow().instances["hue.0"].health.kind(),
        HealthKind::Unhealthy
    );

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn missing_heartbeat_is_deactivated_not_error() {
    let telemetry = instance_tree();
    telemetry.insert_field("system.adapter.hue.0.alive", FieldState::new(false, Utc::now()));
    let mut h = harness(telemetry, instance_config(), Blacklist::default());
    h.engine.full_scan().await;

    let hue = &h.engine.instances().instances()["hue.0"];
    assert_eq!(hue.health, InstanceHealth::Deactivated);
    assert!(!hue.is_error());
}

#[tokio::test]
async fn growing_adapter_update_list_notifies() {
    let telemetry = instance_tree();
    telemetry.insert_field(
        "admin.0.info.updatesJson",
        FieldState::new(
            r#"{"hue": {"availableVersion": "3.1.0", "installedVersion": "3.0.2"}}"#,
            Utc::now(),
        ),
    );
    let config = EngineConfig {
        check_adapter_updates: true,
        ..instance_config()
    };
    let mut h = harness(telemetry, config, Blacklist::default());
    h.engine.full_scan().await;

    assert_eq!(
        h.engine.instances().instances()["hue.0"].available_update.as_deref(),
        Some("3.1.0")
    );
    assert!(h.events().is_empty());

    h.set(
        "admin.0.info.updatesJson",
        r#"{"hue": {"availableVersion": "3.1.0", "installedVersion": "3.0.2"},
            "zigbee": {"availableVersion": "2.0.0", "installedVersion": "1.9.0"}}"#,
    )
    .await;
    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].category, EventCategory::AdapterUpdate);
    assert_eq!(
        h.sink.get("adapterAndInstances.countAdapterUpdates").await,
        Some(json!(2))
    );
}

#[tokio::test]
async fn rescan_keeps_pending_confirmation() {
    let mut h = harness(instance_tree(), instance_config(), Blacklist::default());
    h.engine.full_scan().await;

    h.set("system.adapter.hue.0.connected", false).await;
    assert_eq!(h.engine.instances().pending_timers(), 1);

    h.telemetry.set_object(
        "system.adapter.hue.0",
        ObjectMeta::named("hue")
            .with_attribute("mode", json!("daemon"))
            .with_attribute("version", json!("3.0.3")),
    );
    h.pump().await;

    let hue = &h.engine.instances().instances()["hue.0"];
    assert_eq!(hue.version.as_deref(), Some("3.0.3"));
    assert_eq!(hue.health, InstanceHealth::Healthy);
    assert_eq!(h.engine.instances().pending_timers(), 1);
    assert!(h.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rescan_does_not_shorten_confirmation() {
    let Harness {
        engine,
        telemetry,
        mut bus,
        ..
    } = harness(instance_tree(), instance_config(), Blacklist::default());

    let mut snapshot = engine.snapshot();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(engine.run(cancel.clone()));
    snapshot.changed().await.unwrap();

    telemetry.set_field("system.adapter.hue.0.connected", false, Utc::now());
    tokio::time::sleep(Duration::from_secs(30)).await;
    telemetry.set_object(
        "system.adapter.hue.0",
        ObjectMeta::named("hue").with_attribute("mode", json!("daemon")),
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(bus.try_recv().is_err());
    assert_eq!(
        snapshot.borrow().instances["hue.0"].health,
        InstanceHealth::Healthy
    );

    tokio::time::sleep(Duration::from_secs(91)).await;
    assert_eq!(bus.try_recv().unwrap().kind, EventKind::InstanceError);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn muted_instance_changes_health_silently() {
    let config = BlacklistConfig {
        instances: vec![InstanceBlacklistEntry {
            instance: "hue.0".into(),
            notify: true,
            ..Default::default()
        }],
        ..Default::default()
    };
    let (blacklist, errors) = Blacklist::from_config(&config);
    assert!(errors.is_empty());

    let Harness {
        engine,
        telemetry,
        mut bus,
        ..
    } = harness(instance_tree(), instance_config(), blacklist);

    let mut snapshot = engine.snapshot();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(engine.run(cancel.clone()));
    snapshot.changed().await.unwrap();

    telemetry.set_field("system.adapter.hue.0.connected", false, Utc::now());
    tokio::time::sleep(Duration::from_secs(122)).await;
    assert_eq!(
        snapshot.borrow().instances["hue.0"].health.kind(),
        HealthKind::Unhealthy
    );

    telemetry.set_field("system.adapter.hue.0.alive", false, Utc::now());
    tokio::time::sleep(Duration::from_secs(122)).await;
    assert_eq!(
        snapshot.borrow().instances["hue.0"].health,
        InstanceHealth::Deactivated
    );
    assert!(bus.try_recv().is_err());

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn overdue_scheduled_instance_is_deactivated() {
    let telemetry = MemoryTelemetry::new();
    telemetry.insert_object(
        "system.adapter.backup.0",
        ObjectMeta::named("backup")
            .with_attribute("mode", json!("schedule"))
            .with_attribute("schedule", json!("*/10 * * * *")),
    );
    let started = Utc::now();
    telemetry.insert_field("system.adapter.backup.0.alive", FieldState::new(true, started));
    let mut h = harness(Arc::new(telemetry), instance_config(), Blacklist::default());
    h.engine.full_scan().await;
    assert_eq!(
        h.engine.instances().instances()["backup.0"].health,
        InstanceHealth::Healthy
    );

    // The next run is still inside the tolerance window.
    h.engine.refresh_at(started + ChronoDuration::minutes(2)).await;
    assert!(h.events().is_empty());

    // Several runs have passed without a heartbeat.
    h.engine.refresh_at(started + ChronoDuration::hours(3)).await;
    let backup = &h.engine.instances().instances()["backup.0"];
    assert_eq!(backup.health, InstanceHealth::Deactivated);
    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::InstanceDeactivated);
    assert_eq!(events[0].identity, "backup.0");
}
