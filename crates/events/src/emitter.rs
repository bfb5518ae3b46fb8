//! Transition detection.
//!
//! [`HealthEventEmitter`] compares a record before and after a mutation and
//! produces the events worth notifying about. It never publishes by itself;
//! the engine hands the result to the [`EventBus`](crate::bus::EventBus).

use std::sync::Arc;

use chrono::Duration;
use fleetwatch_core::blacklist::Blacklist;
use fleetwatch_core::config::NotificationSettings;
use fleetwatch_core::projection::AdapterUpdate;
use fleetwatch_core::reachability::DeviceStatus;
use fleetwatch_core::record::{DeviceRecord, HealthKind, InstanceHealth, InstanceRecord};
use fleetwatch_core::{FieldState, Timestamp};
use serde_json::json;

use crate::bus::{EventCategory, EventKind, HealthEvent};

/// How long the instance device-connection must have been up before device
/// status flips are reported.
pub const SETTLE_WINDOW_SECS: i64 = 50;

/// Identity used for adapter update events.
pub const ADAPTER_UPDATES_IDENTITY: &str = "adapterUpdates";

/// `true` when the connection field reads truthy and last changed at least
/// [`SETTLE_WINDOW_SECS`] ago.
pub fn connection_settled(connection: Option<&FieldState>, now: Timestamp) -> bool {
    let Some(state) = connection else {
        return false;
    };
    let up = state.val.as_ref().is_some_and(|v| v.is_truthy());
    up && now.signed_duration_since(state.lc) >= Duration::seconds(SETTLE_WINDOW_SECS)
}

pub struct HealthEventEmitter {
    settings: NotificationSettings,
    blacklist: Arc<Blacklist>,
}

impl HealthEventEmitter {
    pub fn new(settings: NotificationSettings, blacklist: Arc<Blacklist>) -> Self {
        Self {
            settings,
            blacklist,
        }
    }

    /// Events for one device mutation. `connection` is the current state of
    /// the owning instance's device-connection field.
    pub fn device_events(
        &self,
        before: &DeviceRecord,
        after: &DeviceRecord,
        connection: Option<&FieldState>,
        now: Timestamp,
    ) -> Vec<HealthEvent> {
        if self.blacklist.mutes_device(&after.main_path) {
            return Vec::new();
        }
        let mut events = Vec::new();

        if self.settings.offline
            && before.status != after.status
            && connection_settled(connection, now)
        {
            let kind = match after.status {
                DeviceStatus::Online => EventKind::Online,
                DeviceStatus::Offline => EventKind::Offline,
            };
            events.push(device_event(kind, after, now));
        }

        if self.settings.low_battery && after.is_low_battery && !before.is_low_battery {
            events.push(device_event(EventKind::LowBattery, after, now));
        }

        if self.settings.device_updates
            && after.upgrade.is_available()
            && !before.upgrade.is_available()
        {
            events.push(device_event(EventKind::UpdateAvailable, after, now));
        }

        events
    }

    /// Event for a committed instance health change, if any.
    pub fn instance_event(
        &self,
        before: InstanceHealth,
        after: &InstanceRecord,
        now: Timestamp,
    ) -> Option<HealthEvent> {
        if self.blacklist.mutes_instance(&after.id) || before.kind() == after.health.kind() {
            return None;
        }
        let kind = match after.health.kind() {
            HealthKind::Healthy => return None,
            HealthKind::Unhealthy if self.settings.instance_errors => EventKind::InstanceError,
            HealthKind::Deactivated if self.settings.instance_deactivated => {
                EventKind::InstanceDeactivated
            }
            _ => return None,
        };
        Some(
            HealthEvent::new(EventCategory::Instance, kind, after.id.clone())
                .with_payload(json!({
                    "instance": after.id,
                    "adapter": after.adapter,
                    "status": after.status,
                }))
                .at(now),
        )
    }

    /// Event when the number of updatable adapters grew.
    pub fn adapter_update_event(
        &self,
        previous_count: usize,
        updates: &[AdapterUpdate],
        now: Timestamp,
    ) -> Option<HealthEvent> {
        if !self.settings.adapter_updates || updates.len() <= previous_count {
            return None;
        }
        let list: Vec<_> = updates
            .iter()
            .map(|u| json!({"adapter": u.adapter, "version": u.available_version}))
            .collect();
        Some(
            HealthEvent::new(
                EventCategory::AdapterUpdate,
                EventKind::UpdateAvailable,
                ADAPTER_UPDATES_IDENTITY,
            )
            .with_payload(json!({ "updates": list }))
            .at(now),
        )
    }
}

fn device_event(kind: EventKind, device: &DeviceRecord, now: Timestamp) -> HealthEvent {
    HealthEvent::new(EventCategory::Device, kind, device.main_path.clone())
        .with_payload(json!({
            "device": device.name,
            "adapter": device.adapter,
            "battery": device.battery.to_string(),
            "last_contact": device.last_contact.clone().unwrap_or_else(|| "-".into()),
            "status": device.status.to_string(),
        }))
        .at(now)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};
    use fleetwatch_core::blacklist::{BlacklistConfig, DeviceBlacklistEntry};
    use fleetwatch_core::record::{ExecutionMode, UnhealthyReason};
    use fleetwatch_core::update::UpgradeState;

    use super::*;

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn settled() -> FieldState {
        FieldState::new(true, now()).with_last_change(now() - Duration::minutes(5))
    }

    fn emitter() -> HealthEventEmitter {
        HealthEventEmitter::new(NotificationSettings::default(), Arc::new(Blacklist::default()))
    }

    fn device() -> DeviceRecord {
        let mut d = DeviceRecord::new(
            "zigbee.0.door",
            "zigbee.0.door.link_quality",
            "zigbee",
            "Zigbee",
            "zigbee.0",
        );
        d.name = "Door".into();
        d
    }

    #[test]
    fn status_flip_requires_settled_connection() {
        let before = device();
        let mut after = device();
        after.apply_status(DeviceStatus::Offline, Some("2 hours".into()));

        let events = emitter().device_events(&before, &after, Some(&settled()), now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Offline);
        assert_eq!(events[0].payload_str("last_contact"), "2 hours");

        let fresh = FieldState::new(true, now()).with_last_change(now() - Duration::seconds(10));
        assert!(emitter().device_events(&before, &after, Some(&fresh), now()).is_empty());
        assert!(emitter().device_events(&before, &after, None, now()).is_empty());
    }

    #[test]
    fn repeated_state_emits_nothing() {
        let mut a = device();
        a.is_low_battery = true;
        let b = a.clone();
        assert!(emitter().device_events(&a, &b, Some(&settled()), now()).is_empty());
    }

    #[test]
    fn low_battery_and_update_only_on_rising_edge() {
        let mut before = device();
        before.upgrade = UpgradeState::UpToDate;
        let mut after = before.clone();
        after.is_low_battery = true;
        after.upgrade = UpgradeState::Available;

        let kinds: Vec<EventKind> = emitter()
            .device_events(&before, &after, None, now())
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::LowBattery, EventKind::UpdateAvailable]);

        // Falling edges are silent.
        assert!(emitter().device_events(&after, &before, None, now()).is_empty());
    }

    #[test]
    fn muted_devices_and_disabled_toggles() {
        let (blacklist, _) = Blacklist::from_config(&BlacklistConfig {
            devices: vec![DeviceBlacklistEntry {
                device: "zigbee.0.door.link_quality".into(),
                notify: true,
                ..Default::default()
            }],
            ..Default::default()
        });
        let muted = HealthEventEmitter::new(NotificationSettings::default(), Arc::new(blacklist));
        let before = device();
        let mut after = device();
        after.is_low_battery = true;
        assert!(muted.device_events(&before, &after, None, now()).is_empty());

        let quiet = HealthEventEmitter::new(
            NotificationSettings {
                low_battery: false,
                ..Default::default()
            },
            Arc::new(Blacklist::default()),
        );
        assert!(quiet.device_events(&before, &after, None, now()).is_empty());
    }

    #[test]
    fn instance_transitions() {
        let mut record = InstanceRecord::new("hue.0", "Hue", ExecutionMode::Continuous);
        record.health = InstanceHealth::Unhealthy(UnhealthyReason::DeviceDisconnected);
        let event = emitter().instance_event(InstanceHealth::Healthy, &record, now());
        assert_matches!(event, Some(HealthEvent { kind: EventKind::InstanceError, .. }));

        record.health = InstanceHealth::Deactivated;
        let event = emitter().instance_event(InstanceHealth::Healthy, &record, now());
        assert_matches!(event, Some(HealthEvent { kind: EventKind::InstanceDeactivated, .. }));

        record.health = InstanceHealth::Healthy;
        assert!(emitter()
            .instance_event(InstanceHealth::Deactivated, &record, now())
            .is_none());
    }

    fn with_settings(settings: NotificationSettings) -> HealthEventEmitter {
        HealthEventEmitter::new(settings, Arc::new(Blacklist::default()))
    }

    #[test]
    fn error_toggle_leaves_deactivation_on() {
        let quiet = with_settings(NotificationSettings {
            instance_errors: false,
            ..Default::default()
        });
        let mut record = InstanceRecord::new("hue.0", "Hue", ExecutionMode::Continuous);
        record.health = InstanceHealth::Unhealthy(UnhealthyReason::HostDisconnected);
        assert!(quiet.instance_event(InstanceHealth::Healthy, &record, now()).is_none());

        record.health = InstanceHealth::Deactivated;
        let event = quiet.instance_event(InstanceHealth::Healthy, &record, now());
        assert_matches!(event, Some(HealthEvent { kind: EventKind::InstanceDeactivated, .. }));
    }

    #[test]
    fn deactivation_toggle_leaves_errors_on() {
        let quiet = with_settings(NotificationSettings {
            instance_deactivated: false,
            ..Default::default()
        });
        let mut record = InstanceRecord::new("hue.0", "Hue", ExecutionMode::Continuous);
        record.health = InstanceHealth::Deactivated;
        assert!(quiet.instance_event(InstanceHealth::Healthy, &record, now()).is_none());

        record.health = InstanceHealth::Unhealthy(UnhealthyReason::HostDisconnected);
        let event = quiet.instance_event(InstanceHealth::Deactivated, &record, now());
        assert_matches!(event, Some(HealthEvent { kind: EventKind::InstanceError, .. }));
    }

    #[test]
    fn adapter_updates_only_when_growing() {
        let updates = vec![AdapterUpdate {
            adapter: "Hue".into(),
            available_version: "3.1.0".into(),
            installed_version: "3.0.0".into(),
        }];
        assert!(emitter().adapter_update_event(0, &updates, now()).is_some());
        assert!(emitter().adapter_update_event(1, &updates, now()).is_none());
    }
}
