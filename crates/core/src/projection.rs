//! Read-only views over the record maps.
//!
//! A [`FleetSnapshot`] is what the engine publishes after every mutation.
//! The list builders here turn it into the counters and JSON lists written
//! through the state sink, globally and per source.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::battery::BatteryUnit;
use crate::blacklist::Blacklist;
use crate::record::{DeviceRecord, InstanceRecord};

/// Placeholder written into a list that has no rows.
pub const NONE_ROW: &str = "--none--";

/// One adapter with a newer version available on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterUpdate {
    /// Capitalized adapter name.
    pub adapter: String,
    pub available_version: String,
    pub installed_version: String,
}

/// Everything the engine knows at one point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetSnapshot {
    /// Keyed by device path.
    pub devices: BTreeMap<String, DeviceRecord>,
    /// Keyed by instance id.
    pub instances: BTreeMap<String, InstanceRecord>,
    /// Keyed by capitalized adapter name.
    pub adapter_updates: BTreeMap<String, AdapterUpdate>,
}

impl FleetSnapshot {
    /// Devices ordered by display name, then path.
    pub fn devices_sorted(&self) -> Vec<&DeviceRecord> {
        let mut devices: Vec<&DeviceRecord> = self.devices.values().collect();
        devices.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.device_path.cmp(&b.device_path))
        });
        devices
    }

    /// Source ids that currently own at least one device.
    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.values().map(|d| d.source_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

// ---------------------------------------------------------------------------
// Device lists
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRow {
    #[serde(rename = "Device")]
    pub device: String,
    #[serde(rename = "Adapter")]
    pub adapter: String,
    #[serde(rename = "Battery", skip_serializing_if = "Option::is_none")]
    pub battery: Option<String>,
    #[serde(rename = "Signal strength", skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(rename = "Last contact", skip_serializing_if = "Option::is_none")]
    pub last_contact: Option<String>,
    #[serde(rename = "Status", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl DeviceRow {
    fn base(device: &DeviceRecord) -> Self {
        Self {
            device: device.name.clone(),
            adapter: device.adapter.clone(),
            battery: None,
            signal: None,
            last_contact: None,
            status: None,
        }
    }

    fn full(device: &DeviceRecord) -> Self {
        Self {
            battery: Some(device.battery.to_string()),
            signal: Some(device.signal.to_string()),
            last_contact: Some(last_contact(device)),
            status: Some(device.status.to_string()),
            ..Self::base(device)
        }
    }
}

/// Untranslated row carrying every derived field, for machine consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawDeviceRow {
    #[serde(rename = "Device")]
    pub device: String,
    #[serde(rename = "Adapter")]
    pub adapter: String,
    #[serde(rename = "Instance")]
    pub instance: String,
    #[serde(rename = "Instance connected")]
    pub instance_connected: Option<bool>,
    #[serde(rename = "isBatteryDevice")]
    pub is_battery_device: bool,
    #[serde(rename = "Battery")]
    pub battery: String,
    #[serde(rename = "BatteryRaw")]
    pub battery_raw: Option<f64>,
    #[serde(rename = "BatteryUnitRaw")]
    pub battery_unit: Option<BatteryUnit>,
    #[serde(rename = "isLowBat")]
    pub is_low_battery: bool,
    #[serde(rename = "Signal strength")]
    pub signal: String,
    #[serde(rename = "Signal strength Raw")]
    pub signal_raw: Option<f64>,
    #[serde(rename = "Last contact")]
    pub last_contact: String,
    #[serde(rename = "Update Available")]
    pub update_available: bool,
    #[serde(rename = "Status")]
    pub status: String,
}

impl RawDeviceRow {
    fn from_record(device: &DeviceRecord) -> Self {
        Self {
            device: device.name.clone(),
            adapter: device.adapter.clone(),
            instance: device.instance.clone(),
            instance_connected: device.instance_connected,
            is_battery_device: device.is_battery_device,
            battery: device.battery.to_string(),
            battery_raw: device.battery_raw(),
            battery_unit: device.battery_unit(),
            is_low_battery: device.is_low_battery,
            signal: device.signal.to_string(),
            signal_raw: device.signal_raw,
            last_contact: last_contact(device),
            update_available: device.upgrade.is_available(),
            status: device.status.to_string(),
        }
    }
}

fn last_contact(device: &DeviceRecord) -> String {
    device.last_contact.clone().unwrap_or_else(|| "-".to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceLists {
    pub all: Vec<DeviceRow>,
    pub all_raw: Vec<RawDeviceRow>,
    pub link_quality: Vec<DeviceRow>,
    pub battery: Vec<DeviceRow>,
    pub low_battery: Vec<DeviceRow>,
    pub offline: Vec<DeviceRow>,
    pub upgradable: Vec<DeviceRow>,
}

impl DeviceLists {
    pub fn build<'a>(devices: impl IntoIterator<Item = &'a DeviceRecord>) -> Self {
        let mut lists = Self::default();
        for device in devices {
            lists.all.push(DeviceRow::full(device));
            lists.all_raw.push(RawDeviceRow::from_record(device));

            if device.signal.is_supported() {
                lists.link_quality.push(DeviceRow {
                    signal: Some(device.signal.to_string()),
                    ..DeviceRow::base(device)
                });
            }
            if device.is_battery_device {
                lists.battery.push(DeviceRow {
                    battery: Some(device.battery.to_string()),
                    status: Some(device.status.to_string()),
                    ..DeviceRow::base(device)
                });
            }
            if device.counts_as_low_battery() {
                lists.low_battery.push(DeviceRow {
                    battery: Some(device.battery.to_string()),
                    ..DeviceRow::base(device)
                });
            }
            if device.is_offline() {
                lists.offline.push(DeviceRow {
                    last_contact: Some(last_contact(device)),
                    ..DeviceRow::base(device)
                });
            }
            if device.upgrade.is_available() {
                lists.upgradable.push(DeviceRow::base(device));
            }
        }
        lists
    }

    /// Global view: list-blacklisted devices are left out.
    pub fn global(snapshot: &FleetSnapshot, blacklist: &Blacklist) -> Self {
        Self::build(
            snapshot
                .devices_sorted()
                .into_iter()
                .filter(|d| !blacklist.hides_device(&d.main_path)),
        )
    }

    /// View of one source, honouring the per-source blacklist.
    pub fn for_source(snapshot: &FleetSnapshot, blacklist: &Blacklist, source_id: &str) -> Self {
        Self::build(
            snapshot
                .devices_sorted()
                .into_iter()
                .filter(|d| d.source_id == source_id)
                .filter(|d| !blacklist.hides_device_in_source(&d.main_path)),
        )
    }

    /// State keys below `prefix` (`devices` or `devices.<source>`).
    pub fn entries(&self, prefix: &str) -> Vec<(String, Value)> {
        let key = |name: &str| format!("{prefix}.{name}");
        vec![
            (key("offlineCount"), json!(self.offline.len())),
            (key("countAll"), json!(self.all.len())),
            (key("batteryCount"), json!(self.battery.len())),
            (key("lowBatteryCount"), json!(self.low_battery.len())),
            (key("upgradableCount"), json!(self.upgradable.len())),
            (key("listAll"), rows_or_none(&self.all, "Device")),
            (key("listAllRawJSON"), rows_or_none(&self.all_raw, "Device")),
            (key("linkQualityList"), rows_or_none(&self.link_quality, "Device")),
            (key("offlineList"), rows_or_none(&self.offline, "Device")),
            (key("upgradableList"), rows_or_none(&self.upgradable, "Device")),
            (key("batteryList"), rows_or_none(&self.battery, "Device")),
            (key("lowBatteryList"), rows_or_none(&self.low_battery, "Device")),
            (key("oneDeviceOffline"), json!(!self.offline.is_empty())),
            (key("oneDeviceLowBat"), json!(!self.low_battery.is_empty())),
            (key("oneDeviceUpdatable"), json!(!self.upgradable.is_empty())),
        ]
    }
}

// ---------------------------------------------------------------------------
// Instance lists
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceRow {
    #[serde(rename = "Adapter")]
    pub adapter: String,
    #[serde(rename = "Instance")]
    pub instance: String,
    #[serde(rename = "Mode", skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(rename = "Schedule", skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(rename = "Version", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "Updateable", skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,
    #[serde(rename = "Status")]
    pub status: String,
}

impl InstanceRow {
    fn base(instance: &InstanceRecord) -> Self {
        Self {
            adapter: instance.adapter.clone(),
            instance: instance.id.clone(),
            mode: None,
            schedule: None,
            version: None,
            update: None,
            status: instance.status.clone(),
        }
    }
}

fn dash(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| "-".to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterUpdateRow {
    #[serde(rename = "Adapter")]
    pub adapter: String,
    #[serde(rename = "Available Version")]
    pub available_version: String,
    #[serde(rename = "Installed Version")]
    pub installed_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstanceLists {
    pub all: Vec<InstanceRow>,
    pub active: Vec<InstanceRow>,
    pub deactivated: Vec<InstanceRow>,
    pub error: Vec<InstanceRow>,
    pub adapter_updates: Vec<AdapterUpdateRow>,
}

impl InstanceLists {
    pub fn build(snapshot: &FleetSnapshot, blacklist: &Blacklist) -> Self {
        let mut lists = Self::default();

        for instance in snapshot
            .instances
            .values()
            .filter(|i| !blacklist.hides_instance(&i.id))
        {
            let mode = instance.mode.to_string();
            lists.all.push(InstanceRow {
                mode: Some(mode.clone()),
                schedule: Some(dash(&instance.schedule)),
                version: Some(dash(&instance.version)),
                update: Some(dash(&instance.available_update)),
                ..InstanceRow::base(instance)
            });

            if instance.is_alive() {
                lists.active.push(InstanceRow {
                    mode: Some(mode.clone()),
                    schedule: Some(dash(&instance.schedule)),
                    ..InstanceRow::base(instance)
                });
            } else {
                lists.deactivated.push(InstanceRow::base(instance));
            }

            if instance.is_error() {
                lists.error.push(InstanceRow {
                    mode: Some(mode),
                    ..InstanceRow::base(instance)
                });
            }
        }

        lists.adapter_updates = snapshot
            .adapter_updates
            .values()
            .map(|u| AdapterUpdateRow {
                adapter: u.adapter.clone(),
                available_version: u.available_version.clone(),
                installed_version: u.installed_version.clone(),
            })
            .collect();

        lists
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        let key = |name: &str| format!("adapterAndInstances.{name}");
        vec![
            (key("listAllInstances"), rows_or_none(&self.all, "Adapter")),
            (key("countAllInstances"), json!(self.all.len())),
            (key("listAllActiveInstances"), rows_or_none(&self.active, "Adapter")),
            (key("countAllActiveInstances"), json!(self.active.len())),
            (key("listDeactivatedInstances"), rows_or_none(&self.deactivated, "Adapter")),
            (key("countDeactivatedInstances"), json!(self.deactivated.len())),
            (key("listInstancesError"), rows_or_none(&self.error, "Adapter")),
            (key("countInstancesError"), json!(self.error.len())),
            (key("listAdapterUpdates"), rows_or_none(&self.adapter_updates, "Adapter")),
            (key("countAdapterUpdates"), json!(self.adapter_updates.len())),
        ]
    }
}

/// Serialize `rows`, or a single placeholder row keyed by `lead` when empty.
fn rows_or_none<T: Serialize>(rows: &[T], lead: &str) -> Value {
    if rows.is_empty() {
        return json!([{ lead: NONE_ROW }]);
    }
    serde_json::to_value(rows).unwrap_or_else(|_| json!([{ lead: NONE_ROW }]))
}

// ---------------------------------------------------------------------------
// Full projection
// ---------------------------------------------------------------------------

/// Every state key derived from `snapshot`, in write order.
pub fn state_entries(
    snapshot: &FleetSnapshot,
    blacklist: &Blacklist,
    per_source: bool,
    with_instances: bool,
) -> Vec<(String, Value)> {
    let mut entries = DeviceLists::global(snapshot, blacklist).entries("devices");
    if per_source {
        for source_id in snapshot.source_ids() {
            let lists = DeviceLists::for_source(snapshot, blacklist, &source_id);
            entries.extend(lists.entries(&format!("devices.{source_id}")));
        }
    }
    if with_instances {
        entries.extend(InstanceLists::build(snapshot, blacklist).entries());
    }
    entries
}

// ---------------------------------------------------------------------------
// Choice lists
// ---------------------------------------------------------------------------

/// A `label`/`value` pair for configuration pickers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Choice {
    pub label: String,
    pub value: String,
}

/// Devices as `<adapter>: <name>` keyed by their main selector path.
pub fn device_choices(snapshot: &FleetSnapshot) -> Vec<Choice> {
    let mut choices: Vec<Choice> = snapshot
        .devices
        .values()
        .map(|d| Choice {
            label: format!("{}: {}", d.adapter, d.name),
            value: d.main_path.clone(),
        })
        .collect();
    choices.sort_by(|a, b| a.label.cmp(&b.label));
    choices
}

pub fn instance_choices(snapshot: &FleetSnapshot) -> Vec<Choice> {
    let mut choices: Vec<Choice> = snapshot
        .instances
        .values()
        .map(|i| Choice {
            label: i.id.clone(),
            value: i.id.clone(),
        })
        .collect();
    choices.sort_by(|a, b| a.label.cmp(&b.label));
    choices
}
