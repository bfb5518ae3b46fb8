//! Canonical device and instance records.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::battery::{BatteryHealth, BatteryReading, BatteryUnit};
use crate::reachability::DeviceStatus;
use crate::signal::{SignalQuality, SignalReading};
use crate::types::{FieldValue, Timestamp};
use crate::update::UpgradeState;

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Field paths a device record was built from. Incremental updates route on
/// these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceFieldPaths {
    pub signal: Option<String>,
    pub battery: Option<String>,
    pub low_bat: Option<String>,
    pub fault: Option<String>,
    pub charger: Option<String>,
    pub unreach: Option<String>,
    pub state: Option<String>,
    pub peer: Option<String>,
    pub time: Option<String>,
    pub update: Option<String>,
    pub instance_connection: String,
}

impl DeviceFieldPaths {
    /// Every path the record depends on.
    pub fn all(&self) -> impl Iterator<Item = &str> {
        [
            &self.signal,
            &self.battery,
            &self.low_bat,
            &self.fault,
            &self.charger,
            &self.unreach,
            &self.state,
            &self.peer,
            &self.time,
            &self.update,
        ]
        .into_iter()
        .filter_map(|p| p.as_deref())
        .chain(std::iter::once(self.instance_connection.as_str()))
    }
}

/// Which derived dimension a field path feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldRole {
    InstanceConnection,
    Update,
    Signal,
    Battery,
    LowBattery,
    Fault,
    Unreach,
    Time,
    State,
    Peer,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    /// Device path (matched selector without its last segment); the key.
    pub device_path: String,
    /// The matched selector path.
    pub main_path: String,
    pub name: String,
    pub source_id: String,
    /// Display name of the source.
    pub adapter: String,
    /// Owning source instance, `<adapter>.<n>`.
    pub instance: String,
    pub paths: DeviceFieldPaths,

    pub signal: SignalQuality,
    pub signal_raw: Option<f64>,
    /// Signal as computed from the last reading, before offline forcing.
    #[serde(skip)]
    pub signal_computed: SignalQuality,

    pub battery: BatteryHealth,
    pub is_battery_device: bool,
    pub is_low_battery: bool,

    pub status: DeviceStatus,
    pub last_contact: Option<String>,
    pub upgrade: UpgradeState,

    #[serde(skip)]
    pub unreach_value: Option<FieldValue>,
    #[serde(skip)]
    pub low_bat_value: Option<FieldValue>,
    #[serde(skip)]
    pub fault_value: Option<FieldValue>,

    /// Whether the owning instance is connected to its devices. `None` while
    /// unknown.
    pub instance_connected: Option<bool>,
}

impl DeviceRecord {
    pub fn new(
        device_path: impl Into<String>,
        main_path: impl Into<String>,
        source_id: impl Into<String>,
        adapter: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        let instance = instance.into();
        Self {
            device_path: device_path.into(),
            main_path: main_path.into(),
            name: String::new(),
            source_id: source_id.into(),
            adapter: adapter.into(),
            paths: DeviceFieldPaths {
                instance_connection: format!("{instance}.info.connection"),
                ..Default::default()
            },
            instance,
            signal: SignalQuality::Unsupported,
            signal_raw: None,
            signal_computed: SignalQuality::Unsupported,
            battery: BatteryHealth::Unknown,
            is_battery_device: false,
            is_low_battery: false,
            status: DeviceStatus::Online,
            last_contact: None,
            upgrade: UpgradeState::Unknown,
            unreach_value: None,
            low_bat_value: None,
            fault_value: None,
            instance_connected: None,
        }
    }

    /// Roles `path` plays for this record. One path may feed several
    /// dimensions (a source whose signal field doubles as its time field).
    pub fn roles_of(&self, path: &str) -> Vec<FieldRole> {
        let p = &self.paths;
        let mut roles = Vec::new();
        if p.instance_connection == path {
            roles.push(FieldRole::InstanceConnection);
        }
        for (candidate, role) in [
            (&p.update, FieldRole::Update),
            (&p.signal, FieldRole::Signal),
            (&p.battery, FieldRole::Battery),
            (&p.low_bat, FieldRole::LowBattery),
            (&p.fault, FieldRole::Fault),
            (&p.unreach, FieldRole::Unreach),
            (&p.time, FieldRole::Time),
            (&p.state, FieldRole::State),
            (&p.peer, FieldRole::Peer),
        ] {
            if candidate.as_deref() == Some(path) {
                roles.push(role);
            }
        }
        roles
    }

    /// Store a fresh signal reading, keeping offline forcing in place.
    pub fn apply_signal(&mut self, reading: SignalReading) {
        self.signal_raw = reading.raw;
        self.signal_computed = reading.quality;
        self.signal = match self.status {
            DeviceStatus::Offline => self.signal_computed.forced_offline(),
            DeviceStatus::Online => self.signal_computed.clone(),
        };
    }

    pub fn apply_battery(&mut self, reading: BatteryReading, is_low: bool) {
        self.battery = reading.health;
        self.is_battery_device = reading.is_battery_device;
        self.is_low_battery = reading.is_battery_device && is_low;
    }

    /// Store a reachability verdict. Offline forces a reported signal to `0%`;
    /// Online restores the last computed quality.
    pub fn apply_status(&mut self, status: DeviceStatus, last_contact: Option<String>) {
        self.status = status;
        if last_contact.is_some() {
            self.last_contact = last_contact;
        }
        self.signal = match status {
            DeviceStatus::Offline => self.signal_computed.forced_offline(),
            DeviceStatus::Online => self.signal_computed.clone(),
        };
    }

    pub fn battery_raw(&self) -> Option<f64> {
        match self.battery {
            BatteryHealth::Level { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn battery_unit(&self) -> Option<BatteryUnit> {
        match self.battery {
            BatteryHealth::Level { unit, .. } => Some(unit),
            _ => None,
        }
    }

    pub fn is_offline(&self) -> bool {
        self.status == DeviceStatus::Offline
    }

    /// Low battery counts only while the device is reachable.
    pub fn counts_as_low_battery(&self) -> bool {
        self.is_low_battery && !self.is_offline()
    }
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Long-running process (`daemon`).
    Continuous,
    /// Started by cron (`schedule`).
    Scheduled,
    Other(String),
}

impl ExecutionMode {
    pub fn from_mode(mode: &str) -> Self {
        match mode {
            "daemon" => ExecutionMode::Continuous,
            "schedule" => ExecutionMode::Scheduled,
            other => ExecutionMode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Continuous => f.write_str("daemon"),
            ExecutionMode::Scheduled => f.write_str("schedule"),
            ExecutionMode::Other(mode) => f.write_str(mode),
        }
    }
}

impl Serialize for ExecutionMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhealthyReason {
    HostDisconnected,
    DeviceDisconnected,
}

/// Committed health of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum InstanceHealth {
    Healthy,
    /// Running, but not connected.
    Unhealthy(UnhealthyReason),
    Deactivated,
}

/// Health without the reason; debounce compares on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthKind {
    Healthy,
    Unhealthy,
    Deactivated,
}

impl InstanceHealth {
    pub fn kind(self) -> HealthKind {
        match self {
            InstanceHealth::Healthy => HealthKind::Healthy,
            InstanceHealth::Unhealthy(_) => HealthKind::Unhealthy,
            InstanceHealth::Deactivated => HealthKind::Deactivated,
        }
    }

    pub fn is_alive(self) -> bool {
        !matches!(self, InstanceHealth::Deactivated)
    }

    pub fn is_healthy(self) -> bool {
        matches!(self, InstanceHealth::Healthy)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    /// `<adapter>.<n>`.
    pub id: String,
    pub adapter: String,
    pub mode: ExecutionMode,
    pub schedule: Option<String>,
    pub version: Option<String>,
    pub available_update: Option<String>,

    pub health: InstanceHealth,
    pub status: String,
    pub connected_host: bool,
    pub connected_device: bool,

    #[serde(skip)]
    pub heartbeat: Option<bool>,
    #[serde(skip)]
    pub host: Option<bool>,
    #[serde(skip)]
    pub device: Option<bool>,
    #[serde(skip)]
    pub heartbeat_changed: Option<Timestamp>,
}

impl InstanceRecord {
    pub fn new(id: impl Into<String>, adapter: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            id: id.into(),
            adapter: adapter.into(),
            mode,
            schedule: None,
            version: None,
            available_update: None,
            health: InstanceHealth::Deactivated,
            status: String::new(),
            connected_host: false,
            connected_device: false,
            heartbeat: None,
            host: None,
            device: None,
            heartbeat_changed: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// Alive but not healthy.
    pub fn is_error(&self) -> bool {
        self.is_alive() && !self.is_healthy()
    }

    pub fn heartbeat_path(&self) -> String {
        format!("system.adapter.{}.alive", self.id)
    }

    pub fn host_path(&self) -> String {
        format!("system.adapter.{}.connected", self.id)
    }

    pub fn device_path(&self) -> String {
        format!("{}.info.connection", self.id)
    }
}
