//! Per-source decision strategies.
//!
//! Each source id maps to one [`SourceStrategy`]. The trait's default methods
//! carry the behavior shared by most sources; [`Generic`] tweaks them through
//! a handful of rule knobs, while Homematic classic and the Alexa presence
//! check override whole decisions.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::battery::{self, BatteryInputs, BatteryReading, BatteryRegime};
use crate::profile::{join, DevicePaths, SourceProfile};
use crate::reachability::{
    self, Elapsed, LastContactBasis, ReachabilityInputs, ReachabilityRule, UnreachTest, Verdict,
};
use crate::signal::{self, SignalReading, SignalRule};
use crate::types::{FieldValue, Timestamp};
use crate::update::{self, UpdateRule, UpgradeState};

// ---------------------------------------------------------------------------
// Display names
// ---------------------------------------------------------------------------

/// Where a device's display name comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamePlan {
    /// The profile's name field, falling back to the device object's name.
    #[default]
    Field,
    /// Both name fields joined by a space.
    FieldPair,
    ParentObject,
    GrandparentObject,
    /// `I<parent folder> <name field under parent>`.
    FolderAndId,
    DeviceFolder,
    ParentFolder,
    /// Device object name with counters and quotes stripped.
    CleanedObject,
}

static COUNTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\d+\)").expect("valid regex"));

/// Tidy an object name such as `'Cat Flap (12)' Device` into `Cat Flap Device -`.
pub fn clean_object_name(name: &str) -> String {
    let stripped = name.replace('\'', "");
    let stripped = COUNTER_RE.replace_all(&stripped, "");
    stripped
        .trim()
        .replacen("Hub", "Hub -", 1)
        .replacen("Device", "Device -", 1)
}

// ---------------------------------------------------------------------------
// Field path chains
// ---------------------------------------------------------------------------

/// Candidate paths per field, in lookup order. The first path that holds a
/// value wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldChains {
    pub signal: Vec<String>,
    pub battery: Vec<String>,
    pub low_bat: Vec<String>,
    pub fault: Option<String>,
    pub charger: Option<String>,
    pub unreach: Vec<String>,
    pub state: Option<String>,
    pub peer: Option<String>,
    pub time: Vec<String>,
    pub upgrade: Vec<String>,
}

fn under(base: &str, suffixes: &[&Option<String>]) -> Vec<String> {
    suffixes
        .iter()
        .filter_map(|s| s.as_deref())
        .map(|s| join(base, s))
        .collect()
}

fn at_levels(levels: &[&str], suffix: &Option<String>) -> Vec<String> {
    match suffix {
        Some(s) => levels
            .iter()
            .filter(|l| !l.is_empty())
            .map(|l| join(l, s))
            .collect(),
        None => Vec::new(),
    }
}

/// Where the battery fields of a source live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatteryLocation {
    #[default]
    Device,
    /// One level up, only `battery` and `battery2`.
    Parent,
}

/// Where the signal field of a source lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalLocation {
    #[default]
    Device,
    Parent,
    /// Device `rssi`, then device `rf`.
    DeviceThenRf,
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

pub trait SourceStrategy: Send + Sync + fmt::Debug {
    fn signal_rule(&self) -> SignalRule {
        SignalRule::Dbm
    }

    fn signal_location(&self) -> SignalLocation {
        SignalLocation::Device
    }

    fn battery_regime(&self) -> BatteryRegime {
        BatteryRegime::Percent
    }

    fn battery_location(&self) -> BatteryLocation {
        BatteryLocation::Device
    }

    fn update_rule(&self) -> UpdateRule {
        UpdateRule::Flag
    }

    fn reachability_rule(&self) -> ReachabilityRule {
        ReachabilityRule::Stale
    }

    fn last_contact_basis(&self) -> LastContactBasis {
        LastContactBasis::Standard
    }

    fn name_plan(&self) -> NamePlan {
        NamePlan::Field
    }

    fn normalize_signal(&self, value: Option<&FieldValue>, passthrough: bool) -> SignalReading {
        signal::normalize_signal(value, self.signal_rule(), passthrough)
    }

    fn battery(&self, inputs: BatteryInputs<'_>) -> BatteryReading {
        battery::battery_reading(self.battery_regime(), inputs)
    }

    fn is_low_battery(&self, inputs: BatteryInputs<'_>, min_percent: f64) -> bool {
        battery::is_low_battery(self.battery_regime(), inputs, min_percent)
    }

    fn resolve_update(&self, value: Option<&FieldValue>) -> UpgradeState {
        update::resolve_update(self.update_rule(), value)
    }

    fn decide_reachability(
        &self,
        inputs: &ReachabilityInputs<'_>,
        now: Timestamp,
        max_minutes: i64,
    ) -> Verdict {
        let elapsed = Elapsed::measure(now, inputs);
        reachability::decide(self.reachability_rule(), inputs, elapsed, max_minutes)
    }

    fn last_contact(&self, inputs: &ReachabilityInputs<'_>) -> Option<Timestamp> {
        let test = match self.reachability_rule() {
            ReachabilityRule::Unreachable(test) => Some(test),
            _ => None,
        };
        reachability::last_contact_basis(self.last_contact_basis(), test, inputs)
    }

    /// Candidate field paths of one device.
    fn field_chains(&self, profile: &SourceProfile, at: &DevicePaths) -> FieldChains {
        let device = at.device.as_str();
        let parent = at.parent.as_str();

        let signal = match self.signal_location() {
            SignalLocation::Device => under(device, &[&profile.rssi]),
            SignalLocation::Parent => under(parent, &[&profile.rssi]),
            SignalLocation::DeviceThenRf => under(device, &[&profile.rssi, &profile.rf]),
        };
        let battery = match self.battery_location() {
            BatteryLocation::Device => {
                under(device, &[&profile.battery, &profile.battery2, &profile.battery3])
            }
            BatteryLocation::Parent => under(parent, &[&profile.battery, &profile.battery2]),
        };

        FieldChains {
            signal,
            battery,
            low_bat: under(device, &[&profile.low_bat, &profile.low_bat2, &profile.low_bat3]),
            fault: under(parent, &[&profile.fault_reporting]).pop(),
            charger: under(device, &[&profile.charger]).pop(),
            unreach: at_levels(&[device, parent], &profile.reach),
            state: under(parent, &[&profile.state_value]).pop(),
            peer: under(device, &[&profile.rssi_peer]).pop(),
            time: at_levels(&[device, parent], &profile.time),
            upgrade: at_levels(&[device, parent, at.grandparent.as_str()], &profile.upgrade),
        }
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Shared behavior with optional per-source rule knobs.
#[derive(Debug, Clone, Default)]
pub struct Generic {
    signal: SignalRule,
    signal_location: SignalLocation,
    battery_location: BatteryLocation,
    update: UpdateRule,
    reachability: ReachabilityRule,
    name: NamePlan,
}

impl Generic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(mut self, rule: SignalRule) -> Self {
        self.signal = rule;
        self
    }

    pub fn signal_at(mut self, location: SignalLocation) -> Self {
        self.signal_location = location;
        self
    }

    pub fn battery_at(mut self, location: BatteryLocation) -> Self {
        self.battery_location = location;
        self
    }

    pub fn update(mut self, rule: UpdateRule) -> Self {
        self.update = rule;
        self
    }

    pub fn unreachable_when(mut self, test: UnreachTest) -> Self {
        self.reachability = ReachabilityRule::Unreachable(test);
        self
    }

    pub fn named(mut self, plan: NamePlan) -> Self {
        self.name = plan;
        self
    }
}

impl SourceStrategy for Generic {
    fn signal_rule(&self) -> SignalRule {
        self.signal
    }

    fn signal_location(&self) -> SignalLocation {
        self.signal_location
    }

    fn battery_location(&self) -> BatteryLocation {
        self.battery_location
    }

    fn update_rule(&self) -> UpdateRule {
        self.update
    }

    fn reachability_rule(&self) -> ReachabilityRule {
        self.reachability
    }

    fn name_plan(&self) -> NamePlan {
        self.name
    }
}

/// Homematic classic: voltage battery regime, fault reporting on the device
/// root channel and a numeric UNREACH flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct Homematic;

impl SourceStrategy for Homematic {
    fn battery_regime(&self) -> BatteryRegime {
        BatteryRegime::Voltage
    }

    fn reachability_rule(&self) -> ReachabilityRule {
        ReachabilityRule::Unreachable(UnreachTest::One)
    }

    fn last_contact_basis(&self) -> LastContactBasis {
        LastContactBasis::RadioFallback
    }

    fn name_plan(&self) -> NamePlan {
        NamePlan::ParentObject
    }

    fn field_chains(&self, profile: &SourceProfile, at: &DevicePaths) -> FieldChains {
        let mut chains = Generic::new().field_chains(profile, at);
        chains.battery = under(&at.device, &[&profile.battery]);
        chains
            .battery
            .extend(under(&at.parent, &[&profile.hm_dn_battery]));
        chains.battery.dedup();
        chains
    }
}

/// Echo devices briefly report offline; every offline verdict is re-read.
#[derive(Debug, Clone, Copy, Default)]
pub struct Alexa;

impl SourceStrategy for Alexa {
    fn reachability_rule(&self) -> ReachabilityRule {
        ReachabilityRule::Confirmed
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

const REACHABLE_FLAG: UnreachTest = UnreachTest::Falsy;

/// Source id to strategy. Unknown ids resolve to the shared defaults.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<&'static str, Arc<dyn SourceStrategy>>,
    fallback: Arc<dyn SourceStrategy>,
}

impl StrategyRegistry {
    pub fn builtin() -> Self {
        let mut strategies: HashMap<&'static str, Arc<dyn SourceStrategy>> = HashMap::new();
        let mut add = |id: &'static str, strategy: Generic| {
            strategies.insert(id, Arc::new(strategy));
        };

        // Sources with an explicit reachable flag.
        for id in [
            "apcups",
            "deconz",
            "hue",
            "ping",
            "shelly",
            "tradfri",
            "unifi",
            "zigbee",
            "zigbee2MQTT",
        ] {
            add(id, Generic::new().unreachable_when(REACHABLE_FLAG));
        }
        add(
            "hueExt",
            Generic::new()
                .unreachable_when(REACHABLE_FLAG)
                .battery_at(BatteryLocation::Parent)
                .named(NamePlan::ParentObject),
        );
        add(
            "sonoff",
            Generic::new()
                .unreachable_when(REACHABLE_FLAG)
                .signal(SignalRule::Percent),
        );

        add(
            "hmiP",
            Generic::new()
                .unreachable_when(UnreachTest::Truthy)
                .update(UpdateRule::StateText)
                .named(NamePlan::GrandparentObject),
        );
        add("maxcube", Generic::new().unreachable_when(UnreachTest::Truthy));
        add(
            "proxmox",
            Generic::new().unreachable_when(UnreachTest::NotAnyOf(&["running", "online"])),
        );
        add(
            "mqttClientZigbee2Mqtt",
            Generic::new().unreachable_when(UnreachTest::NotAnyOf(&["online"])),
        );
        add(
            "smartgarden",
            Generic::new()
                .unreachable_when(UnreachTest::Text("OFFLINE"))
                .signal(SignalRule::Percent),
        );

        add("roomba", Generic::new().signal(SignalRule::Percent).named(NamePlan::FolderAndId));
        add(
            "mihomeVacuum",
            Generic::new()
                .signal_at(SignalLocation::Parent)
                .battery_at(BatteryLocation::Parent)
                .named(NamePlan::FolderAndId),
        );
        add("lupusec", Generic::new().signal(SignalRule::Passthrough));
        add(
            "fullybrowserV3",
            Generic::new()
                .signal(SignalRule::Passthrough)
                .named(NamePlan::DeviceFolder),
        );
        add("fullybrowser", Generic::new().named(NamePlan::FieldPair));
        add(
            "netatmo",
            Generic::new()
                .signal(SignalRule::TextPassthrough)
                .signal_at(SignalLocation::DeviceThenRf),
        );
        add(
            "nukiExt",
            Generic::new()
                .signal(SignalRule::Unsupported)
                .named(NamePlan::ParentObject),
        );
        add(
            "mqttNuki",
            Generic::new()
                .signal(SignalRule::TextDbm)
                .battery_at(BatteryLocation::Parent)
                .named(NamePlan::ParentObject),
        );
        add(
            "loqedSmartLock",
            Generic::new()
                .battery_at(BatteryLocation::Parent)
                .named(NamePlan::ParentObject),
        );
        add(
            "ring",
            Generic::new()
                .update(UpdateRule::FirmwareStatus)
                .named(NamePlan::ParentObject),
        );
        for id in ["wled", "viessmann", "homekitController"] {
            add(id, Generic::new().named(NamePlan::ParentObject));
        }
        for id in ["tado", "wifilight"] {
            add(id, Generic::new().named(NamePlan::DeviceFolder));
        }
        add("yeelight", Generic::new().named(NamePlan::ParentFolder));
        add("sureflap", Generic::new().named(NamePlan::CleanedObject));

        strategies.insert("hmrpc", Arc::new(Homematic));
        strategies.insert("alexa2", Arc::new(Alexa));

        Self {
            strategies,
            fallback: Arc::new(Generic::new()),
        }
    }

    pub fn get(&self, source_id: &str) -> Arc<dyn SourceStrategy> {
        self.strategies
            .get(source_id)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn is_specialized(&self, source_id: &str) -> bool {
        self.strategies.contains_key(source_id)
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
