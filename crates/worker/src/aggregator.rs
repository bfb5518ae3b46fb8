//! Device aggregation.
//!
//! [`DeviceAggregator`] discovers devices by matching every enabled source's
//! selector, resolves their field paths, derives the canonical
//! [`DeviceRecord`] and keeps it current as fields change.
//!
//! A candidate chain resolves to its first field that exists, or to the last
//! candidate when none does so the path can still be subscribed and routed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use fleetwatch_core::battery::BatteryInputs;
use fleetwatch_core::config::EngineConfig;
use fleetwatch_core::profile::{join, last_segment, DevicePaths, SourceProfile, SourceRegistry};
use fleetwatch_core::reachability::{confirm_offline, format_last_contact, ReachabilityInputs, Verdict};
use fleetwatch_core::record::FieldRole;
use fleetwatch_core::strategy::{clean_object_name, NamePlan, SourceStrategy, StrategyRegistry};
use fleetwatch_core::update::UpgradeState;
use fleetwatch_core::{DeviceRecord, FieldState, FieldValue, Timestamp};

use crate::transport::{Telemetry, TransportError};

/// A device record before and after one mutation.
#[derive(Debug, Clone)]
pub struct DeviceChange {
    pub before: DeviceRecord,
    pub after: DeviceRecord,
}

pub struct DeviceAggregator {
    sources: Arc<SourceRegistry>,
    strategies: StrategyRegistry,
    config: Arc<EngineConfig>,
    devices: BTreeMap<String, DeviceRecord>,
    /// Field path to the device paths depending on it.
    index: HashMap<String, BTreeSet<String>>,
    /// Device paths left out by the battery-only filter.
    skipped: BTreeSet<String>,
}

impl DeviceAggregator {
    pub fn new(
        sources: Arc<SourceRegistry>,
        strategies: StrategyRegistry,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            sources,
            strategies,
            config,
            devices: BTreeMap::new(),
            index: HashMap::new(),
            skipped: BTreeSet::new(),
        }
    }

    pub fn devices(&self) -> &BTreeMap<String, DeviceRecord> {
        &self.devices
    }

    pub fn get(&self, device_path: &str) -> Option<&DeviceRecord> {
        self.devices.get(device_path)
    }

    /// `true` when the last scan saw `device_path`, kept or skipped.
    pub fn is_known(&self, device_path: &str) -> bool {
        self.devices.contains_key(device_path) || self.skipped.contains(device_path)
    }

    pub fn selector_of(&self, source_id: &str) -> Option<&str> {
        self.sources.get(source_id).map(|p| p.selector.as_str())
    }

    /// `true` when some record depends on `path`.
    pub fn watches(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    /// `true` when `path` matches the selector of an enabled source.
    pub fn matches_selector(&self, path: &str) -> bool {
        self.enabled_profiles().any(|profile| {
            crate::transport::glob_to_regex(&profile.selector)
                .map(|re| re.is_match(path))
                .unwrap_or(false)
        })
    }

    fn enabled_profiles(&self) -> impl Iterator<Item = &SourceProfile> {
        self.sources
            .iter()
            .filter(|profile| self.config.is_enabled(&profile.id))
    }

    /// Rebuild every record of every enabled source. Returns the changes
    /// against the previous records; new devices compare against themselves.
    pub async fn scan_all(&mut self, telemetry: &dyn Telemetry, now: Timestamp) -> Vec<DeviceChange> {
        let profiles: Vec<SourceProfile> = self.enabled_profiles().cloned().collect();
        let mut changes = Vec::new();
        let mut seen = BTreeSet::new();
        self.skipped.clear();

        for profile in &profiles {
            match self.scan_source(telemetry, profile, now, &mut seen).await {
                Ok(mut source_changes) => changes.append(&mut source_changes),
                Err(e) => {
                    tracing::error!(source = %profile.id, error = %e, "Source scan failed");
                }
            }
        }

        // Devices that no longer match any selector.
        let stale: Vec<String> = self
            .devices
            .keys()
            .filter(|path| !seen.contains(*path))
            .cloned()
            .collect();
        for path in stale {
            self.drop_record(&path);
        }

        tracing::debug!(devices = self.devices.len(), "Device scan complete");
        changes
    }

    async fn scan_source(
        &mut self,
        telemetry: &dyn Telemetry,
        profile: &SourceProfile,
        now: Timestamp,
        seen: &mut BTreeSet<String>,
    ) -> Result<Vec<DeviceChange>, TransportError> {
        let matches = telemetry.list_matching(&profile.selector).await?;
        let mut changes = Vec::new();

        for main in matches {
            let Some(at) = DevicePaths::from_match(&main) else {
                continue;
            };
            let record = match self.build_record(telemetry, profile, &at, now).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(device = %at.device, error = %e, "Skipping device");
                    continue;
                }
            };
            if self.config.list_only_battery && !record.is_battery_device {
                self.skipped.insert(record.device_path);
                continue;
            }

            for path in record.paths.all() {
                telemetry.subscribe(path).await?;
            }
            telemetry.subscribe(&record.device_path).await?;
            telemetry.subscribe(&record.main_path).await?;

            seen.insert(record.device_path.clone());
            let before = self
                .devices
                .get(&record.device_path)
                .cloned()
                .unwrap_or_else(|| record.clone());
            changes.push(DeviceChange {
                before,
                after: record.clone(),
            });
            self.insert(record);
        }
        Ok(changes)
    }

    async fn build_record(
        &self,
        telemetry: &dyn Telemetry,
        profile: &SourceProfile,
        at: &DevicePaths,
        now: Timestamp,
    ) -> Result<DeviceRecord, TransportError> {
        let strategy = self.strategies.get(&profile.id);
        let chains = strategy.field_chains(profile, at);

        let mut record = DeviceRecord::new(
            at.device.clone(),
            at.main.clone(),
            profile.id.clone(),
            profile.adapter.clone(),
            at.instance.clone(),
        );
        record.name = resolve_name(telemetry, strategy.name_plan(), profile, at).await?;

        let connection = telemetry.read_field(&record.paths.instance_connection).await?;
        record.instance_connected = connection.and_then(|s| s.val).map(|v| v.is_truthy());

        let (signal_path, signal) = resolve_chain(telemetry, &chains.signal).await?;
        record.paths.signal = signal_path;
        record.apply_signal(strategy.normalize_signal(value_of(&signal), self.config.raw_signal_passthrough));

        // A device on the charger has no meaningful battery reading.
        let charging = match &chains.charger {
            Some(path) => value_of(&telemetry.read_field(path).await?).is_some_and(FieldValue::is_truthy),
            None => false,
        };
        record.paths.charger = chains.charger.clone();
        if !charging {
            let (battery_path, battery) = resolve_chain(telemetry, &chains.battery).await?;
            let (low_bat_path, low_bat) = resolve_present(telemetry, &chains.low_bat).await?;
            let fault = match &chains.fault {
                Some(path) => telemetry.read_field(path).await?,
                None => None,
            };
            record.paths.battery = battery_path;
            record.paths.low_bat = low_bat_path;
            record.paths.fault = chains.fault.clone();
            record.low_bat_value = low_bat.and_then(|s| s.val);
            record.fault_value = fault.and_then(|s| s.val);
            let battery = battery.and_then(|s| s.val);
            self.recompute_battery(strategy.as_ref(), &mut record, battery.as_ref());
        }

        let (unreach_path, _) = resolve_chain(telemetry, &chains.unreach).await?;
        let (time_path, _) = resolve_chain(telemetry, &chains.time).await?;
        record.paths.unreach = unreach_path;
        record.paths.time = time_path;
        record.paths.state = chains.state.clone();
        record.paths.peer = chains.peer.clone();
        self.evaluate_reachability(telemetry, strategy.as_ref(), &mut record, now)
            .await?;

        if self.config.check_device_upgrades {
            let (update_path, update) = resolve_present(telemetry, &chains.upgrade).await?;
            record.upgrade = match &update_path {
                Some(_) => strategy.resolve_update(value_of(&update)),
                None => UpgradeState::Unknown,
            };
            record.paths.update = update_path;
        }

        Ok(record)
    }

    /// Apply one field change to every record depending on `path`.
    pub async fn apply_field_change(
        &mut self,
        telemetry: &dyn Telemetry,
        path: &str,
        state: &FieldState,
        now: Timestamp,
    ) -> Vec<DeviceChange> {
        let Some(device_paths) = self.index.get(path).cloned() else {
            return Vec::new();
        };
        let mut changes = Vec::new();

        for device_path in device_paths {
            let Some(before) = self.devices.get(&device_path).cloned() else {
                continue;
            };
            let mut record = before.clone();
            match self.apply_to_record(telemetry, &mut record, path, state, now).await {
                Ok(()) => {
                    self.devices.insert(device_path, record.clone());
                    changes.push(DeviceChange {
                        before,
                        after: record,
                    });
                }
                Err(e) => {
                    tracing::warn!(device = %device_path, path, error = %e, "Field update failed");
                }
            }
        }
        changes
    }

    async fn apply_to_record(
        &self,
        telemetry: &dyn Telemetry,
        record: &mut DeviceRecord,
        path: &str,
        state: &FieldState,
        now: Timestamp,
    ) -> Result<(), TransportError> {
        let strategy = self.strategies.get(&record.source_id);
        let value = state.val.as_ref();
        let mut reachability = false;

        for role in record.roles_of(path) {
            match role {
                FieldRole::InstanceConnection => {
                    record.instance_connected = value.map(FieldValue::is_truthy);
                }
                FieldRole::Update => {
                    if self.config.check_device_upgrades {
                        record.upgrade = strategy.resolve_update(value);
                    }
                }
                FieldRole::Signal => {
                    record.apply_signal(
                        strategy.normalize_signal(value, self.config.raw_signal_passthrough),
                    );
                }
                FieldRole::Battery => {
                    if !record.is_battery_device {
                        continue;
                    }
                    // A lone zero after a healthy reading is a glitch.
                    let glitch = value.is_some_and(|v| v.is_number(0.0))
                        && record.battery_raw().is_some_and(|raw| raw >= 5.0);
                    if glitch {
                        tracing::debug!(device = %record.device_path, "Ignoring zero battery reading");
                        continue;
                    }
                    self.recompute_battery(strategy.as_ref(), record, value);
                }
                FieldRole::LowBattery | FieldRole::Fault => {
                    if role == FieldRole::LowBattery {
                        record.low_bat_value = value.cloned();
                    } else {
                        record.fault_value = value.cloned();
                    }
                    if !record.is_battery_device && record.low_bat_value.is_none() {
                        continue;
                    }
                    let battery = match &record.paths.battery {
                        Some(p) => telemetry.read_field(p).await?.and_then(|s| s.val),
                        None => None,
                    };
                    self.recompute_battery(strategy.as_ref(), record, battery.as_ref());
                }
                FieldRole::Unreach => {
                    if record.unreach_value.as_ref() != value {
                        reachability = true;
                    }
                }
                FieldRole::Time | FieldRole::State | FieldRole::Peer => reachability = true,
            }
        }

        if reachability && record.instance_connected != Some(false) {
            self.evaluate_reachability(telemetry, strategy.as_ref(), record, now)
                .await?;
        }
        Ok(())
    }

    /// Re-derive reachability and last contact for every record.
    pub async fn periodic_refresh(&mut self, telemetry: &dyn Telemetry, now: Timestamp) -> Vec<DeviceChange> {
        let paths: Vec<String> = self.devices.keys().cloned().collect();
        let mut changes = Vec::new();
        for device_path in paths {
            let Some(before) = self.devices.get(&device_path).cloned() else {
                continue;
            };
            let strategy = self.strategies.get(&before.source_id);
            let mut record = before.clone();
            match telemetry.read_field(&record.paths.instance_connection).await {
                Ok(connection) => {
                    record.instance_connected = connection.and_then(|s| s.val).map(|v| v.is_truthy());
                }
                Err(e) => tracing::debug!(device = %device_path, error = %e, "Connection read failed"),
            }
            if record.instance_connected == Some(false) {
                continue;
            }
            match self
                .evaluate_reachability(telemetry, strategy.as_ref(), &mut record, now)
                .await
            {
                Ok(()) => {
                    self.devices.insert(device_path, record.clone());
                    changes.push(DeviceChange {
                        before,
                        after: record,
                    });
                }
                Err(e) => tracing::warn!(device = %device_path, error = %e, "Refresh failed"),
            }
        }
        changes
    }

    /// Drop records whose device or main path is `path`. Returns the removed
    /// device paths.
    pub fn remove(&mut self, path: &str) -> Vec<String> {
        let doomed: Vec<String> = self
            .devices
            .values()
            .filter(|d| d.device_path == path || d.main_path == path)
            .map(|d| d.device_path.clone())
            .collect();
        for device_path in &doomed {
            self.drop_record(device_path);
            tracing::info!(device = %device_path, "Device removed");
        }
        doomed
    }

    fn insert(&mut self, record: DeviceRecord) {
        self.unindex(&record.device_path);
        for path in record.paths.all() {
            self.index
                .entry(path.to_string())
                .or_default()
                .insert(record.device_path.clone());
        }
        self.devices.insert(record.device_path.clone(), record);
    }

    fn drop_record(&mut self, device_path: &str) {
        self.unindex(device_path);
        self.devices.remove(device_path);
    }

    fn unindex(&mut self, device_path: &str) {
        let Some(old) = self.devices.get(device_path) else {
            return;
        };
        for path in old.paths.all() {
            if let Some(set) = self.index.get_mut(path) {
                set.remove(device_path);
                if set.is_empty() {
                    self.index.remove(path);
                }
            }
        }
    }

    fn recompute_battery(
        &self,
        strategy: &dyn SourceStrategy,
        record: &mut DeviceRecord,
        battery: Option<&FieldValue>,
    ) {
        let inputs = BatteryInputs {
            battery,
            low_bat: record.low_bat_value.as_ref(),
            fault: record.fault_value.as_ref(),
        };
        let reading = strategy.battery(inputs);
        let low = strategy.is_low_battery(inputs, self.config.min_battery_percent);
        record.apply_battery(reading, low);
    }

    async fn evaluate_reachability(
        &self,
        telemetry: &dyn Telemetry,
        strategy: &dyn SourceStrategy,
        record: &mut DeviceRecord,
        now: Timestamp,
    ) -> Result<(), TransportError> {
        let unreach = read_optional(telemetry, &record.paths.unreach).await?;
        let time = read_optional(telemetry, &record.paths.time).await?;
        let state = read_optional(telemetry, &record.paths.state).await?;
        let peer = read_optional(telemetry, &record.paths.peer).await?;

        let inputs = ReachabilityInputs {
            unreach: unreach.as_ref(),
            time: time.as_ref(),
            state: state.as_ref(),
            peer: peer.as_ref(),
            has_unreach_field: record.paths.unreach.is_some(),
            signal_supported: record.signal_computed.is_supported(),
        };
        let max_minutes = self.config.max_minutes(&record.source_id);
        let status = match strategy.decide_reachability(&inputs, now, max_minutes) {
            Verdict::Decided(status) => status,
            Verdict::Recheck { settle } => {
                tokio::time::sleep(settle).await;
                let reread = read_optional(telemetry, &record.paths.unreach).await?;
                confirm_offline(value_of(&reread))
            }
        };
        let last_contact = strategy
            .last_contact(&inputs)
            .map(|since| format_last_contact(now, since, self.config.language));

        record.unreach_value = unreach.and_then(|s| s.val);
        record.apply_status(status, last_contact);
        Ok(())
    }
}

fn value_of(state: &Option<FieldState>) -> Option<&FieldValue> {
    state.as_ref().and_then(|s| s.val.as_ref())
}

async fn read_optional(
    telemetry: &dyn Telemetry,
    path: &Option<String>,
) -> Result<Option<FieldState>, TransportError> {
    match path {
        Some(path) => telemetry.read_field(path).await,
        None => Ok(None),
    }
}

/// First existing candidate, else the last candidate with no state.
async fn resolve_chain(
    telemetry: &dyn Telemetry,
    chain: &[String],
) -> Result<(Option<String>, Option<FieldState>), TransportError> {
    for path in chain {
        if let Some(state) = telemetry.read_field(path).await? {
            return Ok((Some(path.clone()), Some(state)));
        }
    }
    Ok((chain.last().cloned(), None))
}

/// First existing candidate, or nothing.
async fn resolve_present(
    telemetry: &dyn Telemetry,
    chain: &[String],
) -> Result<(Option<String>, Option<FieldState>), TransportError> {
    for path in chain {
        if let Some(state) = telemetry.read_field(path).await? {
            return Ok((Some(path.clone()), Some(state)));
        }
    }
    Ok((None, None))
}

async fn field_text(telemetry: &dyn Telemetry, path: &str) -> Result<Option<String>, TransportError> {
    Ok(telemetry
        .read_field(path)
        .await?
        .and_then(|s| s.val)
        .map(|v| v.to_string()))
}

async fn object_name(telemetry: &dyn Telemetry, path: &str) -> Result<Option<String>, TransportError> {
    Ok(telemetry.read_object(path).await?.and_then(|meta| meta.name))
}

/// Display name of a device. Falls back to the device folder name.
async fn resolve_name(
    telemetry: &dyn Telemetry,
    plan: NamePlan,
    profile: &SourceProfile,
    at: &DevicePaths,
) -> Result<String, TransportError> {
    let name_field = |base: &str| profile.name.as_deref().map(|suffix| join(base, suffix));

    let name = match plan {
        NamePlan::Field => {
            let from_field = match name_field(&at.device) {
                Some(path) => field_text(telemetry, &path).await?,
                None => None,
            };
            match from_field {
                Some(name) => Some(name),
                None => object_name(telemetry, &at.device).await?,
            }
        }
        NamePlan::FieldPair => {
            let first = match name_field(&at.device) {
                Some(path) => field_text(telemetry, &path).await?,
                None => None,
            };
            let second = match profile.name2.as_deref() {
                Some(suffix) => field_text(telemetry, &join(&at.device, suffix)).await?,
                None => None,
            };
            match (first, second) {
                (Some(a), Some(b)) => Some(format!("{a} {b}")),
                (a, b) => a.or(b),
            }
        }
        NamePlan::ParentObject => object_name(telemetry, &at.parent).await?,
        NamePlan::GrandparentObject => object_name(telemetry, &at.grandparent).await?,
        NamePlan::FolderAndId => {
            let id = match name_field(&at.parent) {
                Some(path) => field_text(telemetry, &path).await?,
                None => None,
            };
            let folder = last_segment(&at.parent);
            Some(match id {
                Some(id) => format!("I{folder} {id}"),
                None => format!("I{folder}"),
            })
        }
        NamePlan::DeviceFolder => Some(last_segment(&at.device).to_string()),
        NamePlan::ParentFolder => Some(last_segment(&at.parent).to_string()),
        NamePlan::CleanedObject => object_name(telemetry, &at.device)
            .await?
            .map(|name| clean_object_name(&name)),
    };

    Ok(name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| last_segment(&at.device).to_string()))
}
