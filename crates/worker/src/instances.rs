//! Instance monitoring.
//!
//! [`InstanceMonitor`] tracks every source instance through its heartbeat,
//! host connection and device connection fields. Continuous instances go
//! through the two-stage confirmation debounce before a worse health is
//! committed; scheduled instances are judged against their cron schedule.
//!
//! Confirmation timers run as spawned sleeps. A fired timer is reported on an
//! mpsc channel and fed back through [`InstanceMonitor::timer_fired`] by the
//! engine, so all record mutation happens on the engine task.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use fleetwatch_core::blacklist::normalize_instance_id;
use fleetwatch_core::config::EngineConfig;
use fleetwatch_core::cron::CronSchedule;
use fleetwatch_core::instance::{
    evaluate_scheduled, status_text, ConfirmationTimeouts, Debounce, Observation, TimerCommand,
};
use fleetwatch_core::projection::AdapterUpdate;
use fleetwatch_core::record::{ExecutionMode, InstanceHealth};
use fleetwatch_core::types::capitalize;
use fleetwatch_core::{FieldState, FieldValue, InstanceRecord, Timestamp};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::transport::{Telemetry, TransportError};

pub const HEARTBEAT_PATTERN: &str = "system.adapter.*.alive";
pub const ADAPTER_UPDATES_PATTERN: &str = "admin.*.info.updatesJson";

/// A confirmation timer expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub instance: String,
    pub generation: u64,
}

/// Committed health before a mutation, and the record after it.
#[derive(Debug, Clone)]
pub struct InstanceChange {
    pub before: InstanceHealth,
    pub after: InstanceRecord,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdapterVersions {
    available_version: String,
    installed_version: String,
}

/// Parse an `updatesJson` payload (`{"hue": {"availableVersion": ..,
/// "installedVersion": ..}}`). Keys are capitalized.
pub fn parse_adapter_updates(json: &str) -> Result<BTreeMap<String, AdapterUpdate>, serde_json::Error> {
    let raw: BTreeMap<String, AdapterVersions> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|(id, versions)| {
            let adapter = capitalize(&id);
            (
                adapter.clone(),
                AdapterUpdate {
                    adapter,
                    available_version: versions.available_version,
                    installed_version: versions.installed_version,
                },
            )
        })
        .collect())
}

fn flag(state: &Option<FieldState>) -> Option<bool> {
    state
        .as_ref()
        .and_then(|s| s.val.as_ref())
        .map(FieldValue::is_truthy)
}

pub struct InstanceMonitor {
    config: Arc<EngineConfig>,
    defaults: ConfirmationTimeouts,
    overrides: HashMap<String, ConfirmationTimeouts>,
    instances: BTreeMap<String, InstanceRecord>,
    debounce: HashMap<String, Debounce>,
    schedules: HashMap<String, CronSchedule>,
    adapter_updates: BTreeMap<String, AdapterUpdate>,

    timers: HashMap<String, CancellationToken>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl InstanceMonitor {
    pub fn new(config: Arc<EngineConfig>, timer_tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        let (overrides, errors) = config.timeout_overrides();
        for e in errors {
            tracing::warn!(error = %e, "Ignoring instance timeout entry");
        }
        Self {
            defaults: config.default_timeouts(),
            overrides,
            config,
            instances: BTreeMap::new(),
            debounce: HashMap::new(),
            schedules: HashMap::new(),
            adapter_updates: BTreeMap::new(),
            timers: HashMap::new(),
            timer_tx,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn instances(&self) -> &BTreeMap<String, InstanceRecord> {
        &self.instances
    }

    pub fn adapter_updates(&self) -> &BTreeMap<String, AdapterUpdate> {
        &self.adapter_updates
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    fn timeouts(&self, id: &str) -> ConfirmationTimeouts {
        self.overrides.get(id).copied().unwrap_or(self.defaults)
    }

    /// Discover every instance. New and non-continuous instances commit their
    /// current health directly; known continuous ones go through the debounce.
    pub async fn scan(&mut self, telemetry: &dyn Telemetry) -> Result<Vec<InstanceChange>, TransportError> {
        let heartbeats = telemetry.list_matching(HEARTBEAT_PATTERN).await?;
        let mut changes = Vec::new();
        let now = Local::now();

        for path in heartbeats {
            let Some(id) = normalize_instance_id(&path) else {
                continue;
            };
            let meta = telemetry
                .read_object(&format!("system.adapter.{id}"))
                .await?
                .unwrap_or_default();
            let adapter = meta
                .name
                .clone()
                .unwrap_or_else(|| id.split('.').next().unwrap_or(&id).to_string());
            let mode = ExecutionMode::from_mode(meta.attr_str("mode").unwrap_or("daemon"));

            let mut record = InstanceRecord::new(id.clone(), capitalize(&adapter), mode);
            record.version = meta.attr_str("version").map(str::to_string);
            record.schedule = meta.attr_str("schedule").map(str::to_string);
            record.available_update = self
                .adapter_updates
                .get(&record.adapter)
                .map(|u| u.available_version.clone());

            if let Some(expression) = &record.schedule {
                match CronSchedule::parse(expression) {
                    Ok(schedule) => {
                        self.schedules.insert(id.clone(), schedule);
                    }
                    Err(e) => tracing::warn!(instance = %id, error = %e, "Unusable schedule"),
                }
            }

            let heartbeat = telemetry.read_field(&record.heartbeat_path()).await?;
            let host = telemetry.read_field(&record.host_path()).await?;
            let device = telemetry.read_field(&record.device_path()).await?;
            record.heartbeat = flag(&heartbeat);
            record.host = flag(&host);
            record.device = flag(&device);
            record.heartbeat_changed = heartbeat.map(|s| s.lc);

            let observed = self.derive(&record, &now);
            let committed = self.instances.get(&id).map(|r| r.health);
            let before = committed.unwrap_or(observed);
            match committed {
                // A known continuous instance keeps its pending confirmation.
                Some(committed) if record.mode == ExecutionMode::Continuous => {
                    let timeouts = self.timeouts(&id);
                    let step = self
                        .debounce
                        .entry(id.clone())
                        .or_default()
                        .observe(committed, observed, &timeouts);
                    self.run_timer_command(&id, step.timer);
                    self.commit(&mut record, step.commit.unwrap_or(committed));
                }
                _ => {
                    self.cancel_timer(&id);
                    if let Some(debounce) = self.debounce.get_mut(&id) {
                        debounce.reset();
                    }
                    self.commit(&mut record, observed);
                }
            }

            for path in [record.heartbeat_path(), record.host_path(), record.device_path()] {
                telemetry.subscribe(&path).await?;
            }
            telemetry.subscribe(&format!("system.adapter.{id}")).await?;

            changes.push(InstanceChange {
                before,
                after: record.clone(),
            });
            self.instances.insert(id, record);
        }

        tracing::debug!(instances = self.instances.len(), "Instance scan complete");
        Ok(changes)
    }

    /// Health as observed right now, without debounce.
    fn derive<Tz: chrono::TimeZone>(&self, record: &InstanceRecord, now: &chrono::DateTime<Tz>) -> InstanceHealth {
        match record.mode {
            ExecutionMode::Continuous => Observation {
                heartbeat: record.heartbeat,
                host: record.host,
                device: record.device,
            }
            .evaluate(),
            ExecutionMode::Scheduled => match self.schedules.get(&record.id) {
                Some(schedule) => evaluate_scheduled(now, schedule, record.heartbeat_changed),
                None => InstanceHealth::Deactivated,
            },
            ExecutionMode::Other(_) => InstanceHealth::Deactivated,
        }
    }

    fn commit(&self, record: &mut InstanceRecord, health: InstanceHealth) {
        record.health = health;
        record.status = status_text(health, self.config.language).to_string();
        record.connected_host = health.is_alive() && record.host == Some(true);
        record.connected_device = health.is_alive() && record.device != Some(false);
    }

    /// `true` when `path` is a heartbeat, host or device field of a known
    /// instance.
    pub fn watches(&self, path: &str) -> bool {
        self.instance_for(path).is_some()
    }

    fn instance_for(&self, path: &str) -> Option<String> {
        self.instances
            .values()
            .find(|r| r.heartbeat_path() == path || r.host_path() == path || r.device_path() == path)
            .map(|r| r.id.clone())
    }

    /// Apply a heartbeat or connection change.
    pub fn apply_field_change(&mut self, path: &str, state: &FieldState) -> Option<InstanceChange> {
        let id = self.instance_for(path)?;
        let mut record = self.instances.get(&id)?.clone();
        let value = state.val.as_ref().map(FieldValue::is_truthy);

        if path == record.heartbeat_path() {
            if record.heartbeat == value && record.mode != ExecutionMode::Scheduled {
                return None;
            }
            record.heartbeat = value;
            record.heartbeat_changed = Some(state.lc);
        } else {
            // Connection flips only matter while the instance runs.
            let current = if path == record.host_path() {
                &mut record.host
            } else {
                &mut record.device
            };
            if *current == value {
                return None;
            }
            *current = value;
            if record.heartbeat != Some(true) {
                self.instances.insert(id, record);
                return None;
            }
        }

        let before = record.health;
        let observed = self.derive(&record, &Local::now());
        let change = match record.mode {
            ExecutionMode::Continuous => {
                let timeouts = self.timeouts(&id);
                let step = self
                    .debounce
                    .entry(id.clone())
                    .or_default()
                    .observe(before, observed, &timeouts);
                self.run_timer_command(&id, step.timer);
                step.commit
            }
            _ => (observed != before).then_some(observed),
        };

        if let Some(health) = change {
            self.commit(&mut record, health);
            tracing::info!(instance = %id, status = %record.status, "Instance health committed");
        }
        self.instances.insert(id, record.clone());
        change.map(|_| InstanceChange {
            before,
            after: record,
        })
    }

    /// A confirmation timer expired; re-read the fields and advance the
    /// debounce.
    pub async fn timer_fired(
        &mut self,
        telemetry: &dyn Telemetry,
        fired: TimerFired,
    ) -> Result<Option<InstanceChange>, TransportError> {
        let Some(mut record) = self.instances.get(&fired.instance).cloned() else {
            return Ok(None);
        };
        self.timers.remove(&fired.instance);

        record.heartbeat = flag(&telemetry.read_field(&record.heartbeat_path()).await?);
        record.host = flag(&telemetry.read_field(&record.host_path()).await?);
        record.device = flag(&telemetry.read_field(&record.device_path()).await?);

        let before = record.health;
        let observed = self.derive(&record, &Local::now());
        let timeouts = self.timeouts(&record.id);
        let step = self
            .debounce
            .entry(record.id.clone())
            .or_default()
            .timer_fired(fired.generation, before, observed, &timeouts);
        self.run_timer_command(&record.id, step.timer);

        if let Some(health) = step.commit {
            self.commit(&mut record, health);
            tracing::info!(instance = %record.id, status = %record.status, "Instance health confirmed");
        }
        self.instances.insert(record.id.clone(), record.clone());
        Ok(step.commit.map(|_| InstanceChange {
            before,
            after: record,
        }))
    }

    /// Re-judge scheduled instances against the clock.
    pub fn refresh_scheduled<Tz: chrono::TimeZone>(&mut self, now: &chrono::DateTime<Tz>) -> Vec<InstanceChange> {
        let mut changes = Vec::new();
        let ids: Vec<String> = self
            .instances
            .values()
            .filter(|r| r.mode == ExecutionMode::Scheduled)
            .map(|r| r.id.clone())
            .collect();
        for id in ids {
            let Some(mut record) = self.instances.get(&id).cloned() else {
                continue;
            };
            let before = record.health;
            let observed = self.derive(&record, now);
            if observed == before {
                continue;
            }
            self.commit(&mut record, observed);
            changes.push(InstanceChange {
                before,
                after: record.clone(),
            });
            self.instances.insert(id, record);
        }
        changes
    }

    /// Replace the adapter update table. Returns the previous count.
    pub fn set_adapter_updates(&mut self, updates: BTreeMap<String, AdapterUpdate>) -> usize {
        let previous = self.adapter_updates.len();
        self.adapter_updates = updates;
        for record in self.instances.values_mut() {
            record.available_update = self
                .adapter_updates
                .get(&record.adapter)
                .map(|u| u.available_version.clone());
        }
        previous
    }

    /// Read every `updatesJson` field. Returns the previous count.
    pub async fn refresh_adapter_updates(&mut self, telemetry: &dyn Telemetry) -> Result<usize, TransportError> {
        telemetry.subscribe(ADAPTER_UPDATES_PATTERN).await?;
        let mut updates = BTreeMap::new();
        for path in telemetry.list_matching(ADAPTER_UPDATES_PATTERN).await? {
            let Some(text) = telemetry
                .read_field(&path)
                .await?
                .and_then(|s| s.val)
                .map(|v| v.to_string())
            else {
                continue;
            };
            match parse_adapter_updates(&text) {
                Ok(parsed) => updates.extend(parsed),
                Err(e) => tracing::warn!(path, error = %e, "Unreadable adapter update list"),
            }
        }
        Ok(self.set_adapter_updates(updates))
    }

    /// Forget an instance whose object or heartbeat went away.
    pub fn remove(&mut self, path: &str) -> Option<String> {
        let id = self
            .instances
            .values()
            .find(|r| path == format!("system.adapter.{}", r.id) || path == r.heartbeat_path())
            .map(|r| r.id.clone())?;
        self.cancel_timer(&id);
        self.instances.remove(&id);
        self.debounce.remove(&id);
        self.schedules.remove(&id);
        tracing::info!(instance = %id, "Instance removed");
        Some(id)
    }

    fn run_timer_command(&mut self, id: &str, command: TimerCommand) {
        match command {
            TimerCommand::Keep => {}
            TimerCommand::Cancel => self.cancel_timer(id),
            TimerCommand::Arm { delay, generation } => self.arm_timer(id, delay, generation),
        }
    }

    fn arm_timer(&mut self, id: &str, delay: Duration, generation: u64) {
        self.cancel_timer(id);
        let token = self.cancel.child_token();
        let cancelled = token.clone();
        let tx = self.timer_tx.clone();
        let fired = TimerFired {
            instance: id.to_string(),
            generation,
        };
        tracing::debug!(instance = id, ?delay, generation, "Confirmation timer armed");
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = tx.send(fired) {
                        tracing::debug!(instance = %e.0.instance, "Engine gone, confirmation dropped");
                    }
                }
            }
        });
        self.timers.insert(id.to_string(), token);
    }

    fn cancel_timer(&mut self, id: &str) {
        if let Some(token) = self.timers.remove(id) {
            token.cancel();
        }
    }

    /// Cancel every pending confirmation and wait for the timer tasks.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.timers.clear();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Instance monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_updates_are_capitalized() {
        let updates = parse_adapter_updates(
            r#"{"hue": {"availableVersion": "3.1.0", "installedVersion": "3.0.2"}}"#,
        )
        .unwrap();
        let hue = &updates["Hue"];
        assert_eq!(hue.available_version, "3.1.0");
        assert_eq!(hue.installed_version, "3.0.2");
    }

    #[test]
    fn malformed_update_list_is_an_error() {
        assert!(parse_adapter_updates("not json").is_err());
    }
}
