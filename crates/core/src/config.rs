//! Engine configuration model.
//!
//! Loading (file plus environment overrides) lives in the worker; this module
//! holds the shape, defaults and validation shared by every crate.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::blacklist::{normalize_instance_id, BlacklistConfig};
use crate::error::CoreError;
use crate::i18n::Language;
use crate::instance::ConfirmationTimeouts;

pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MIN_BATTERY_PERCENT: f64 = 20.0;
pub const DEFAULT_DEACTIVATION_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_ERROR_TIMEOUT_SECS: u64 = 120;

/// Settings of one enabled source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Minutes without contact before a device counts as offline. `<= 0`
    /// means an unreachable reading is offline immediately.
    pub max_minutes: i64,
}

/// Per-instance override of the confirmation timeouts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceTimeoutEntry {
    pub instance: String,
    pub deactivation_secs: Option<u64>,
    pub error_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct WebhookTarget {
    #[validate(url)]
    pub url: String,
}

/// Overview message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestKind {
    LowBattery,
    Offline,
    Upgradable,
    AdapterUpdates,
    ErrorInstances,
    DeactivatedInstances,
}

/// A configured overview: send `kind` at `time` on the listed weekdays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSchedule {
    pub kind: DigestKind,
    /// Local wall-clock time, `HH:MM`.
    pub time: String,
    /// Weekdays, `0` = Sunday .. `6` = Saturday.
    #[serde(default)]
    pub days: Vec<u8>,
}

/// A digest schedule that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestPlan {
    pub kind: DigestKind,
    pub time: NaiveTime,
    pub days: Vec<Weekday>,
}

impl DigestSchedule {
    pub fn plan(&self) -> Result<DigestPlan, CoreError> {
        let time = NaiveTime::parse_from_str(self.time.trim(), "%H:%M").map_err(|e| {
            CoreError::Validation(format!("digest time '{}' is not HH:MM: {e}", self.time))
        })?;
        if self.days.is_empty() {
            return Err(CoreError::Validation(format!(
                "digest {:?} has no weekdays selected",
                self.kind
            )));
        }
        let days = self
            .days
            .iter()
            .map(|d| weekday_from_sunday(*d))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DigestPlan {
            kind: self.kind,
            time,
            days,
        })
    }
}

fn weekday_from_sunday(day: u8) -> Result<Weekday, CoreError> {
    let weekday = match day {
        0 | 7 => Weekday::Sun,
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        6 => Weekday::Sat,
        other => {
            return Err(CoreError::Validation(format!("weekday {other} out of range")));
        }
    };
    Ok(weekday)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NotificationSettings {
    pub offline: bool,
    pub low_battery: bool,
    pub device_updates: bool,
    pub instance_errors: bool,
    pub instance_deactivated: bool,
    pub adapter_updates: bool,
    /// Prefix device messages with the source display name.
    pub with_adapter_name: bool,
    #[validate(nested)]
    pub webhooks: Vec<WebhookTarget>,
    pub digests: Vec<DigestSchedule>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            offline: true,
            low_battery: true,
            device_updates: true,
            instance_errors: true,
            instance_deactivated: true,
            adapter_updates: true,
            with_adapter_name: true,
            webhooks: Vec::new(),
            digests: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EngineConfig {
    /// Enabled sources keyed by source id.
    pub sources: BTreeMap<String, SourceSettings>,
    pub blacklist: BlacklistConfig,
    pub instance_timeouts: Vec<InstanceTimeoutEntry>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_battery_percent: f64,
    #[validate(range(min = 1))]
    pub deactivation_timeout_secs: u64,
    #[validate(range(min = 1))]
    pub error_timeout_secs: u64,
    /// Show raw signal values instead of percentages.
    pub raw_signal_passthrough: bool,
    /// Keep only battery-powered devices.
    pub list_only_battery: bool,
    pub check_device_upgrades: bool,
    pub check_instances: bool,
    pub check_adapter_updates: bool,
    /// Also project lists per source.
    pub per_source_lists: bool,
    pub language: Language,
    #[validate(range(min = 5, max = 86_400))]
    pub refresh_interval_secs: u64,
    #[validate(nested)]
    pub notifications: NotificationSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sources: BTreeMap::new(),
            blacklist: BlacklistConfig::default(),
            instance_timeouts: Vec::new(),
            min_battery_percent: DEFAULT_MIN_BATTERY_PERCENT,
            deactivation_timeout_secs: DEFAULT_DEACTIVATION_TIMEOUT_SECS,
            error_timeout_secs: DEFAULT_ERROR_TIMEOUT_SECS,
            raw_signal_passthrough: false,
            list_only_battery: false,
            check_device_upgrades: true,
            check_instances: true,
            check_adapter_updates: true,
            per_source_lists: false,
            language: Language::En,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            notifications: NotificationSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Run the declarative checks.
    pub fn validated(self) -> Result<Self, CoreError> {
        self.validate()?;
        Ok(self)
    }

    pub fn is_enabled(&self, source_id: &str) -> bool {
        self.sources.contains_key(source_id)
    }

    /// Staleness threshold of a source; unknown sources are instantaneous.
    pub fn max_minutes(&self, source_id: &str) -> i64 {
        self.sources
            .get(source_id)
            .map(|s| s.max_minutes)
            .unwrap_or(0)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn default_timeouts(&self) -> ConfirmationTimeouts {
        ConfirmationTimeouts {
            deactivation: Duration::from_secs(self.deactivation_timeout_secs),
            error: Duration::from_secs(self.error_timeout_secs),
        }
    }

    /// Per-instance timeout overrides. Entries without a valid instance id or
    /// with a zero timeout are skipped and reported.
    pub fn timeout_overrides(&self) -> (HashMap<String, ConfirmationTimeouts>, Vec<CoreError>) {
        let defaults = self.default_timeouts();
        let mut overrides = HashMap::new();
        let mut errors = Vec::new();

        for entry in &self.instance_timeouts {
            let Some(id) = normalize_instance_id(&entry.instance) else {
                errors.push(CoreError::Validation(format!(
                    "timeout entry '{}' has no valid instance id",
                    entry.instance
                )));
                continue;
            };
            if entry.deactivation_secs == Some(0) || entry.error_secs == Some(0) {
                errors.push(CoreError::Validation(format!(
                    "timeout entry '{id}' must use positive timeouts"
                )));
                continue;
            }
            overrides.insert(
                id,
                ConfirmationTimeouts {
                    deactivation: entry
                        .deactivation_secs
                        .map(Duration::from_secs)
                        .unwrap_or(defaults.deactivation),
                    error: entry
                        .error_secs
                        .map(Duration::from_secs)
                        .unwrap_or(defaults.error),
                },
            );
        }

        (overrides, errors)
    }

    /// Valid digest plans; broken schedules are skipped and reported.
    pub fn digest_plans(&self) -> (Vec<DigestPlan>, Vec<CoreError>) {
        let mut plans = Vec::new();
        let mut errors = Vec::new();
        for schedule in &self.notifications.digests {
            match schedule.plan() {
                Ok(plan) => plans.push(plan),
                Err(e) => errors.push(e),
            }
        }
        (plans, errors)
    }
}
