//! Source profiles: per-source field-path templates.
//!
//! Every telemetry source (adapter) names its fields differently. A
//! [`SourceProfile`] records the selector whose matches identify one device
//! each, plus the suffixes under which the battery, signal, reachability and
//! update fields live. Suffixes are relative to a device path; the strategy of
//! the source decides which level of the path hierarchy each one is joined to.
//!
//! The built-in table ships as `data/sources.json` and is parsed once at
//! startup. Failure to build it is fatal for the process.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

const BUILTIN_SOURCES: &str = include_str!("../data/sources.json");

/// Field templates of one telemetry source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceProfile {
    /// Stable source id, e.g. `zigbee` or `hmrpc`.
    pub id: String,
    /// Display name used in lists and messages.
    pub adapter: String,
    /// Glob pattern; every match is the main field of one device.
    pub selector: String,
    #[serde(default)]
    pub rssi: Option<String>,
    #[serde(default)]
    pub rssi_peer: Option<String>,
    /// Secondary radio status used when `rssi` is absent.
    #[serde(default)]
    pub rf: Option<String>,
    #[serde(default)]
    pub battery: Option<String>,
    #[serde(default)]
    pub battery2: Option<String>,
    #[serde(default)]
    pub battery3: Option<String>,
    /// Battery field of the device root channel (Homematic).
    #[serde(default)]
    pub hm_dn_battery: Option<String>,
    #[serde(default)]
    pub charger: Option<String>,
    #[serde(default)]
    pub low_bat: Option<String>,
    #[serde(default)]
    pub low_bat2: Option<String>,
    #[serde(default)]
    pub low_bat3: Option<String>,
    #[serde(default)]
    pub fault_reporting: Option<String>,
    #[serde(default)]
    pub reach: Option<String>,
    #[serde(default)]
    pub state_value: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub upgrade: Option<String>,
    /// Field holding the device name.
    #[serde(default)]
    pub name: Option<String>,
    /// Second name field, appended to the first.
    #[serde(default)]
    pub name2: Option<String>,
}

/// Read-only table of all known source profiles, keyed by id.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    profiles: BTreeMap<String, SourceProfile>,
}

impl SourceRegistry {
    /// Parse the embedded source table.
    pub fn builtin() -> Result<Self, CoreError> {
        Self::from_json(BUILTIN_SOURCES)
    }

    /// Parse a JSON array of profiles and validate it.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let list: Vec<SourceProfile> =
            serde_json::from_str(json).map_err(|e| CoreError::Registry(e.to_string()))?;
        Self::from_profiles(list)
    }

    pub fn from_profiles(list: Vec<SourceProfile>) -> Result<Self, CoreError> {
        if list.is_empty() {
            return Err(CoreError::Registry("source table is empty".into()));
        }

        let mut seen = HashSet::new();
        let mut profiles = BTreeMap::new();
        for profile in list {
            if profile.id.trim().is_empty() {
                return Err(CoreError::Registry("profile with empty id".into()));
            }
            if !profile.selector.contains('*') {
                return Err(CoreError::Registry(format!(
                    "selector of '{}' must contain a wildcard",
                    profile.id
                )));
            }
            if !seen.insert(profile.id.clone()) {
                return Err(CoreError::Registry(format!(
                    "duplicate source id '{}'",
                    profile.id
                )));
            }
            profiles.insert(profile.id.clone(), profile);
        }

        Ok(Self { profiles })
    }

    pub fn get(&self, id: &str) -> Option<&SourceProfile> {
        self.profiles.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceProfile> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Path hierarchy
// ---------------------------------------------------------------------------

/// The path levels around a matched selector field.
///
/// For a match `zigbee.0.00158d00.link_quality` the device path is
/// `zigbee.0.00158d00`, its parent `zigbee.0` and the instance `zigbee.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePaths {
    /// The matched selector path.
    pub main: String,
    /// The matched path without its last segment.
    pub device: String,
    /// One level above `device`.
    pub parent: String,
    /// Two levels above `device`.
    pub grandparent: String,
    /// Owning source instance (`<adapter>.<n>`).
    pub instance: String,
}

impl DevicePaths {
    /// Split a matched selector path. Returns `None` for paths too short to
    /// carry a device level.
    pub fn from_match(main: &str) -> Option<Self> {
        if main.ends_with('.') {
            return None;
        }
        let device = strip_last(main)?;
        let parent = strip_last(device).unwrap_or_default();
        let grandparent = strip_last(parent).unwrap_or_default();

        let mut segments = main.splitn(3, '.');
        let adapter = segments.next()?;
        let number = segments.next()?;
        let instance = format!("{adapter}.{number}");

        Some(Self {
            main: main.to_string(),
            device: device.to_string(),
            parent: parent.to_string(),
            grandparent: grandparent.to_string(),
            instance,
        })
    }

    /// The instance's own device-connection field.
    pub fn instance_connection(&self) -> String {
        format!("{}.info.connection", self.instance)
    }
}

fn strip_last(path: &str) -> Option<&str> {
    path.rfind('.').map(|idx| &path[..idx])
}

/// Join a base path and a relative suffix.
pub fn join(base: &str, suffix: &str) -> String {
    if base.is_empty() {
        suffix.to_string()
    } else {
        format!("{base}.{suffix}")
    }
}

/// Last segment of a path (folder name).
pub fn last_segment(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}
