//! Exclusion sets for lists and notifications.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// One excluded device, keyed by its main selector path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceBlacklistEntry {
    pub device: String,
    /// Hide from the global lists.
    pub lists: bool,
    /// Hide from the per-source lists.
    pub source_lists: bool,
    /// Never notify about this device.
    pub notify: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceBlacklistEntry {
    /// `<adapter>.<n>`; a full `system.adapter.<id>.alive` path is accepted too.
    pub instance: String,
    pub lists: bool,
    pub notify: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    pub devices: Vec<DeviceBlacklistEntry>,
    pub instances: Vec<InstanceBlacklistEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    device_lists: HashSet<String>,
    device_source_lists: HashSet<String>,
    device_notify: HashSet<String>,
    instance_lists: HashSet<String>,
    instance_notify: HashSet<String>,
}

impl Blacklist {
    /// Build the sets. Malformed entries are skipped and returned alongside.
    pub fn from_config(config: &BlacklistConfig) -> (Self, Vec<CoreError>) {
        let mut blacklist = Self::default();
        let mut errors = Vec::new();

        for (idx, entry) in config.devices.iter().enumerate() {
            let device = entry.device.trim();
            if device.is_empty() {
                errors.push(CoreError::Validation(format!(
                    "device blacklist entry {idx} has no device path"
                )));
                continue;
            }
            if entry.lists {
                blacklist.device_lists.insert(device.to_string());
            }
            if entry.source_lists {
                blacklist.device_source_lists.insert(device.to_string());
            }
            if entry.notify {
                blacklist.device_notify.insert(device.to_string());
            }
        }

        for (idx, entry) in config.instances.iter().enumerate() {
            let Some(instance) = normalize_instance_id(&entry.instance) else {
                errors.push(CoreError::Validation(format!(
                    "instance blacklist entry {idx} has no valid instance id"
                )));
                continue;
            };
            if entry.lists {
                blacklist.instance_lists.insert(instance.clone());
            }
            if entry.notify {
                blacklist.instance_notify.insert(instance);
            }
        }

        (blacklist, errors)
    }

    pub fn hides_device(&self, main_path: &str) -> bool {
        self.device_lists.contains(main_path)
    }

    pub fn hides_device_in_source(&self, main_path: &str) -> bool {
        self.device_source_lists.contains(main_path)
    }

    pub fn mutes_device(&self, main_path: &str) -> bool {
        self.device_notify.contains(main_path)
    }

    pub fn hides_instance(&self, instance: &str) -> bool {
        self.instance_lists.contains(instance)
    }

    pub fn mutes_instance(&self, instance: &str) -> bool {
        self.instance_notify.contains(instance)
    }
}

/// Accept `zigbee.0`, `system.adapter.zigbee.0` or `system.adapter.zigbee.0.alive`.
pub fn normalize_instance_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let id = trimmed.strip_prefix("system.adapter.").unwrap_or(trimmed);
    let id = id.strip_suffix(".alive").unwrap_or(id);

    let (adapter, number) = id.rsplit_once('.')?;
    if adapter.is_empty() || number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(id.to_string())
}
