//! Firmware update indicator.

use serde::Serialize;

use crate::types::FieldValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateRule {
    /// Boolean "update available" flag.
    #[default]
    Flag,
    /// `UPDATE_AVAILABLE` means available, any other text means up to date.
    StateText,
    /// Anything except `Up to Date` means available.
    FirmwareStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeState {
    Available,
    UpToDate,
    #[default]
    Unknown,
}

impl UpgradeState {
    pub fn is_available(self) -> bool {
        self == UpgradeState::Available
    }
}

pub fn resolve_update(rule: UpdateRule, value: Option<&FieldValue>) -> UpgradeState {
    let Some(value) = value else {
        return UpgradeState::Unknown;
    };
    let available = match rule {
        UpdateRule::Flag => match value.as_bool() {
            Some(flag) => flag,
            None => return UpgradeState::Unknown,
        },
        UpdateRule::StateText => value.is_text("UPDATE_AVAILABLE"),
        UpdateRule::FirmwareStatus => !value.is_text("Up to Date"),
    };
    if available {
        UpgradeState::Available
    } else {
        UpgradeState::UpToDate
    }
}
