//! User-facing wording in the supported languages.
//!
//! Only English and German carry their own wording; any other configured
//! language code falls back to English.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    De,
}

impl Language {
    /// Parse a language code such as `de` or `en-GB`. Unknown codes map to English.
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().split(['-', '_']).next() {
            Some("de") => Language::De,
            _ => Language::En,
        }
    }
}

/// Translatable phrases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phrase {
    Minutes,
    Hours,
    Days,
    InstanceOkay,
    InstanceDeactivated,
    NotConnectedHost,
    NotConnectedDevice,
    DeviceLowBatDetected,
    DeviceAvailableAgain,
    DeviceNotReachable,
    DeviceNewUpdates,
    AdapterNewUpdates,
    InstanceWatchdog,
    DailyOverview,
    WeeklyOverview,
    OverviewOf,
    DevicesLowBat,
    OfflineDevices,
    UpgradableDevices,
    AdapterUpdates,
    ErrorInstances,
    DeactivatedInstances,
}

pub fn text(lang: Language, phrase: Phrase) -> &'static str {
    use Phrase::*;
    match (lang, phrase) {
        (Language::En, Minutes) => "minutes",
        (Language::De, Minutes) => "Minuten",
        (Language::En, Hours) => "hours",
        (Language::De, Hours) => "Stunden",
        (Language::En, Days) => "days",
        (Language::De, Days) => "Tage",
        (Language::En, InstanceOkay) => "ok",
        (Language::De, InstanceOkay) => "ok",
        (Language::En, InstanceDeactivated) => "Instance deactivated",
        (Language::De, InstanceDeactivated) => "Instanz deaktiviert",
        (Language::En, NotConnectedHost) => "not connected to host",
        (Language::De, NotConnectedHost) => "nicht mit Host verbunden",
        (Language::En, NotConnectedDevice) => "not connected to device or service",
        (Language::De, NotConnectedDevice) => "nicht mit Gerät oder Dienst verbunden",
        (Language::En, DeviceLowBatDetected) => "Device with low battery detected",
        (Language::De, DeviceLowBatDetected) => "Gerät mit niedrigem Batteriestand erkannt",
        (Language::En, DeviceAvailableAgain) => "Device available again",
        (Language::De, DeviceAvailableAgain) => "Gerät wieder erreichbar",
        (Language::En, DeviceNotReachable) => "Device not reachable",
        (Language::De, DeviceNotReachable) => "Gerät nicht erreichbar",
        (Language::En, DeviceNewUpdates) => "New device update available",
        (Language::De, DeviceNewUpdates) => "Neues Geräte-Update verfügbar",
        (Language::En, AdapterNewUpdates) => "New adapter updates available",
        (Language::De, AdapterNewUpdates) => "Neue Adapter-Updates verfügbar",
        (Language::En, InstanceWatchdog) => "Instance watchdog",
        (Language::De, InstanceWatchdog) => "Instanz-Wächter",
        (Language::En, DailyOverview) => "Daily overview of",
        (Language::De, DailyOverview) => "Tägliche Übersicht über",
        (Language::En, WeeklyOverview) => "Weekly overview of",
        (Language::De, WeeklyOverview) => "Wöchentliche Übersicht über",
        (Language::En, OverviewOf) => "Overview of",
        (Language::De, OverviewOf) => "Übersicht über",
        (Language::En, DevicesLowBat) => "devices with low battery",
        (Language::De, DevicesLowBat) => "Geräte mit niedrigem Batteriestand",
        (Language::En, OfflineDevices) => "offline devices",
        (Language::De, OfflineDevices) => "nicht erreichbare Geräte",
        (Language::En, UpgradableDevices) => "devices with available updates",
        (Language::De, UpgradableDevices) => "Geräte mit verfügbaren Updates",
        (Language::En, AdapterUpdates) => "available adapter updates",
        (Language::De, AdapterUpdates) => "verfügbare Adapter-Updates",
        (Language::En, ErrorInstances) => "instances with errors",
        (Language::De, ErrorInstances) => "Instanzen mit Fehlern",
        (Language::En, DeactivatedInstances) => "deactivated instances",
        (Language::De, DeactivatedInstances) => "deaktivierte Instanzen",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_codes() {
        assert_eq!(Language::from_code("de"), Language::De);
        assert_eq!(Language::from_code("DE-at"), Language::De);
        assert_eq!(Language::from_code("fr"), Language::En);
    }

    #[test]
    fn units_are_localized() {
        assert_eq!(text(Language::De, Phrase::Hours), "Stunden");
        assert_eq!(text(Language::En, Phrase::Days), "days");
    }
}
