//! Localized message text for events and overviews.

use fleetwatch_core::i18n::{text, Language, Phrase};

use crate::bus::{EventCategory, EventKind, HealthEvent};

/// Rendering options shared by the router and the digest scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageStyle {
    pub language: Language,
    /// Prefix device lines with `<Adapter>: `.
    pub with_adapter_name: bool,
}

impl MessageStyle {
    fn prefix(&self, adapter: &str) -> String {
        if self.with_adapter_name && !adapter.is_empty() {
            format!("{adapter}: ")
        } else {
            String::new()
        }
    }

    /// One device line, `<prefix><name>` plus an optional detail in parentheses.
    pub fn device_line(&self, adapter: &str, device: &str, detail: Option<&str>) -> String {
        match detail {
            Some(detail) => format!("{}{device} ({detail})", self.prefix(adapter)),
            None => format!("{}{device}", self.prefix(adapter)),
        }
    }
}

pub fn render_event(event: &HealthEvent, style: MessageStyle) -> String {
    let lang = style.language;
    let adapter = event.payload_str("adapter");
    let device = event.payload_str("device");

    match (event.category, event.kind) {
        (EventCategory::AdapterUpdate, _) => {
            let lines: String = event
                .payload
                .get("updates")
                .and_then(|v| v.as_array())
                .map(|updates| {
                    updates
                        .iter()
                        .map(|u| {
                            let name = u.get("adapter").and_then(|v| v.as_str()).unwrap_or("");
                            let version = u.get("version").and_then(|v| v.as_str()).unwrap_or("");
                            format!("\n{name}: v{version}")
                        })
                        .collect()
                })
                .unwrap_or_default();
            format!("{}:{lines}", text(lang, Phrase::AdapterNewUpdates))
        }
        (EventCategory::Instance, _) => format!(
            "{}:\n{}: {}",
            text(lang, Phrase::InstanceWatchdog),
            event.identity,
            event.payload_str("status")
        ),
        (EventCategory::Device, EventKind::LowBattery) => format!(
            "{}:\n{}",
            text(lang, Phrase::DeviceLowBatDetected),
            style.device_line(adapter, device, Some(event.payload_str("battery")))
        ),
        (EventCategory::Device, EventKind::Online) => format!(
            "{}:\n{}",
            text(lang, Phrase::DeviceAvailableAgain),
            style.device_line(adapter, device, Some(event.payload_str("last_contact")))
        ),
        (EventCategory::Device, EventKind::Offline) => format!(
            "{}:\n{}",
            text(lang, Phrase::DeviceNotReachable),
            style.device_line(adapter, device, Some(event.payload_str("last_contact")))
        ),
        (EventCategory::Device, _) => format!(
            "{}:\n{}",
            text(lang, Phrase::DeviceNewUpdates),
            style.device_line(adapter, device, None)
        ),
    }
}

/// Overview message for a digest. `None` when there is nothing to report.
///
/// The heading depends on how many weekdays the digest runs on: every day
/// reads as a daily overview, a single day as a weekly one.
pub fn render_overview(
    language: Language,
    days_selected: usize,
    subject: Phrase,
    lines: &[String],
) -> Option<String> {
    if lines.is_empty() {
        return None;
    }
    let heading = match days_selected {
        7 => Phrase::DailyOverview,
        1 => Phrase::WeeklyOverview,
        _ => Phrase::OverviewOf,
    };
    let body: String = lines.iter().map(|l| format!("\n{l}")).collect();
    Some(format!(
        "{} {}:{body}",
        text(language, heading),
        text(language, subject)
    ))
}
