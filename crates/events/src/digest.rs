//! Digest notification scheduler.
//!
//! [`DigestScheduler`] runs as a background task and sends overview messages
//! (low battery, offline devices, ...) at the configured local time on the
//! configured weekdays. Content comes from the latest published
//! [`FleetSnapshot`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};
use fleetwatch_core::blacklist::Blacklist;
use fleetwatch_core::config::{DigestKind, DigestPlan};
use fleetwatch_core::i18n::Phrase;
use fleetwatch_core::FleetSnapshot;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::message::{render_overview, MessageStyle};
use crate::router::NotificationRouter;

/// How often the scheduler compares the clock against the plans.
const DIGEST_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// `true` when `plan` should fire at `now` and has not fired today.
pub fn is_due(plan: &DigestPlan, now: NaiveDateTime, last_sent: Option<NaiveDate>) -> bool {
    plan.days.contains(&now.weekday())
        && now.hour() == plan.time.hour()
        && now.minute() == plan.time.minute()
        && last_sent != Some(now.date())
}

pub fn subject(kind: DigestKind) -> Phrase {
    match kind {
        DigestKind::LowBattery => Phrase::DevicesLowBat,
        DigestKind::Offline => Phrase::OfflineDevices,
        DigestKind::Upgradable => Phrase::UpgradableDevices,
        DigestKind::AdapterUpdates => Phrase::AdapterUpdates,
        DigestKind::ErrorInstances => Phrase::ErrorInstances,
        DigestKind::DeactivatedInstances => Phrase::DeactivatedInstances,
    }
}

/// Lines of one overview. Notify-blacklisted devices and instances are left out.
pub fn overview_lines(
    kind: DigestKind,
    snapshot: &FleetSnapshot,
    blacklist: &Blacklist,
    style: MessageStyle,
) -> Vec<String> {
    let devices = snapshot
        .devices_sorted()
        .into_iter()
        .filter(|d| !blacklist.mutes_device(&d.main_path));
    let instances = snapshot
        .instances
        .values()
        .filter(|i| !blacklist.mutes_instance(&i.id));

    match kind {
        DigestKind::LowBattery => devices
            .filter(|d| d.counts_as_low_battery())
            .map(|d| style.device_line(&d.adapter, &d.name, Some(&d.battery.to_string())))
            .collect(),
        DigestKind::Offline => devices
            .filter(|d| d.is_offline())
            .map(|d| style.device_line(&d.adapter, &d.name, Some(d.last_contact.as_deref().unwrap_or("-"))))
            .collect(),
        DigestKind::Upgradable => devices
            .filter(|d| d.upgrade.is_available())
            .map(|d| style.device_line(&d.adapter, &d.name, None))
            .collect(),
        DigestKind::AdapterUpdates => snapshot
            .adapter_updates
            .values()
            .map(|u| format!("{}: v{}", u.adapter, u.available_version))
            .collect(),
        DigestKind::ErrorInstances => instances
            .filter(|i| i.is_error())
            .map(|i| format!("{}: {}", i.id, i.status))
            .collect(),
        DigestKind::DeactivatedInstances => instances
            .filter(|i| !i.is_alive())
            .map(|i| i.id.clone())
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// DigestScheduler
// ---------------------------------------------------------------------------

pub struct DigestScheduler {
    plans: Vec<DigestPlan>,
    snapshot: watch::Receiver<FleetSnapshot>,
    blacklist: Arc<Blacklist>,
    router: Arc<NotificationRouter>,
}

impl DigestScheduler {
    pub fn new(
        plans: Vec<DigestPlan>,
        snapshot: watch::Receiver<FleetSnapshot>,
        blacklist: Arc<Blacklist>,
        router: Arc<NotificationRouter>,
    ) -> Self {
        Self {
            plans,
            snapshot,
            blacklist,
            router,
        }
    }

    /// Run the scheduler loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.plans.is_empty() {
            tracing::debug!("No digest schedules configured");
            return;
        }
        let mut interval = tokio::time::interval(DIGEST_CHECK_INTERVAL);
        let mut last_sent: Vec<Option<NaiveDate>> = vec![None; self.plans.len()];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Digest scheduler cancelled");
                    break;
                }
                _ = interval.tick() => {
                    self.tick(Local::now().naive_local(), &mut last_sent).await;
                }
            }
        }
    }

    /// Send every plan due at `now`. Returns how many messages went out.
    pub async fn tick(&self, now: NaiveDateTime, last_sent: &mut [Option<NaiveDate>]) -> usize {
        let mut sent = 0;
        for (plan, last) in self.plans.iter().zip(last_sent.iter_mut()) {
            if !is_due(plan, now, *last) {
                continue;
            }
            *last = Some(now.date());

            let style = self.router.style();
            let lines = {
                let snapshot = self.snapshot.borrow();
                overview_lines(plan.kind, &snapshot, &self.blacklist, style)
            };
            match render_overview(style.language, plan.days.len(), subject(plan.kind), &lines) {
                Some(message) => {
                    self.router.deliver(&message, None).await;
                    sent += 1;
                }
                None => tracing::debug!(kind = ?plan.kind, "Digest skipped, nothing to report"),
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveTime, Weekday};
    use fleetwatch_core::i18n::Language;
    use fleetwatch_core::reachability::DeviceStatus;
    use fleetwatch_core::record::{DeviceRecord, ExecutionMode, InstanceHealth, InstanceRecord, UnhealthyReason};

    use super::*;
    use crate::delivery::{MemoryChannel, NotificationChannel};
    use crate::sink::MemorySink;

    fn plan(kind: DigestKind, days: Vec<Weekday>) -> DigestPlan {
        DigestPlan {
            kind,
            time: NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
            days,
        }
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn style() -> MessageStyle {
        MessageStyle {
            language: Language::En,
            with_adapter_name: true,
        }
    }

    fn snapshot() -> FleetSnapshot {
        let mut snap = FleetSnapshot::default();
        let mut lamp = DeviceRecord::new("hue.0.lamp", "hue.0.lamp.reachable", "hue", "Hue", "hue.0");
        lamp.name = "Lamp".into();
        lamp.apply_status(DeviceStatus::Offline, Some("2 hours".into()));
        snap.devices.insert(lamp.device_path.clone(), lamp);

        let mut zigbee = InstanceRecord::new("zigbee.0", "Zigbee", ExecutionMode::Continuous);
        zigbee.health = InstanceHealth::Unhealthy(UnhealthyReason::HostDisconnected);
        zigbee.status = "not connected to host".into();
        snap.instances.insert(zigbee.id.clone(), zigbee);
        snap
    }

    #[test]
    fn due_only_once_per_day_on_selected_days() {
        // 2024-05-06 is a Monday.
        let p = plan(DigestKind::Offline, vec![Weekday::Mon]);
        assert!(is_due(&p, at("2024-05-06 08:30:10"), None));
        assert!(!is_due(&p, at("2024-05-06 08:31:00"), None));
        assert!(!is_due(&p, at("2024-05-07 08:30:00"), None));
        let monday = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        assert!(!is_due(&p, at("2024-05-06 08:30:40"), Some(monday)));
    }

    #[test]
    fn lines_per_kind() {
        let snap = snapshot();
        let blacklist = Blacklist::default();
        assert_eq!(
            overview_lines(DigestKind::Offline, &snap, &blacklist, style()),
            vec!["Hue: Lamp (2 hours)"]
        );
        assert_eq!(
            overview_lines(DigestKind::ErrorInstances, &snap, &blacklist, style()),
            vec!["zigbee.0: not connected to host"]
        );
        assert!(overview_lines(DigestKind::LowBattery, &snap, &blacklist, style()).is_empty());
    }

    #[tokio::test]
    async fn tick_sends_due_non_empty_digests() {
        let memory = Arc::new(MemoryChannel::new());
        let channels: Vec<Arc<dyn NotificationChannel>> = vec![memory.clone()];
        let router = Arc::new(NotificationRouter::new(style(), channels, Arc::new(MemorySink::new())));
        let (_tx, rx) = watch::channel(snapshot());

        let scheduler = DigestScheduler::new(
            vec![
                plan(DigestKind::Offline, vec![Weekday::Mon]),
                plan(DigestKind::LowBattery, vec![Weekday::Mon]),
            ],
            rx,
            Arc::new(Blacklist::default()),
            router,
        );
        let mut last_sent = vec![None; 2];
        assert_eq!(scheduler.tick(at("2024-05-06 08:30:00"), &mut last_sent).await, 1);
        assert_eq!(scheduler.tick(at("2024-05-06 08:30:30"), &mut last_sent).await, 0);

        assert_eq!(
            memory.messages().await,
            vec!["Weekly overview of offline devices:\nHue: Lamp (2 hours)".to_string()]
        );
    }
}
