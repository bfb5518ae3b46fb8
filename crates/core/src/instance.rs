//! Instance health derivation and the two-stage confirmation debounce.
//!
//! Continuous instances are healthy once their heartbeat, host connection and
//! device connection all hold. Negative observations are not committed right
//! away: a confirmation re-checks the instance after half of the relevant
//! timeout and again after the second half, and only a negative result both
//! times commits. Any positive observation commits immediately and cancels a
//! pending confirmation.
//!
//! The debounce here is pure; callers own the timers and feed expirations back
//! through [`Debounce::timer_fired`]. Stale timers are recognized by their
//! generation number.

use std::time::Duration;

use chrono::{DateTime, TimeZone};

use crate::cron::CronSchedule;
use crate::i18n::{text, Language, Phrase};
use crate::record::{HealthKind, InstanceHealth, UnhealthyReason};
use crate::types::Timestamp;

/// Tolerance between a scheduled fire time and the heartbeat change it caused.
pub const SCHEDULE_TOLERANCE_SECS: i64 = 300;

/// Raw connectivity observed for one continuous instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observation {
    pub heartbeat: Option<bool>,
    pub host: Option<bool>,
    /// `None` when the instance has no device-connection field.
    pub device: Option<bool>,
}

impl Observation {
    pub fn evaluate(&self) -> InstanceHealth {
        if self.heartbeat != Some(true) {
            return InstanceHealth::Deactivated;
        }
        if self.host != Some(true) {
            return InstanceHealth::Unhealthy(UnhealthyReason::HostDisconnected);
        }
        if self.device == Some(false) {
            return InstanceHealth::Unhealthy(UnhealthyReason::DeviceDisconnected);
        }
        InstanceHealth::Healthy
    }
}

/// Health of a scheduled instance at `now`.
///
/// Healthy when the heartbeat last changed no more than five minutes before
/// the most recent scheduled run. No heartbeat or no previous run means
/// deactivated.
pub fn evaluate_scheduled<Tz: TimeZone>(
    now: &DateTime<Tz>,
    schedule: &CronSchedule,
    heartbeat_changed: Option<Timestamp>,
) -> InstanceHealth {
    let Some(changed) = heartbeat_changed else {
        return InstanceHealth::Deactivated;
    };
    let Some(previous_run) = schedule.previous_fire(now) else {
        return InstanceHealth::Deactivated;
    };

    let since_run = now.clone().signed_duration_since(previous_run).num_seconds();
    let since_change = now.clone().signed_duration_since(changed).num_seconds();
    if since_run - since_change > -SCHEDULE_TOLERANCE_SECS {
        InstanceHealth::Healthy
    } else {
        InstanceHealth::Deactivated
    }
}

/// Localized status line for a committed health.
pub fn status_text(health: InstanceHealth, lang: Language) -> &'static str {
    let phrase = match health {
        InstanceHealth::Healthy => Phrase::InstanceOkay,
        InstanceHealth::Unhealthy(UnhealthyReason::HostDisconnected) => Phrase::NotConnectedHost,
        InstanceHealth::Unhealthy(UnhealthyReason::DeviceDisconnected) => {
            Phrase::NotConnectedDevice
        }
        InstanceHealth::Deactivated => Phrase::InstanceDeactivated,
    };
    text(lang, phrase)
}

// ---------------------------------------------------------------------------
// Confirmation debounce
// ---------------------------------------------------------------------------

/// Full confirmation timeouts; each stage waits half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationTimeouts {
    pub deactivation: Duration,
    pub error: Duration,
}

impl ConfirmationTimeouts {
    fn stage_delay(&self, target: HealthKind) -> Duration {
        match target {
            HealthKind::Deactivated => self.deactivation / 2,
            _ => self.error / 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    First,
    Second,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Confirmation {
    #[default]
    Idle,
    Pending {
        target: HealthKind,
        stage: Stage,
        generation: u64,
    },
}

/// What the timer owner must do after a debounce step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    Keep,
    Cancel,
    /// Replace any running timer with one firing after `delay`.
    Arm { delay: Duration, generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// New committed health, when it changes.
    pub commit: Option<InstanceHealth>,
    pub timer: TimerCommand,
}

impl Step {
    fn none() -> Self {
        Self {
            commit: None,
            timer: TimerCommand::Keep,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Debounce {
    state: Confirmation,
    next_generation: u64,
}

impl Debounce {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Confirmation {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, Confirmation::Pending { .. })
    }

    /// Feed a fresh observation.
    pub fn observe(
        &mut self,
        committed: InstanceHealth,
        observed: InstanceHealth,
        timeouts: &ConfirmationTimeouts,
    ) -> Step {
        let cancel = if self.is_pending() {
            TimerCommand::Cancel
        } else {
            TimerCommand::Keep
        };

        if observed.kind() == committed.kind() {
            // Back to (or still at) the committed state. A changed reason is
            // committed without confirmation.
            self.state = Confirmation::Idle;
            return Step {
                commit: (observed != committed).then_some(observed),
                timer: cancel,
            };
        }

        if observed.is_healthy() {
            self.state = Confirmation::Idle;
            return Step {
                commit: Some(observed),
                timer: cancel,
            };
        }

        match self.state {
            Confirmation::Pending { target, .. } if target == observed.kind() => Step::none(),
            _ => self.start(observed.kind(), timeouts),
        }
    }

    /// A confirmation timer expired. `observed` is the freshly re-derived
    /// health.
    pub fn timer_fired(
        &mut self,
        generation: u64,
        committed: InstanceHealth,
        observed: InstanceHealth,
        timeouts: &ConfirmationTimeouts,
    ) -> Step {
        let Confirmation::Pending {
            target,
            stage,
            generation: current,
        } = self.state
        else {
            return Step::none();
        };
        if current != generation {
            return Step::none();
        }

        if observed.is_healthy() || observed.kind() == committed.kind() {
            self.state = Confirmation::Idle;
            return Step {
                commit: (observed != committed).then_some(observed),
                timer: TimerCommand::Keep,
            };
        }

        if observed.kind() != target {
            return self.start(observed.kind(), timeouts);
        }

        match stage {
            Stage::First => {
                let generation = self.bump();
                self.state = Confirmation::Pending {
                    target,
                    stage: Stage::Second,
                    generation,
                };
                Step {
                    commit: None,
                    timer: TimerCommand::Arm {
                        delay: timeouts.stage_delay(target),
                        generation,
                    },
                }
            }
            Stage::Second => {
                self.state = Confirmation::Idle;
                Step {
                    commit: Some(observed),
                    timer: TimerCommand::Keep,
                }
            }
        }
    }

    /// Drop any pending confirmation.
    pub fn reset(&mut self) -> TimerCommand {
        let was_pending = self.is_pending();
        self.state = Confirmation::Idle;
        if was_pending {
            TimerCommand::Cancel
        } else {
            TimerCommand::Keep
        }
    }

    fn start(&mut self, target: HealthKind, timeouts: &ConfirmationTimeouts) -> Step {
        let generation = self.bump();
        self.state = Confirmation::Pending {
            target,
            stage: Stage::First,
            generation,
        };
        Step {
            commit: None,
            timer: TimerCommand::Arm {
                delay: timeouts.stage_delay(target),
                generation,
            },
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};

    use super::*;

    const HOST_DOWN: InstanceHealth = InstanceHealth::Unhealthy(UnhealthyReason::HostDisconnected);

    fn timeouts() -> ConfirmationTimeouts {
        ConfirmationTimeouts {
            deactivation: Duration::from_secs(120),
            error: Duration::from_secs(60),
        }
    }

    #[test]
    fn continuous_evaluation() {
        let all = Observation {
            heartbeat: Some(true),
            host: Some(true),
            device: Some(true),
        };
        assert_eq!(all.evaluate(), InstanceHealth::Healthy);

        let no_device_field = Observation {
            device: None,
            ..all
        };
        assert_eq!(no_device_field.evaluate(), InstanceHealth::Healthy);

        let host_down = Observation {
            host: Some(false),
            ..all
        };
        assert_eq!(host_down.evaluate(), HOST_DOWN);

        let device_down = Observation {
            device: Some(false),
            ..all
        };
        assert_eq!(
            device_down.evaluate(),
            InstanceHealth::Unhealthy(UnhealthyReason::DeviceDisconnected)
        );

        assert_eq!(Observation::default().evaluate(), InstanceHealth::Deactivated);
    }

    #[test]
    fn scheduled_tolerance() {
        let schedule = CronSchedule::parse("0 * * * *").unwrap();
        let now = NaiveDateTime::parse_from_str("2024-03-10 12:20:00", "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc();

        // Ran at 12:00:30, shortly after the 12:00 fire.
        let recent = now - ChronoDuration::minutes(19) - ChronoDuration::seconds(30);
        assert_eq!(evaluate_scheduled(&now, &schedule, Some(recent)), InstanceHealth::Healthy);

        // Four minutes before the fire still counts.
        let early = now - ChronoDuration::minutes(24);
        assert_eq!(evaluate_scheduled(&now, &schedule, Some(early)), InstanceHealth::Healthy);

        // Last heartbeat change before the 11:00 run.
        let stale = now - ChronoDuration::minutes(90);
        assert_eq!(
            evaluate_scheduled(&now, &schedule, Some(stale)),
            InstanceHealth::Deactivated
        );
        assert_eq!(evaluate_scheduled(&Utc::now(), &schedule, None), InstanceHealth::Deactivated);
    }

    #[test]
    fn negative_needs_two_stages() {
        let mut d = Debounce::new();
        let t = timeouts();

        let step = d.observe(InstanceHealth::Healthy, HOST_DOWN, &t);
        assert_eq!(step.commit, None);
        let first = assert_matches!(step.timer, TimerCommand::Arm { delay, generation } => {
            assert_eq!(delay, Duration::from_secs(30));
            generation
        });

        let step = d.timer_fired(first, InstanceHealth::Healthy, HOST_DOWN, &t);
        assert_eq!(step.commit, None);
        let second = assert_matches!(step.timer, TimerCommand::Arm { generation, .. } => generation);
        assert_ne!(first, second);

        let step = d.timer_fired(second, InstanceHealth::Healthy, HOST_DOWN, &t);
        assert_eq!(step.commit, Some(HOST_DOWN));
        assert!(!d.is_pending());
    }

    #[test]
    fn positive_cancels_pending_confirmation() {
        let mut d = Debounce::new();
        let t = timeouts();
        d.observe(InstanceHealth::Healthy, HOST_DOWN, &t);

        let step = d.observe(InstanceHealth::Healthy, InstanceHealth::Healthy, &t);
        assert_eq!(step.commit, None);
        assert_eq!(step.timer, TimerCommand::Cancel);
        assert!(!d.is_pending());
    }

    #[test]
    fn recovery_at_timer_commits_recovered_state() {
        let mut d = Debounce::new();
        let t = timeouts();
        let step = d.observe(HOST_DOWN, InstanceHealth::Deactivated, &t);
        let generation = assert_matches!(step.timer, TimerCommand::Arm { delay, generation } => {
            assert_eq!(delay, Duration::from_secs(60));
            generation
        });

        let step = d.timer_fired(generation, HOST_DOWN, InstanceHealth::Healthy, &t);
        assert_eq!(step.commit, Some(InstanceHealth::Healthy));
    }

    #[test]
    fn different_negative_kind_restarts() {
        let mut d = Debounce::new();
        let t = timeouts();
        let step = d.observe(InstanceHealth::Healthy, HOST_DOWN, &t);
        let first = assert_matches!(step.timer, TimerCommand::Arm { generation, .. } => generation);

        let step = d.observe(InstanceHealth::Healthy, InstanceHealth::Deactivated, &t);
        let restarted = assert_matches!(step.timer, TimerCommand::Arm { delay, generation } => {
            assert_eq!(delay, Duration::from_secs(60));
            generation
        });
        assert_ne!(first, restarted);

        // The superseded timer is ignored.
        let step = d.timer_fired(first, InstanceHealth::Healthy, InstanceHealth::Deactivated, &t);
        assert_eq!(step, Step::none());
    }

    #[test]
    fn repeated_negative_keeps_running_timer() {
        let mut d = Debounce::new();
        let t = timeouts();
        d.observe(InstanceHealth::Healthy, HOST_DOWN, &t);
        let step = d.observe(
            InstanceHealth::Healthy,
            InstanceHealth::Unhealthy(UnhealthyReason::DeviceDisconnected),
            &t,
        );
        assert_eq!(step, Step::none());
    }

    #[test]
    fn status_lines() {
        assert_eq!(status_text(InstanceHealth::Healthy, Language::En), "ok");
        assert_eq!(
            status_text(InstanceHealth::Deactivated, Language::De),
            "Instanz deaktiviert"
        );
    }
}
