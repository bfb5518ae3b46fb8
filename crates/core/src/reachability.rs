//! Reachability resolver: Online/Offline and the human "last contact" string.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::i18n::{text, Language, Phrase};
use crate::types::{minutes_since, FieldState, FieldValue, Timestamp};

/// Settle delay before a falsy presence flag is re-read.
pub const PRESENCE_SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DeviceStatus {
    #[default]
    Online,
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Online => f.write_str("Online"),
            DeviceStatus::Offline => f.write_str("Offline"),
        }
    }
}

/// When the unreachable field's value means "unreachable".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreachTest {
    /// Value is the number `1` (or `true`).
    One,
    Truthy,
    Falsy,
    /// Value is not one of the listed texts.
    NotAnyOf(&'static [&'static str]),
    /// Value equals the given text.
    Text(&'static str),
}

impl UnreachTest {
    pub fn is_unreachable(self, value: Option<&FieldValue>) -> bool {
        match self {
            UnreachTest::One => {
                value.is_some_and(|v| v.is_number(1.0) || matches!(v, FieldValue::Bool(true)))
            }
            UnreachTest::Truthy => value.is_some_and(FieldValue::is_truthy),
            UnreachTest::Falsy => !value.is_some_and(FieldValue::is_truthy),
            UnreachTest::NotAnyOf(accepted) => {
                !value.is_some_and(|v| accepted.iter().any(|a| v.is_text(a)))
            }
            UnreachTest::Text(expected) => value.is_some_and(|v| v.is_text(expected)),
        }
    }
}

/// Per-source offline decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReachabilityRule {
    /// Offline once unreachable for longer than the threshold.
    Unreachable(UnreachTest),
    /// Offline when the presence flag is falsy (instant threshold) or the time
    /// field went stale.
    #[default]
    Stale,
    /// Like [`ReachabilityRule::Stale`], but every offline verdict is
    /// confirmed by a second read of the presence flag.
    Confirmed,
}

/// Which timestamp the last-contact string is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LastContactBasis {
    #[default]
    Standard,
    /// Older radio devices don't report signal; use the state or peer field.
    RadioFallback,
}

/// Field states feeding one reachability decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReachabilityInputs<'a> {
    pub unreach: Option<&'a FieldState>,
    pub time: Option<&'a FieldState>,
    pub state: Option<&'a FieldState>,
    pub peer: Option<&'a FieldState>,
    /// Whether the source defines an unreachable field at all.
    pub has_unreach_field: bool,
    /// Whether the device reports a usable signal.
    pub signal_supported: bool,
}

impl ReachabilityInputs<'_> {
    fn unreach_value(&self) -> Option<&FieldValue> {
        self.unreach.and_then(|s| s.val.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Decided(DeviceStatus),
    /// Re-read the presence flag after `settle` and pass the result to
    /// [`confirm_offline`].
    Recheck { settle: Duration },
}

/// Elapsed minutes feeding the threshold comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Elapsed {
    pub since_unreach_change: Option<i64>,
    pub since_contact: Option<i64>,
}

impl Elapsed {
    pub fn measure(now: Timestamp, inputs: &ReachabilityInputs<'_>) -> Self {
        let since_unreach_change = match inputs.unreach {
            Some(unreach) => Some(minutes_since(now, unreach.lc)),
            None => inputs.time.map(|t| minutes_since(now, t.ts)),
        };
        Self {
            since_unreach_change,
            since_contact: inputs.time.map(|t| minutes_since(now, t.ts)),
        }
    }
}

/// Decide Online/Offline. `max_minutes <= 0` means any unreachable reading is
/// offline immediately.
pub fn decide(
    rule: ReachabilityRule,
    inputs: &ReachabilityInputs<'_>,
    elapsed: Elapsed,
    max_minutes: i64,
) -> Verdict {
    let instant = max_minutes <= 0;
    let exceeded = |minutes: Option<i64>| minutes.is_some_and(|m| m > max_minutes);
    let offline_if = |cond: bool| {
        Verdict::Decided(if cond {
            DeviceStatus::Offline
        } else {
            DeviceStatus::Online
        })
    };

    match rule {
        ReachabilityRule::Unreachable(test) => {
            let unreachable = test.is_unreachable(inputs.unreach_value());
            offline_if(unreachable && (instant || exceeded(elapsed.since_unreach_change)))
        }
        ReachabilityRule::Stale => {
            if instant {
                offline_if(!inputs.unreach_value().is_some_and(FieldValue::is_truthy))
            } else {
                offline_if(exceeded(elapsed.since_contact))
            }
        }
        ReachabilityRule::Confirmed => {
            let suspect = if instant {
                !inputs.unreach_value().is_some_and(FieldValue::is_truthy)
            } else {
                exceeded(elapsed.since_contact)
            };
            if !suspect {
                Verdict::Decided(DeviceStatus::Online)
            } else if instant {
                Verdict::Recheck {
                    settle: PRESENCE_SETTLE,
                }
            } else {
                Verdict::Recheck {
                    settle: Duration::ZERO,
                }
            }
        }
    }
}

/// Second read of a confirmed rule: offline only when the flag is still
/// missing or falsy.
pub fn confirm_offline(reread: Option<&FieldValue>) -> DeviceStatus {
    if reread.is_some_and(FieldValue::is_truthy) {
        DeviceStatus::Online
    } else {
        DeviceStatus::Offline
    }
}

// ---------------------------------------------------------------------------
// Last contact
// ---------------------------------------------------------------------------

/// Timestamp the last-contact string is measured from.
pub fn last_contact_basis(
    basis: LastContactBasis,
    unreach_test: Option<UnreachTest>,
    inputs: &ReachabilityInputs<'_>,
) -> Option<Timestamp> {
    if !inputs.has_unreach_field {
        return inputs.time.map(|t| t.ts);
    }

    match basis {
        LastContactBasis::RadioFallback => {
            if let (true, Some(time)) = (inputs.signal_supported, inputs.time) {
                let unreachable = unreach_test
                    .unwrap_or(UnreachTest::One)
                    .is_unreachable(inputs.unreach_value());
                Some(if unreachable { time.lc } else { time.ts })
            } else {
                inputs.state.or(inputs.peer).map(|s| s.ts)
            }
        }
        LastContactBasis::Standard => {
            let time = inputs.time?;
            if inputs.unreach_value().is_some_and(FieldValue::is_truthy) {
                Some(time.ts)
            } else {
                Some(time.lc)
            }
        }
    }
}

/// Render elapsed time as minutes, hours or days in `lang`.
pub fn format_last_contact(now: Timestamp, since: Timestamp, lang: Language) -> String {
    let minutes = minutes_since(now, since).max(0);
    let hours = (minutes as f64 / 60.0).round() as i64;
    if hours >= 48 {
        let days = (minutes as f64 / 60.0 / 24.0).round() as i64;
        format!("{days} {}", text(lang, Phrase::Days))
    } else if minutes >= 100 {
        format!("{hours} {}", text(lang, Phrase::Hours))
    } else {
        format!("{minutes} {}", text(lang, Phrase::Minutes))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};

    use super::*;

    fn field(val: impl Into<FieldValue>, minutes_ago: i64) -> FieldState {
        let at = Utc::now() - ChronoDuration::minutes(minutes_ago);
        FieldState::new(val, at)
    }

    fn inputs<'a>(unreach: Option<&'a FieldState>, time: Option<&'a FieldState>) -> ReachabilityInputs<'a> {
        ReachabilityInputs {
            unreach,
            time,
            has_unreach_field: true,
            signal_supported: true,
            ..Default::default()
        }
    }

    #[test]
    fn instant_threshold_ignores_elapsed() {
        let flag = field(false, 0);
        let i = inputs(Some(&flag), None);
        let rule = ReachabilityRule::Unreachable(UnreachTest::Falsy);
        assert_eq!(
            decide(rule, &i, Elapsed::measure(Utc::now(), &i), 0),
            Verdict::Decided(DeviceStatus::Offline)
        );
    }

    #[test]
    fn threshold_against_unreach_change() {
        let rule = ReachabilityRule::Unreachable(UnreachTest::Falsy);
        let stale = field(false, 45);
        let i = inputs(Some(&stale), None);
        assert_eq!(
            decide(rule, &i, Elapsed::measure(Utc::now(), &i), 30),
            Verdict::Decided(DeviceStatus::Offline)
        );

        let fresh = field(false, 10);
        let i = inputs(Some(&fresh), None);
        assert_eq!(
            decide(rule, &i, Elapsed::measure(Utc::now(), &i), 30),
            Verdict::Decided(DeviceStatus::Online)
        );
    }

    #[test]
    fn stale_rule_uses_time_field() {
        let time = field(12.0, 45);
        let i = inputs(None, Some(&time));
        assert_eq!(
            decide(ReachabilityRule::Stale, &i, Elapsed::measure(Utc::now(), &i), 30),
            Verdict::Decided(DeviceStatus::Offline)
        );
        assert_eq!(
            decide(ReachabilityRule::Stale, &i, Elapsed::measure(Utc::now(), &i), 60),
            Verdict::Decided(DeviceStatus::Online)
        );
    }

    #[test]
    fn stale_rule_absent_flag_is_offline_when_instant() {
        let i = inputs(None, None);
        assert_eq!(
            decide(ReachabilityRule::Stale, &i, Elapsed::default(), 0),
            Verdict::Decided(DeviceStatus::Offline)
        );
    }

    #[test]
    fn unreach_tests() {
        let one = FieldValue::Number(1.0);
        let running = FieldValue::Text("running".into());
        assert!(UnreachTest::One.is_unreachable(Some(&one)));
        assert!(!UnreachTest::One.is_unreachable(None));
        assert!(!UnreachTest::NotAnyOf(&["running", "online"]).is_unreachable(Some(&running)));
        assert!(UnreachTest::NotAnyOf(&["running", "online"]).is_unreachable(None));
        assert!(UnreachTest::Text("OFFLINE")
            .is_unreachable(Some(&FieldValue::Text("OFFLINE".into()))));
        assert!(UnreachTest::Falsy.is_unreachable(None));
    }

    #[test]
    fn confirmed_rule_asks_for_recheck() {
        let flag = field(false, 0);
        let i = inputs(Some(&flag), None);
        assert_eq!(
            decide(ReachabilityRule::Confirmed, &i, Elapsed::default(), 0),
            Verdict::Recheck {
                settle: PRESENCE_SETTLE
            }
        );
        assert_eq!(confirm_offline(Some(&FieldValue::Bool(true))), DeviceStatus::Online);
        assert_eq!(confirm_offline(None), DeviceStatus::Offline);

        let online = field(true, 0);
        let i = inputs(Some(&online), None);
        assert_eq!(
            decide(ReachabilityRule::Confirmed, &i, Elapsed::default(), 0),
            Verdict::Decided(DeviceStatus::Online)
        );
    }

    #[test]
    fn last_contact_units() {
        let now = Utc::now();
        let lang = Language::En;
        assert_eq!(format_last_contact(now, now - ChronoDuration::minutes(42), lang), "42 minutes");
        assert_eq!(format_last_contact(now, now - ChronoDuration::minutes(150), lang), "3 hours");
        assert_eq!(format_last_contact(now, now - ChronoDuration::hours(72), lang), "3 days");
        assert_eq!(
            format_last_contact(now, now - ChronoDuration::minutes(5), Language::De),
            "5 Minuten"
        );
    }

    #[test]
    fn radio_fallback_basis() {
        let now = Utc::now();
        let state = field(true, 7);
        let i = ReachabilityInputs {
            state: Some(&state),
            has_unreach_field: true,
            signal_supported: false,
            ..Default::default()
        };
        let basis = last_contact_basis(LastContactBasis::RadioFallback, Some(UnreachTest::One), &i);
        assert_eq!(basis.map(|b| minutes_since(now, b)), Some(7));
    }

    #[test]
    fn standard_basis_uses_last_change_when_reachable() {
        let reach = field(true, 0);
        let time = field(1.0, 20).with_last_change(Utc::now() - ChronoDuration::minutes(90));
        let i = inputs(Some(&reach), Some(&time));
        assert_eq!(
            last_contact_basis(LastContactBasis::Standard, None, &i),
            Some(time.ts)
        );

        let unreach = field(false, 0);
        let i = inputs(Some(&unreach), Some(&time));
        assert_eq!(
            last_contact_basis(LastContactBasis::Standard, None, &i),
            Some(time.lc)
        );
    }
}
