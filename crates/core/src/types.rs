use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All timestamps are UTC.
pub type Timestamp = DateTime<Utc>;

/// A raw telemetry value as reported by a source.
///
/// Sources are loosely typed: the same concept may arrive as a boolean, a
/// number or a string depending on the integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Loose truthiness: `false`, `0`, `NaN` and the empty string are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            FieldValue::Bool(b) => *b,
            FieldValue::Number(n) => *n != 0.0 && !n.is_nan(),
            FieldValue::Text(s) => !s.is_empty(),
        }
    }

    /// `true` when the value is the number `n` (strict, no string coercion).
    pub fn is_number(&self, n: f64) -> bool {
        matches!(self, FieldValue::Number(v) if *v == n)
    }

    pub fn is_text(&self, s: &str) -> bool {
        matches!(self, FieldValue::Text(v) if v == s)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Number(n) => write!(f, "{}", format_number(*n)),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

/// Render a number without a trailing `.0` for whole values.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Current value of a telemetry field plus its bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldState {
    /// The value; `None` when the field exists but carries no value.
    pub val: Option<FieldValue>,
    /// Last time the field was written (even with an unchanged value).
    pub ts: Timestamp,
    /// Last time the value actually changed.
    pub lc: Timestamp,
}

impl FieldState {
    pub fn new(val: impl Into<FieldValue>, ts: Timestamp) -> Self {
        Self {
            val: Some(val.into()),
            ts,
            lc: ts,
        }
    }

    pub fn with_last_change(mut self, lc: Timestamp) -> Self {
        self.lc = lc;
        self
    }
}

/// Metadata of a telemetry object (device folder, channel, instance object).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Human display name (`common.name`).
    pub name: Option<String>,
    /// Remaining `common` attributes (`version`, `mode`, `schedule`, ...).
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: serde_json::Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

/// Whole minutes elapsed between `since` and `now`, rounded to nearest.
pub fn minutes_since(now: Timestamp, since: Timestamp) -> i64 {
    let ms = now.signed_duration_since(since).num_milliseconds();
    (ms as f64 / 60_000.0).round() as i64
}

/// Uppercase the first character (`zigbee` -> `Zigbee`).
pub fn capitalize(id: &str) -> String {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
