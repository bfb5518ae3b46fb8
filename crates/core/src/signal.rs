//! Signal normalizer: raw radio/link readings to a 0-100 % quality figure.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::types::{format_number, FieldValue};

/// How a source reports its signal field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalRule {
    /// Negative values are dBm, non-negative values are 0-255 link quality.
    #[default]
    Dbm,
    /// The source already reports 0-100.
    Percent,
    /// Numbers are shown unmodified.
    Passthrough,
    /// Text values are shown unmodified, numbers follow [`SignalRule::Dbm`].
    TextPassthrough,
    /// Text holding a dBm integer.
    TextDbm,
    /// The source's signal field carries nothing usable.
    Unsupported,
}

/// Derived signal quality as shown in lists.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SignalQuality {
    /// No signal field or an unusable value. Rendered as `-`.
    #[default]
    Unsupported,
    Percent(u32),
    /// Unmodified source value.
    Raw(String),
}

impl SignalQuality {
    /// Quality shown while the device is offline: any reading collapses to `0%`.
    pub fn forced_offline(&self) -> Self {
        match self {
            SignalQuality::Unsupported => SignalQuality::Unsupported,
            _ => SignalQuality::Percent(0),
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, SignalQuality::Unsupported)
    }
}

impl fmt::Display for SignalQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalQuality::Unsupported => f.write_str("-"),
            SignalQuality::Percent(p) => write!(f, "{p}%"),
            SignalQuality::Raw(raw) => f.write_str(raw),
        }
    }
}

impl Serialize for SignalQuality {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Quality plus the numeric figure it was computed as.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SignalReading {
    pub quality: SignalQuality,
    pub raw: Option<f64>,
}

impl SignalReading {
    fn unsupported() -> Self {
        Self::default()
    }

    fn percent(value: f64) -> Self {
        Self {
            quality: SignalQuality::Percent(value as u32),
            raw: Some(value),
        }
    }

    fn raw(text: String) -> Self {
        Self {
            quality: SignalQuality::Raw(text),
            raw: None,
        }
    }
}

/// Normalize one signal reading.
///
/// `passthrough` is the global "show raw values" switch; it wins over every
/// per-source rule for numeric values.
pub fn normalize_signal(
    value: Option<&FieldValue>,
    rule: SignalRule,
    passthrough: bool,
) -> SignalReading {
    let Some(value) = value else {
        return SignalReading::unsupported();
    };
    if rule == SignalRule::Unsupported {
        return SignalReading::unsupported();
    }

    match value {
        FieldValue::Number(n) => {
            if passthrough {
                return SignalReading::raw(format_number(*n));
            }
            match rule {
                // Whole percent within 0-100; passthrough keeps the raw number.
                SignalRule::Percent => SignalReading::percent(n.round().clamp(0.0, 100.0)),
                SignalRule::Passthrough => SignalReading::raw(format_number(*n)),
                _ => from_link_value(*n),
            }
        }
        FieldValue::Text(text) => match rule {
            SignalRule::TextPassthrough => SignalReading::raw(text.clone()),
            SignalRule::TextDbm => {
                if passthrough {
                    return SignalReading::raw(text.clone());
                }
                match leading_integer(text) {
                    Some(dbm) if dbm < 0 => SignalReading::percent(dbm_to_percent(dbm as f64)),
                    _ => SignalReading::raw(text.clone()),
                }
            }
            _ => SignalReading::unsupported(),
        },
        FieldValue::Bool(_) => SignalReading::unsupported(),
    }
}

fn from_link_value(n: f64) -> SignalReading {
    if n <= -255.0 {
        SignalReading::unsupported()
    } else if n < 0.0 {
        SignalReading::percent(dbm_to_percent(n))
    } else {
        SignalReading::percent((n * 100.0 / 255.0).round())
    }
}

fn dbm_to_percent(dbm: f64) -> f64 {
    (2.0 * (dbm + 100.0)).clamp(0.0, 100.0)
}

/// Integer prefix of a string (`"-67 dBm"` -> `-67`).
fn leading_integer(text: &str) -> Option<i64> {
    let trimmed = text.trim_start();
    let end = trimmed
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().ok()
}
