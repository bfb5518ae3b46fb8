//! Battery normalizer.
//!
//! Two regimes exist. Most sources report a percentage (or a coarse text
//! level) and optionally a low-battery flag. Homematic classic reports an
//! operating voltage plus a numeric fault code, where fault `6` and low-bat
//! `1` mean "battery low".

use std::fmt;

use serde::{Serialize, Serializer};

use crate::types::{format_number, FieldValue};

/// Fault-report code meaning "low battery" in the voltage regime.
const FAULT_LOW_BATTERY: f64 = 6.0;
/// Upper bound of a plausible cell voltage.
const MAX_VOLTAGE: f64 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatteryRegime {
    #[default]
    Percent,
    Voltage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatteryUnit {
    #[serde(rename = "%")]
    Percent,
    #[serde(rename = "V")]
    Volt,
}

impl fmt::Display for BatteryUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatteryUnit::Percent => f.write_str("%"),
            BatteryUnit::Volt => f.write_str("V"),
        }
    }
}

/// Health label shown for a device.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum BatteryHealth {
    /// Rendered as `-`.
    #[default]
    Unknown,
    Ok,
    Low,
    Level { value: f64, unit: BatteryUnit },
}

impl fmt::Display for BatteryHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatteryHealth::Unknown => f.write_str("-"),
            BatteryHealth::Ok => f.write_str("ok"),
            BatteryHealth::Low => f.write_str("low"),
            BatteryHealth::Level { value, unit } => write!(f, "{}{unit}", format_number(*value)),
        }
    }
}

impl Serialize for BatteryHealth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BatteryReading {
    pub health: BatteryHealth,
    pub is_battery_device: bool,
}

impl BatteryReading {
    pub fn raw(&self) -> Option<f64> {
        match self.health {
            BatteryHealth::Level { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn unit(&self) -> Option<BatteryUnit> {
        match self.health {
            BatteryHealth::Level { unit, .. } => Some(unit),
            _ => None,
        }
    }

    fn battery(health: BatteryHealth) -> Self {
        Self {
            health,
            is_battery_device: true,
        }
    }

    fn none() -> Self {
        Self::default()
    }
}

/// Raw inputs to the battery normalizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatteryInputs<'a> {
    pub battery: Option<&'a FieldValue>,
    pub low_bat: Option<&'a FieldValue>,
    pub fault: Option<&'a FieldValue>,
}

pub fn battery_reading(regime: BatteryRegime, inputs: BatteryInputs<'_>) -> BatteryReading {
    match regime {
        BatteryRegime::Percent => percent_regime(inputs),
        BatteryRegime::Voltage => voltage_regime(inputs),
    }
}

fn percent_regime(inputs: BatteryInputs<'_>) -> BatteryReading {
    match inputs.battery {
        None => match inputs.low_bat {
            None => BatteryReading::none(),
            Some(flag) if signals_low(flag) => BatteryReading::battery(BatteryHealth::Low),
            Some(_) => BatteryReading::battery(BatteryHealth::Ok),
        },
        Some(FieldValue::Number(n)) => BatteryReading::battery(BatteryHealth::Level {
            value: *n,
            unit: BatteryUnit::Percent,
        }),
        Some(FieldValue::Text(level)) => match level.as_str() {
            "high" | "medium" => BatteryReading::battery(BatteryHealth::Ok),
            "low" => BatteryReading::battery(BatteryHealth::Low),
            _ => BatteryReading::none(),
        },
        Some(FieldValue::Bool(_)) => BatteryReading::none(),
    }
}

/// Low-battery field values that mean "low" when no level is reported.
/// `"NORMAL"` is inverted on the sources that use it.
fn signals_low(flag: &FieldValue) -> bool {
    matches!(flag, FieldValue::Bool(true)) || flag.is_text("NORMAL") || flag.is_number(1.0)
}

fn voltage_regime(inputs: BatteryInputs<'_>) -> BatteryReading {
    match inputs.battery {
        None => {
            if inputs
                .fault
                .is_some_and(|code| !code.is_number(FAULT_LOW_BATTERY))
            {
                BatteryReading::battery(BatteryHealth::Ok)
            } else if let Some(flag) = inputs.low_bat {
                if flag.is_number(1.0) {
                    BatteryReading::battery(BatteryHealth::Low)
                } else {
                    BatteryReading::battery(BatteryHealth::Ok)
                }
            } else {
                BatteryReading::none()
            }
        }
        Some(FieldValue::Number(volts)) if *volts != 0.0 && *volts < MAX_VOLTAGE => {
            BatteryReading::battery(BatteryHealth::Level {
                value: *volts,
                unit: BatteryUnit::Volt,
            })
        }
        Some(_) => BatteryReading::none(),
    }
}

/// Low-battery indicator.
///
/// An explicit low-bat or fault field decides when present; otherwise the
/// level is compared against `min_percent`.
pub fn is_low_battery(regime: BatteryRegime, inputs: BatteryInputs<'_>, min_percent: f64) -> bool {
    if inputs.low_bat.is_some() || inputs.fault.is_some() {
        return match regime {
            BatteryRegime::Voltage => {
                inputs
                    .low_bat
                    .is_some_and(|f| f.is_number(1.0) || matches!(f, FieldValue::Bool(true)))
                    || inputs.fault.is_some_and(|f| f.is_number(FAULT_LOW_BATTERY))
            }
            BatteryRegime::Percent => match inputs.low_bat {
                Some(FieldValue::Number(n)) => *n == 0.0,
                Some(FieldValue::Text(s)) => s != "NORMAL",
                Some(FieldValue::Bool(b)) => *b,
                None => false,
            },
        };
    }

    match inputs.battery {
        Some(FieldValue::Number(n)) => *n < min_percent,
        Some(FieldValue::Text(s)) => s == "low",
        _ => false,
    }
}
