use serde::{Deserialize, Serialize};

use crate::value::{Quantity, Value};

/// Which way an actuator moves a reading when switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Increase,
    Decrease,
}

impl Direction {
    pub fn sign(self) -> i8 {
        match self {
            Self::Increase => 1,
            Self::Decrease => -1,
        }
    }
}

/// On an actuator: the sensor reading this device reacts to, and in which
/// direction its "on" state moves that reading.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRule {
    pub home: String,
    pub zone: String,
    pub device: String,
    pub reading_type: String,
    pub direction: Direction,
}

impl ChangeRule {
    pub fn from_config(config: ChangeRuleConfig, default_home: &str, default_zone: &str) -> Self {
        Self {
            home: config.home.unwrap_or_else(|| default_home.to_string()),
            zone: config.zone.unwrap_or_else(|| default_zone.to_string()),
            device: config.device,
            reading_type: config.reading_type,
            direction: config.direction,
        }
    }

    /// Empty `reading_type` reacts to every type the addressed device produces.
    pub fn matches(&self, home: &str, zone: &str, device: &str, reading_type: &str) -> bool {
        self.home == home
            && self.zone == zone
            && self.device == device
            && (self.reading_type.is_empty() || self.reading_type == reading_type)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRuleConfig {
    pub home: Option<String>,
    pub zone: Option<String>,
    #[serde(default)]
    pub device: String,
    #[serde(rename = "type", default)]
    pub reading_type: String,
    pub direction: Direction,
}

/// On a sensor: additive offset applied to raw readings of one type, and the
/// hysteresis band used when comparing the reading against its target.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub reading_type: String,
    pub offset: Quantity,
    pub threshold: Quantity,
}

impl Calibration {
    pub fn from_config(config: CalibrationConfig) -> Self {
        Self {
            reading_type: config.reading_type,
            offset: config.offset,
            threshold: config.threshold,
        }
    }

    pub fn matches(&self, reading_type: &str) -> bool {
        self.reading_type == reading_type
    }

    pub fn adjust(&self, value: f64) -> f64 {
        value + self.offset.value.as_f64().unwrap_or(0.0)
    }

    pub fn threshold_value(&self) -> f64 {
        self.threshold.value.as_f64().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationConfig {
    #[serde(rename = "type", default)]
    pub reading_type: String,
    #[serde(rename = "calibration", default)]
    pub offset: Quantity,
    #[serde(default)]
    pub threshold: Quantity,
}

/// Inclusive hysteresis test. Booleans are on target iff equal; numeric and
/// boolean operands never compare against each other.
pub fn within_band(value: Value, target: Value, threshold: f64) -> Option<bool> {
    if let (Some(value), Some(target)) = (value.as_bool(), target.as_bool()) {
        return Some(value == target);
    }

    let value = value.as_f64()?;
    let target = target.as_f64()?;
    Some(value >= target - threshold && value <= target + threshold)
}

/// Sign of the deviation: does the reading need to rise to meet the target?
/// Booleans order as `false < true`.
pub fn wants_increase(value: Value, target: Value) -> Option<bool> {
    if let (Some(value), Some(target)) = (value.as_bool(), target.as_bool()) {
        return Some(!value && target);
    }

    let value = value.as_f64()?;
    let target = target.as_f64()?;
    Some(value < target)
}

pub fn drives_on(direction: Direction, wants_increase: bool) -> bool {
    (direction.sign() > 0) == wants_increase
}
