use serde::{Deserialize, Serialize};

/// Scalar carried by readings, targets, thresholds and calibrations.
/// The variant is fixed by the reading type; the wire form is untagged.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Default for Value {
    fn default() -> Self {
        Self::Float(0.0)
    }
}

impl Value {
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(value),
            Self::Int(value) => Some(value as f64),
            Self::Bool(_) => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(value),
            _ => None,
        }
    }

    /// Published form: booleans go out as `0|1`, matching the envelope schema.
    pub fn wire(self) -> serde_json::Value {
        match self {
            Self::Bool(value) => serde_json::Value::from(u8::from(value)),
            Self::Int(value) => serde_json::Value::from(value),
            Self::Float(value) => serde_json::Value::from(value),
        }
    }
}

/// A value together with its free-form unit string.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Quantity {
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub unit: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireQuantity {
    pub value: serde_json::Value,
    pub unit: String,
}

impl WireQuantity {
    pub fn new(value: Value, unit: &str) -> Self {
        Self {
            value: value.wire(),
            unit: unit.to_string(),
        }
    }
}

/// Reading envelope published to `homes/<H>/zones/<Z>/devices/<D>/<type>`.
#[derive(Debug, Serialize)]
pub struct ReadingEnvelope {
    pub time: String,
    pub value: WireQuantity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<WireQuantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<WireQuantity>,
}

/// Comfort index derived from temperature (celsius) and relative humidity
/// (percent). Below the vapour-pressure cutoff the index equals the
/// temperature.
pub fn humidex(temperature: f64, humidity: f64) -> f64 {
    let exponent = 7.5 * temperature / (237.7 + temperature);
    let vapour_pressure = 6.112 * 10f64.powf(exponent) * (humidity / 100.0);

    if vapour_pressure > 10.0 {
        ((temperature + (vapour_pressure - 10.0) * 5.0 / 9.0) * 10.0).round() / 10.0
    } else {
        temperature
    }
}
