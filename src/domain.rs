//! ```text
//! ==============================================================================
//! domain.rs - wire-level telemetry types
//! ==============================================================================
//!
//! purpose:
//!     the vocabulary shared by the publisher and the subscriber:
//!     sensor keys, measurement values and the json envelope that carries
//!     one publish cycle over the bus.
//!
//! wire format:
//!
//!     {"timestamp": "2025-01-01T12:00:00.000000Z",
//!      "sbc0/owb0/ts0": 0.08,
//!      "sbc0/owb0/ts1": "01.08"}
//!
//!     - `timestamp` is optional
//!     - every other field is one measurement, either a json number or a
//!       zero-padded decimal string; readers accept both
//!
//! ==============================================================================
//! ```

use crate::error::{Result, TelemetryError};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const TIMESTAMP_FIELD: &str = "timestamp";

/// `"<device>/owb<bus>/ts<sensor>"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SensorKey(String);

impl SensorKey {
    pub fn new(device: &str, bus: u32, sensor: u32) -> Self {
        Self(format!("{}/owb{}/ts{}", device, bus, sensor))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// last path segment, e.g. `ts0` - what fits on a 64px wide panel
    pub fn short_label(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl FromStr for SensorKey {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(TelemetryError::Configuration("sensor key must not be empty".into()));
        }
        if trimmed == TIMESTAMP_FIELD {
            return Err(TelemetryError::Configuration(format!(
                "'{}' is reserved and cannot be used as a sensor key",
                TIMESTAMP_FIELD
            )));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for SensorKey {
    type Error = TelemetryError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<SensorKey> for String {
    fn from(key: SensorKey) -> Self {
        key.0
    }
}

impl fmt::Display for SensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// how generated values are put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueFormat {
    /// json number rounded to 3 decimals
    #[default]
    Numeric,
    /// `"%05.2f"` string, e.g. `"07.40"`
    ZeroPadded,
}

impl FromStr for ValueFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "numeric" => Ok(ValueFormat::Numeric),
            "zero-padded" => Ok(ValueFormat::ZeroPadded),
            other => Err(TelemetryError::Configuration(format!(
                "unknown value format '{}' (expected numeric or zero-padded)",
                other
            ))),
        }
    }
}

/// a single reading as it travels on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MeasurementValue {
    Number(f64),
    Text(String),
}

impl MeasurementValue {
    /// round to 3 decimals, then encode per `format`
    pub fn encode(value: f64, format: ValueFormat) -> Self {
        let rounded = round3(value);
        match format {
            ValueFormat::Numeric => MeasurementValue::Number(rounded),
            ValueFormat::ZeroPadded => MeasurementValue::Text(format!("{:05.2}", rounded)),
        }
    }

    /// numeric view of either representation
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MeasurementValue::Number(v) => Some(*v),
            MeasurementValue::Text(s) => s.trim().parse().ok(),
        }
    }

    fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(MeasurementValue::Number),
            serde_json::Value::String(s) => Some(MeasurementValue::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for MeasurementValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementValue::Number(v) => write!(f, "{}", v),
            MeasurementValue::Text(s) => f.write_str(s),
        }
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub key: SensorKey,
    pub value: MeasurementValue,
}

/// one publish cycle: optional timestamp plus measurements in generation order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    pub timestamp: Option<String>,
    pub measurements: Vec<Measurement>,
}

impl Envelope {
    pub fn push(&mut self, key: SensorKey, value: MeasurementValue) {
        self.measurements.push(Measurement { key, value });
    }

    /// stamp with the current utc time, `...Z` suffix
    pub fn stamp_now(&mut self) {
        self.timestamp = Some(
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        );
    }

    pub fn get(&self, key: &SensorKey) -> Option<&MeasurementValue> {
        self.measurements
            .iter()
            .find(|m| &m.key == key)
            .map(|m| &m.value)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// parse an inbound payload
    ///
    /// the payload must be a json object. fields whose value is neither a
    /// number nor a string carry nothing we can display and are skipped.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let root: serde_json::Value = serde_json::from_slice(payload)?;
        let serde_json::Value::Object(fields) = root else {
            return Err(TelemetryError::Protocol("payload is not a json object".into()));
        };

        let mut envelope = Envelope::default();
        for (name, value) in fields {
            if name == TIMESTAMP_FIELD {
                match value {
                    serde_json::Value::String(ts) => envelope.timestamp = Some(ts),
                    serde_json::Value::Null => {}
                    _ => {
                        return Err(TelemetryError::Protocol(
                            "timestamp field is not a string".into(),
                        ))
                    }
                }
                continue;
            }
            let Ok(key) = name.parse::<SensorKey>() else {
                continue;
            };
            if let Some(value) = MeasurementValue::from_json(&value) {
                envelope.push(key, value);
            }
        }
        Ok(envelope)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = self.measurements.len() + usize::from(self.timestamp.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        if let Some(ts) = &self.timestamp {
            map.serialize_entry(TIMESTAMP_FIELD, ts)?;
        }
        for m in &self.measurements {
            map.serialize_entry(m.key.as_str(), &m.value)?;
        }
        map.end()
    }
}
