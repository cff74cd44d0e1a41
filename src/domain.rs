//! ==============================================================================
//! domain.rs - readings produced by sensor sources
//! ==============================================================================
//!
//! a reading is one poll of one sensor. invalid readings still carry their
//! sensor identity so the aggregator can count what it drops.
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use std::fmt;

/// which physical sensor class produced a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    /// bme280 temperature / humidity
    Climate,
    /// k30 co2
    Co2,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Climate => write!(f, "climate"),
            SensorKind::Co2 => write!(f, "co2"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
}

impl FieldValue {
    fn is_finite(&self) -> bool {
        match self {
            FieldValue::Float(v) => v.is_finite(),
            FieldValue::Int(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
}

impl Field {
    pub fn float(name: &str, value: f64) -> Self {
        Self { name: name.to_string(), value: FieldValue::Float(value) }
    }

    pub fn int(name: &str, value: i64) -> Self {
        Self { name: name.to_string(), value: FieldValue::Int(value) }
    }
}

/// one poll of one sensor
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub kind: SensorKind,
    /// value of the `sensor` tag (e.g. "bme_280")
    pub sensor: String,
    /// field order is emission order
    pub fields: Vec<Field>,
    /// unix epoch nanoseconds
    pub timestamp_ns: i64,
    pub valid: bool,
}

impl Reading {
    /// A reading with values. Marked invalid if any value is non-finite.
    pub fn new(kind: SensorKind, sensor: &str, fields: Vec<Field>, at: DateTime<Utc>) -> Self {
        let valid = !fields.is_empty() && fields.iter().all(|f| f.value.is_finite());
        Self {
            kind,
            sensor: sensor.to_string(),
            fields,
            timestamp_ns: epoch_nanos(at),
            valid,
        }
    }

    pub fn invalid(kind: SensorKind, sensor: &str, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            sensor: sensor.to_string(),
            fields: Vec::new(),
            timestamp_ns: epoch_nanos(at),
            valid: false,
        }
    }
}

/// nanoseconds since the unix epoch, saturating outside chrono's i64 range
pub fn epoch_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_reading_valid_when_values_finite() {
        let at = Utc.timestamp_opt(1_700_000_000, 5).unwrap();
        let r = Reading::new(
            SensorKind::Climate,
            "bme_280",
            vec![Field::float("temp_c", 21.5), Field::float("humidity", 40.0)],
            at,
        );
        assert!(r.valid);
        assert_eq!(r.timestamp_ns, 1_700_000_000_000_000_005);
    }

    #[test]
    fn test_reading_invalid_on_nan() {
        let r = Reading::new(
            SensorKind::Climate,
            "bme_280",
            vec![Field::float("temp_c", f64::NAN)],
            Utc::now(),
        );
        assert!(!r.valid);
    }

    #[test]
    fn test_reading_without_fields_is_invalid() {
        let r = Reading::new(SensorKind::Co2, "k_30", vec![], Utc::now());
        assert!(!r.valid);
        assert!(!Reading::invalid(SensorKind::Co2, "k_30", Utc::now()).valid);
    }
}
