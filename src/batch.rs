//! ==============================================================================
//! batch.rs - batch aggregation and wire serialization
//! ==============================================================================
//!
//! one sampling window produces one Batch. valid readings are kept in
//! collection order; invalid ones are counted and dropped.
//!
//! two wire formats, both newline-joined, one record per reading:
//!
//!     line:  measurement,sensor=bme_280 temp_c=21.50,humidity=40.00 1700000000000000000
//!     json:  {"measurement":"m","tags":{"sensor":"bme_280"},"fields":{"temp_c":21.5},"time":1700000000000000000}
//!
//! serialization is a pure function of (batch, format, aggregator settings).
//! tags are sorted by key, fields keep emission order.
//!
//! ==============================================================================

use crate::domain::{Field, FieldValue, Reading};

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum Format {
    #[default]
    #[serde(rename = "line", alias = "line-protocol")]
    LineProtocol,
    #[serde(rename = "json", alias = "structured")]
    Structured,
}

/// readings from one sampling window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    readings: Vec<Reading>,
    dropped: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// invalid readings rejected since this batch was created
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }
}

pub struct BatchAggregator {
    measurement: String,
    /// static tags added to every record; the reading's `sensor` tag wins on clash
    tags: BTreeMap<String, String>,
    dropped_total: u64,
}

impl BatchAggregator {
    pub fn new(measurement: &str, tags: BTreeMap<String, String>) -> Self {
        Self {
            measurement: measurement.to_string(),
            tags,
            dropped_total: 0,
        }
    }

    pub fn new_batch(&self) -> Batch {
        Batch::default()
    }

    /// Append `reading` if it is valid. Returns whether it was kept.
    pub fn append(&mut self, batch: &mut Batch, reading: Reading) -> bool {
        if !reading.valid {
            batch.dropped += 1;
            self.dropped_total += 1;
            debug!(
                sensor = %reading.sensor,
                kind = %reading.kind,
                dropped_total = self.dropped_total,
                "dropped invalid reading"
            );
            return false;
        }
        batch.readings.push(reading);
        true
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    pub fn serialize(&self, batch: &Batch, format: Format) -> Vec<u8> {
        let lines: Vec<String> = batch
            .readings
            .iter()
            .map(|r| match format {
                Format::LineProtocol => self.line_record(r),
                Format::Structured => self.json_record(r),
            })
            .collect();
        lines.join("\n").into_bytes()
    }

    fn record_tags<'a>(&'a self, reading: &'a Reading) -> BTreeMap<&'a str, &'a str> {
        let mut tags: BTreeMap<&str, &str> =
            self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        tags.insert("sensor", reading.sensor.as_str());
        tags
    }

    fn line_record(&self, reading: &Reading) -> String {
        let mut out = escape_measurement(&self.measurement);
        for (k, v) in self.record_tags(reading) {
            out.push(',');
            out.push_str(&escape_key(k));
            out.push('=');
            out.push_str(&escape_key(v));
        }

        let fields: Vec<String> = reading
            .fields
            .iter()
            .map(|f| {
                let value = match f.value {
                    FieldValue::Float(v) => format!("{:.2}", v),
                    FieldValue::Int(v) => v.to_string(),
                };
                format!("{}={}", escape_key(&f.name), value)
            })
            .collect();

        out.push(' ');
        out.push_str(&fields.join(","));
        out.push(' ');
        out.push_str(&reading.timestamp_ns.to_string());
        out
    }

    fn json_record(&self, reading: &Reading) -> String {
        let record = StructuredRecord {
            measurement: &self.measurement,
            tags: self.record_tags(reading),
            fields: OrderedFields(&reading.fields),
            time: reading.timestamp_ns,
        };
        // only strings, finite numbers and maps; serde_json cannot fail on these
        serde_json::to_string(&record).unwrap_or_default()
    }
}

#[derive(Serialize)]
struct StructuredRecord<'a> {
    measurement: &'a str,
    tags: BTreeMap<&'a str, &'a str>,
    fields: OrderedFields<'a>,
    time: i64,
}

struct OrderedFields<'a>(&'a [Field]);

impl Serialize for OrderedFields<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for field in self.0 {
            match field.value {
                FieldValue::Float(v) => map.serialize_entry(&field.name, &round2(v))?,
                FieldValue::Int(v) => map.serialize_entry(&field.name, &v)?,
            }
        }
        map.end()
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn escape_measurement(s: &str) -> String {
    s.replace('\\', "\\\\").replace(',', "\\,").replace(' ', "\\ ")
}

/// tag keys, tag values and field keys
fn escape_key(s: &str) -> String {
    s.replace('\\', "\\\\").replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}
