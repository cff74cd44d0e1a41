//! ==============================================================================
//! sensor - polymorphic sensor sources
//! ==============================================================================
//!
//! every physical sensor is a SensorSource: one synchronous read() that
//! always yields a Reading. hardware faults come back as `valid: false`,
//! never as a panic or an error that could stop the sampling loop.
//!
//! relationships:
//!     - bme280.rs / k30.rs: i2c drivers (via hal.rs)
//!     - worker.rs: one thread per source, bounded read timeout
//!     - used by: publisher.rs
//!
//! ==============================================================================

mod bme280;
mod k30;
mod worker;

pub use bme280::Bme280;
pub use k30::K30;
pub use worker::SensorWorker;

use crate::config::{SensorConfig, SensorDriver};
use crate::domain::{Field, Reading, SensorKind};
use crate::hal;

use chrono::Utc;
use tracing::error;

/// Capability: produce a typed reading or report an invalid one.
///
/// Implementations own their device handle from construction until drop.
pub trait SensorSource: Send {
    /// configured name, for logs
    fn name(&self) -> &str;
    fn kind(&self) -> SensorKind;
    /// value of the `sensor` tag on emitted records
    fn tag(&self) -> &str;
    fn read(&mut self) -> Reading;
}

/// Build the source described by `config`.
///
/// A device that cannot be opened is logged and replaced by an offline
/// source, so a missing sensor never aborts startup.
pub fn build(config: &SensorConfig) -> Box<dyn SensorSource> {
    let name = config.name.as_str();
    match config.driver {
        SensorDriver::Bme280 => {
            let address = config.i2c_address.unwrap_or(bme280::DEFAULT_ADDRESS);
            match hal::open_i2c(config.i2c_bus, address)
                .map_err(|e| e.to_string())
                .and_then(|bus| Bme280::open(name, bus).map_err(|e| e.to_string()))
            {
                Ok(sensor) => Box::new(sensor),
                Err(e) => {
                    error!(sensor = %name, error = %e, "BME280 init error, sensor offline");
                    Box::new(OfflineSensor::new(name, SensorKind::Climate, bme280::TAG))
                }
            }
        }
        SensorDriver::K30 => {
            let address = config.i2c_address.unwrap_or(k30::DEFAULT_ADDRESS);
            match hal::open_i2c(config.i2c_bus, address) {
                Ok(bus) => Box::new(K30::new(name, bus)),
                Err(e) => {
                    error!(sensor = %name, error = %e, "K30 init error, sensor offline");
                    Box::new(OfflineSensor::new(name, SensorKind::Co2, k30::TAG))
                }
            }
        }
        SensorDriver::SimulatedClimate => Box::new(SimulatedSensor::new(name, SensorKind::Climate)),
        SensorDriver::SimulatedCo2 => Box::new(SimulatedSensor::new(name, SensorKind::Co2)),
    }
}

/// Stand-in for a sensor whose device could not be opened.
pub struct OfflineSensor {
    name: String,
    kind: SensorKind,
    tag: &'static str,
}

impl OfflineSensor {
    pub fn new(name: &str, kind: SensorKind, tag: &'static str) -> Self {
        Self { name: name.to_string(), kind, tag }
    }
}

impl SensorSource for OfflineSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn tag(&self) -> &str {
        self.tag
    }

    // init already logged the cause
    fn read(&mut self) -> Reading {
        Reading::invalid(self.kind, self.tag, Utc::now())
    }
}

/// Deterministic wave generator for hosts without I2C.
pub struct SimulatedSensor {
    name: String,
    kind: SensorKind,
    step: u64,
}

impl SimulatedSensor {
    pub fn new(name: &str, kind: SensorKind) -> Self {
        Self { name: name.to_string(), kind, step: 0 }
    }
}

impl SensorSource for SimulatedSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn tag(&self) -> &str {
        match self.kind {
            SensorKind::Climate => bme280::TAG,
            SensorKind::Co2 => k30::TAG,
        }
    }

    fn read(&mut self) -> Reading {
        let phase = self.step as f64 / 10.0;
        self.step += 1;

        let fields = match self.kind {
            SensorKind::Co2 => vec![Field::int("ppm", 420 + (self.step as i64 * 7) % 60)],
            SensorKind::Climate => vec![
                Field::float("temp_c", 21.0 + 2.0 * phase.sin()),
                Field::float("humidity", 45.0 + 5.0 * phase.cos()),
            ],
        };
        Reading::new(self.kind, self.tag(), fields, Utc::now())
    }
}
