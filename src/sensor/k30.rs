//! SenseAir K30 CO2 over I2C.
//!
//! Read-RAM command for the CO2 value at 0x08. The sensor answers with
//! [status, hi, lo, checksum] where checksum is the low byte of the sum of
//! the first three bytes and bit 0 of status marks a completed read.

use super::SensorSource;
use crate::domain::{Field, Reading, SensorKind};
use crate::error::SensorReadError;
use crate::hal::I2cBus;

use chrono::Utc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_ADDRESS: u16 = 0x68;
pub const TAG: &str = "k_30";

const READ_CO2: [u8; 4] = [0x22, 0x00, 0x08, 0x2A];
const RESPONSE_DELAY: Duration = Duration::from_millis(20);

pub struct K30 {
    name: String,
    bus: Box<dyn I2cBus>,
}

impl K30 {
    pub fn new(name: &str, bus: Box<dyn I2cBus>) -> Self {
        Self { name: name.to_string(), bus }
    }

    /// CO2 concentration in ppm.
    pub fn sample(&mut self) -> Result<i64, SensorReadError> {
        self.bus
            .write(&READ_CO2)
            .map_err(|e| SensorReadError::Bus(e.to_string()))?;
        std::thread::sleep(RESPONSE_DELAY);

        let mut buf = [0u8; 4];
        self.bus
            .read(&mut buf)
            .map_err(|e| SensorReadError::Bus(e.to_string()))?;
        parse_response(&buf)
    }
}

fn parse_response(buf: &[u8; 4]) -> Result<i64, SensorReadError> {
    let expected = buf[0].wrapping_add(buf[1]).wrapping_add(buf[2]);
    if expected != buf[3] {
        return Err(SensorReadError::Checksum { expected, actual: buf[3] });
    }
    if buf[0] & 0x01 == 0 {
        return Err(SensorReadError::Bus("read not complete".to_string()));
    }

    let ppm = i16::from_be_bytes([buf[1], buf[2]]) as i64;
    if ppm <= 0 {
        return Err(SensorReadError::OutOfRange(format!("ppm={}", ppm)));
    }
    Ok(ppm)
}

impl SensorSource for K30 {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Co2
    }

    fn tag(&self) -> &str {
        TAG
    }

    fn read(&mut self) -> Reading {
        match self.sample() {
            Ok(ppm) => Reading::new(SensorKind::Co2, TAG, vec![Field::int("ppm", ppm)], Utc::now()),
            Err(e) => {
                warn!(sensor = %self.name, error = %e, "CO2 reading error");
                Reading::invalid(SensorKind::Co2, TAG, Utc::now())
            }
        }
    }
}

impl Drop for K30 {
    fn drop(&mut self) {
        debug!(sensor = %self.name, "releasing K30");
    }
}
