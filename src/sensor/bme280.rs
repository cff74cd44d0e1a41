//! Bosch BME280 temperature / humidity over I2C.
//!
//! Forced mode, 1x oversampling. Compensation is the datasheet's integer
//! algorithm, carried out in i64 so intermediate products cannot overflow.

use super::SensorSource;
use crate::domain::{Field, Reading, SensorKind};
use crate::error::SensorReadError;
use crate::hal::I2cBus;

use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_ADDRESS: u16 = 0x76;
pub const TAG: &str = "bme_280";

const CHIP_ID: u8 = 0x60;
const REG_CHIP_ID: u8 = 0xD0;
const REG_CALIB_00: u8 = 0x88;
const REG_CALIB_26: u8 = 0xE1;
const REG_CTRL_HUM: u8 = 0xF2;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_DATA: u8 = 0xF7;

/// osrs_t=1, osrs_p=1, mode=forced
const CTRL_MEAS_FORCED: u8 = 0b001_001_01;
const MEASURE_TIME: Duration = Duration::from_millis(10);

const TEMP_RANGE: std::ops::RangeInclusive<f64> = -40.0..=85.0;
const HUMIDITY_RANGE: std::ops::RangeInclusive<f64> = 0.0..=100.0;

#[derive(Debug, Clone, PartialEq)]
struct Calibration {
    t1: i64,
    t2: i64,
    t3: i64,
    h1: i64,
    h2: i64,
    h3: i64,
    h4: i64,
    h5: i64,
    h6: i64,
}

impl Calibration {
    /// `block0` is 26 bytes from 0x88, `block1` is 7 bytes from 0xE1
    fn parse(block0: &[u8; 26], block1: &[u8; 7]) -> Self {
        let u16le = |b: &[u8], i: usize| u16::from_le_bytes([b[i], b[i + 1]]) as i64;
        let i16le = |b: &[u8], i: usize| i16::from_le_bytes([b[i], b[i + 1]]) as i64;

        Self {
            t1: u16le(block0, 0),
            t2: i16le(block0, 2),
            t3: i16le(block0, 4),
            h1: block0[25] as i64,
            h2: i16le(block1, 0),
            h3: block1[2] as i64,
            h4: ((block1[3] as i8 as i64) << 4) | (block1[4] & 0x0F) as i64,
            h5: ((block1[5] as i8 as i64) << 4) | (block1[4] >> 4) as i64,
            h6: block1[6] as i8 as i64,
        }
    }

    /// returns (t_fine, temperature in 0.01 °C)
    fn temperature(&self, adc_t: i64) -> (i64, i64) {
        let var1 = (((adc_t >> 3) - (self.t1 << 1)) * self.t2) >> 11;
        let var2 = (((((adc_t >> 4) - self.t1) * ((adc_t >> 4) - self.t1)) >> 12) * self.t3) >> 14;
        let t_fine = var1 + var2;
        (t_fine, (t_fine * 5 + 128) >> 8)
    }

    /// relative humidity in Q22.10 %RH
    fn humidity(&self, t_fine: i64, adc_h: i64) -> i64 {
        let mut v = t_fine - 76800;
        v = ((((adc_h << 14) - (self.h4 << 20) - (self.h5 * v)) + 16384) >> 15)
            * (((((((v * self.h6) >> 10) * (((v * self.h3) >> 11) + 32768)) >> 10) + 2097152)
                * self.h2
                + 8192)
                >> 14);
        v -= ((((v >> 15) * (v >> 15)) >> 7) * self.h1) >> 4;
        v.clamp(0, 419_430_400) >> 12
    }
}

pub struct Bme280 {
    name: String,
    bus: Box<dyn I2cBus>,
    calibration: Calibration,
}

impl Bme280 {
    /// Verify the chip id and load factory calibration.
    pub fn open(name: &str, mut bus: Box<dyn I2cBus>) -> Result<Self, SensorReadError> {
        let mut id = [0u8; 1];
        bus.write_read(&[REG_CHIP_ID], &mut id).map_err(bus_err)?;
        if id[0] != CHIP_ID {
            return Err(SensorReadError::Unavailable(format!(
                "unexpected chip id 0x{:02X} (want 0x{:02X})",
                id[0], CHIP_ID
            )));
        }

        let mut block0 = [0u8; 26];
        let mut block1 = [0u8; 7];
        bus.write_read(&[REG_CALIB_00], &mut block0).map_err(bus_err)?;
        bus.write_read(&[REG_CALIB_26], &mut block1).map_err(bus_err)?;
        let calibration = Calibration::parse(&block0, &block1);

        info!(sensor = %name, "BME280 ready");
        debug!(sensor = %name, ?calibration, "BME280 calibration");

        Ok(Self { name: name.to_string(), bus, calibration })
    }

    /// One forced-mode measurement: (°C, %RH).
    pub fn sample(&mut self) -> Result<(f64, f64), SensorReadError> {
        self.bus.write(&[REG_CTRL_HUM, 0x01]).map_err(bus_err)?;
        self.bus.write(&[REG_CTRL_MEAS, CTRL_MEAS_FORCED]).map_err(bus_err)?;
        std::thread::sleep(MEASURE_TIME);

        let mut data = [0u8; 8];
        self.bus.write_read(&[REG_DATA], &mut data).map_err(bus_err)?;

        let adc_t = ((data[3] as i64) << 12) | ((data[4] as i64) << 4) | ((data[5] as i64) >> 4);
        let adc_h = ((data[6] as i64) << 8) | data[7] as i64;

        let (t_fine, centi_c) = self.calibration.temperature(adc_t);
        let temperature = centi_c as f64 / 100.0;
        let humidity = self.calibration.humidity(t_fine, adc_h) as f64 / 1024.0;

        if !TEMP_RANGE.contains(&temperature) || !HUMIDITY_RANGE.contains(&humidity) {
            return Err(SensorReadError::OutOfRange(format!(
                "temp_c={:.2} humidity={:.2}",
                temperature, humidity
            )));
        }
        Ok((temperature, humidity))
    }
}

impl SensorSource for Bme280 {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Climate
    }

    fn tag(&self) -> &str {
        TAG
    }

    fn read(&mut self) -> Reading {
        match self.sample() {
            Ok((t, h)) => Reading::new(
                SensorKind::Climate,
                TAG,
                vec![Field::float("temp_c", t), Field::float("humidity", h)],
                Utc::now(),
            ),
            Err(e) => {
                warn!(sensor = %self.name, error = %e, "temperature reading error");
                Reading::invalid(SensorKind::Climate, TAG, Utc::now())
            }
        }
    }
}

impl Drop for Bme280 {
    fn drop(&mut self) {
        debug!(sensor = %self.name, "releasing BME280");
    }
}

fn bus_err(e: anyhow::Error) -> SensorReadError {
    SensorReadError::Bus(e.to_string())
}
