//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     exclusive I2C handles for the sensor drivers.
//!     abstracts away the difference between running on a real Raspberry Pi
//!     (using `rppal`) and a development machine (no bus at all).
//!
//! design:
//!     - "Compile Anywhere": the gateway compiles on Windows/Mac/Linux.
//!     - one handle per sensor, owned by that sensor's worker thread.
//!       the bus device is closed when the handle is dropped.
//!
//! relationships:
//!     - used by: sensor/bme280.rs, sensor/k30.rs
//!     - uses: rppal (on feature="hardware")
//!
//! ==============================================================================

use anyhow::Result;

/// An open I2C device at a fixed slave address.
pub trait I2cBus: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn read(&mut self, buf: &mut [u8]) -> Result<()>;
    /// write then read without releasing the bus in between
    fn write_read(&mut self, data: &[u8], buf: &mut [u8]) -> Result<()>;
}

// ==============================================================================================
// NO-HARDWARE BUILD (WSL / desktop)
// ==============================================================================================
#[cfg(not(feature = "hardware"))]
pub fn open_i2c(bus: u8, address: u16) -> Result<Box<dyn I2cBus>> {
    tracing::debug!(bus, address = %format!("0x{:02X}", address), "no I2C in this build");
    anyhow::bail!("i2c-{} 0x{:02X}: built without the `hardware` feature", bus, address)
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================
#[cfg(feature = "hardware")]
pub fn open_i2c(bus: u8, address: u16) -> Result<Box<dyn I2cBus>> {
    use anyhow::Context;

    let mut i2c = rppal::i2c::I2c::with_bus(bus)
        .with_context(|| format!("failed to open /dev/i2c-{}", bus))?;
    i2c.set_slave_address(address)
        .with_context(|| format!("failed to select address 0x{:02X}", address))?;
    tracing::info!(bus, address = %format!("0x{:02X}", address), "opened I2C device (rppal)");
    Ok(Box::new(RppalI2c { inner: i2c, bus, address }))
}

#[cfg(feature = "hardware")]
struct RppalI2c {
    inner: rppal::i2c::I2c,
    bus: u8,
    address: u16,
}

#[cfg(feature = "hardware")]
impl I2cBus for RppalI2c {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let written = self.inner.write(data)?;
        if written != data.len() {
            anyhow::bail!("short write: {} of {} bytes", written, data.len());
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let read = self.inner.read(buf)?;
        if read != buf.len() {
            anyhow::bail!("short read: {} of {} bytes", read, buf.len());
        }
        Ok(())
    }

    fn write_read(&mut self, data: &[u8], buf: &mut [u8]) -> Result<()> {
        self.inner.write_read(data, buf)?;
        Ok(())
    }
}

#[cfg(feature = "hardware")]
impl Drop for RppalI2c {
    fn drop(&mut self) {
        tracing::debug!(bus = self.bus, address = %format!("0x{:02X}", self.address), "closing I2C device");
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Scripted bus: every read/write_read pops the next canned response.
    /// Writes are recorded. `closed` flips when the handle is dropped.
    pub(crate) struct ScriptedBus {
        pub responses: VecDeque<Result<Vec<u8>, String>>,
        pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
        pub closed: Arc<Mutex<bool>>,
    }

    impl ScriptedBus {
        pub fn new(responses: Vec<Result<Vec<u8>, String>>) -> Self {
            Self {
                responses: responses.into(),
                writes: Arc::new(Mutex::new(Vec::new())),
                closed: Arc::new(Mutex::new(false)),
            }
        }

        fn next(&mut self, buf: &mut [u8]) -> Result<()> {
            match self.responses.pop_front() {
                Some(Ok(bytes)) => {
                    buf.copy_from_slice(&bytes[..buf.len()]);
                    Ok(())
                }
                Some(Err(e)) => anyhow::bail!(e),
                None => anyhow::bail!("script exhausted"),
            }
        }
    }

    impl I2cBus for ScriptedBus {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<()> {
            self.next(buf)
        }

        fn write_read(&mut self, data: &[u8], buf: &mut [u8]) -> Result<()> {
            self.writes.lock().unwrap().push(data.to_vec());
            self.next(buf)
        }
    }

    impl Drop for ScriptedBus {
        fn drop(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    #[cfg(not(feature = "hardware"))]
    #[test]
    fn test_open_without_hardware_fails() {
        let err = open_i2c(1, 0x76).err().unwrap();
        assert!(err.to_string().contains("hardware"));
    }
}
