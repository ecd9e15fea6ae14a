//! # Sensor Driver Contract and Capability Set
//!
//! The acquisition engine never speaks a register protocol itself: each
//! temperature/humidity part lives behind [`TempHumiSensor`] and the combined
//! gas/environment part behind [`GasSensor`]. Drivers follow the
//! convert-then-read shape common to these sensors: `convert` starts a
//! measurement and reports how long to wait, `ready` answers whether the
//! result can be fetched (synchronous parts just return `true`), and the
//! read call returns engineering units.
//!
//! Which sensors are present is decided exactly once, at startup, by
//! [`SensorSuite::probe`]: a driver that fails its first conversion is
//! logged and permanently dropped. There is no per-cycle retry; a
//! mid-process fault likewise disables the slot for the remainder of the
//! process (see the scheduler). This mirrors field behavior: a sensor that
//! wasn't there at boot will not appear later, and one that failed is more
//! likely wiring than weather.

use log::{info, warn};
use std::time::Duration;
use thiserror::Error;

/// A single driver failure: checksum or bus error on conversion/read.
#[derive(Debug, Error)]
pub enum SensorError {
    /// The sensor returned data that failed its CRC/checksum.
    #[error("sensor checksum mismatch")]
    Checksum,
    /// Bus-level failure (I2C NAK, timeout, ...).
    #[error("sensor bus error: {0}")]
    Bus(String),
    /// The sensor was read before its conversion finished.
    #[error("sensor not ready")]
    NotReady,
}

/// One reading from the combined gas/environment sensor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GasReading {
    pub temp_c: f64,
    pub humidity_pct: f64,
    pub pressure_mbar: f64,
    pub gas_ohms: f64,
}

/// Temperature/humidity sensor driver contract.
pub trait TempHumiSensor: Send {
    /// Start a conversion; returns how long to wait before reading.
    fn convert(&mut self) -> Result<Duration, SensorError>;

    /// Whether the conversion result can be fetched. Synchronous sensors
    /// keep the default.
    fn ready(&mut self) -> bool {
        true
    }

    /// Fetch the conversion result as (°C, %RH).
    fn read_temp_humi(&mut self) -> Result<(f64, f64), SensorError>;
}

/// Gas/environment sensor driver contract (BME680-class).
pub trait GasSensor: Send {
    fn convert(&mut self) -> Result<Duration, SensorError>;

    fn ready(&mut self) -> bool {
        true
    }

    fn read_data(&mut self) -> Result<GasReading, SensorError>;
}

/// One named temperature/humidity slot; the name becomes the record field
/// suffix (`t_<name>` / `h_<name>`).
pub struct TempHumiSlot {
    pub name: String,
    pub driver: Box<dyn TempHumiSensor>,
    /// Cleared permanently on the first mid-process fault.
    pub enabled: bool,
}

/// Immutable capability set: which sensors this process has, decided once.
pub struct SensorSuite {
    pub gas: Option<Box<dyn GasSensor>>,
    pub temp_humi: Vec<TempHumiSlot>,
}

impl SensorSuite {
    /// Probe every candidate driver with one conversion attempt. Failures
    /// are logged and the driver dropped; nothing is ever re-probed.
    pub fn probe(
        gas: Option<Box<dyn GasSensor>>,
        temp_humi: Vec<(String, Box<dyn TempHumiSensor>)>,
    ) -> Self {
        let gas = gas.and_then(|mut driver| match driver.convert() {
            Ok(_) => {
                info!("found gas sensor (bme680)");
                Some(driver)
            }
            Err(e) => {
                warn!("no gas sensor: {}", e);
                None
            }
        });

        let temp_humi = temp_humi
            .into_iter()
            .filter_map(|(name, mut driver)| match driver.convert() {
                Ok(_) => {
                    info!("found temp/humi sensor {}", name);
                    Some(TempHumiSlot {
                        name,
                        driver,
                        enabled: true,
                    })
                }
                Err(e) => {
                    warn!("no {} sensor: {}", name, e);
                    None
                }
            })
            .collect();

        SensorSuite { gas, temp_humi }
    }
}

/// In-process stand-in drivers for development mode and tests.
pub mod sim {
    use super::*;

    /// Fixed-value temperature/humidity driver with a short conversion wait.
    pub struct SimTempHumi {
        pub temp_c: f64,
        pub humidity_pct: f64,
    }

    impl TempHumiSensor for SimTempHumi {
        fn convert(&mut self) -> Result<Duration, SensorError> {
            Ok(Duration::from_millis(2))
        }

        fn read_temp_humi(&mut self) -> Result<(f64, f64), SensorError> {
            Ok((self.temp_c, self.humidity_pct))
        }
    }

    /// Fixed-value gas/environment driver.
    pub struct SimGas {
        pub reading: GasReading,
    }

    impl GasSensor for SimGas {
        fn convert(&mut self) -> Result<Duration, SensorError> {
            Ok(Duration::from_millis(5))
        }

        fn read_data(&mut self) -> Result<GasReading, SensorError> {
            Ok(self.reading)
        }
    }

    /// Driver that fails every operation, for probe/fault paths.
    pub struct BrokenSensor;

    impl TempHumiSensor for BrokenSensor {
        fn convert(&mut self) -> Result<Duration, SensorError> {
            Err(SensorError::Bus("no ack".into()))
        }

        fn read_temp_humi(&mut self) -> Result<(f64, f64), SensorError> {
            Err(SensorError::Bus("no ack".into()))
        }
    }

    /// Driver whose conversion succeeds but whose reads fail, for the
    /// disable-on-fault path.
    pub struct FlakyReader;

    impl TempHumiSensor for FlakyReader {
        fn convert(&mut self) -> Result<Duration, SensorError> {
            Ok(Duration::ZERO)
        }

        fn read_temp_humi(&mut self) -> Result<(f64, f64), SensorError> {
            Err(SensorError::Checksum)
        }
    }
}
