//! # Station Configuration
//!
//! Loads calibration and scheduling parameters from `weather-config.toml`.
//! Anything not covered by the file falls back to defaults matching the
//! reference hardware: a 10-mil tipping bucket, a 2.5 mph/Hz anemometer,
//! an un-rotated vane, and a 60-second acquisition cycle.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Application configuration loaded from weather-config.toml.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Station identity.
    pub station: StationConfig,
    /// Per-gauge calibration constants.
    pub calibration: CalibrationConfig,
    /// Task cadences.
    pub schedule: ScheduleConfig,
}

/// Station identity; the location string names the publish topic.
#[derive(Debug, Deserialize, Serialize)]
pub struct StationConfig {
    /// Human-chosen site name (e.g. "backyard"), used in the topic path.
    pub location: String,
}

/// Calibration constants for the counter- and analog-based gauges.
#[derive(Debug, Deserialize, Serialize)]
pub struct CalibrationConfig {
    /// Rainfall depth per bucket tip, in mils (1/1000 inch). Typically 10.
    pub rain_mils_per_tip: u32,
    /// Rain-day boundary, minutes after local midnight.
    pub rain_day_start_minute: u32,
    /// Anemometer pulse frequency to speed factor, mph per Hz.
    pub anemometer_mph_per_hz: f64,
    /// Vane raw reading at the low calibration bound.
    pub vane_raw_min: u16,
    /// Vane raw reading at the high calibration bound.
    pub vane_raw_max: u16,
    /// Vane reading when pointing north, in degrees.
    pub vane_north_offset_deg: i64,
}

/// Cadences for the cooperative tasks.
#[derive(Debug, Deserialize, Serialize)]
pub struct ScheduleConfig {
    /// Acquisition cycle interval in seconds.
    pub query_interval_secs: u64,
    /// PM parser poll interval in milliseconds.
    pub uart_poll_ms: u64,
    /// Anemometer gust window in milliseconds.
    pub gust_window_ms: u64,
    /// Vane smoothing sample interval in milliseconds.
    pub vane_sample_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            station: StationConfig {
                location: "backyard".to_string(),
            },
            calibration: CalibrationConfig {
                rain_mils_per_tip: 10,
                rain_day_start_minute: 8 * 60,
                anemometer_mph_per_hz: 2.5,
                vane_raw_min: 0,
                vane_raw_max: 1023,
                vane_north_offset_deg: 0,
            },
            schedule: ScheduleConfig {
                query_interval_secs: 60,
                uart_poll_ms: 500,
                gust_window_ms: 3000,
                vane_sample_ms: 1000,
            },
        }
    }
}

impl Config {
    /// Load configuration from weather-config.toml in the working directory.
    /// Falls back to the defaults if the file is missing or invalid.
    pub fn load() -> Self {
        Self::load_from_path("weather-config.toml")
    }

    /// Load configuration from the given path, defaulting on any failure.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(config) => {
                    info!("loaded configuration for station {}", config.station.location);
                    config
                }
                Err(e) => {
                    warn!("invalid config file, using defaults: {}", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("no config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Save the current configuration to weather-config.toml.
    pub fn save(&self) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write("weather-config.toml", contents)?;
        Ok(())
    }

    /// Topic prefix the publish sink receives.
    pub fn topic(&self) -> String {
        format!("esp32/weather/{}", self.station.location)
    }

    pub fn query_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.query_interval_secs)
    }

    pub fn uart_poll_interval(&self) -> Duration {
        Duration::from_millis(self.schedule.uart_poll_ms)
    }

    pub fn gust_window(&self) -> Duration {
        Duration::from_millis(self.schedule.gust_window_ms)
    }

    pub fn vane_sample_interval(&self) -> Duration {
        Duration::from_millis(self.schedule.vane_sample_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_matches_reference_hardware() {
        let config = Config::default();
        assert_eq!(config.calibration.rain_mils_per_tip, 10);
        assert_eq!(config.calibration.rain_day_start_minute, 480);
        assert_eq!(config.calibration.anemometer_mph_per_hz, 2.5);
        assert_eq!(config.schedule.query_interval_secs, 60);
        assert_eq!(config.topic(), "esp32/weather/backyard");
    }

    #[test]
    fn config_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.station.location, parsed.station.location);
        assert_eq!(
            config.calibration.vane_raw_max,
            parsed.calibration.vane_raw_max
        );
        assert_eq!(
            config.schedule.uart_poll_ms,
            parsed.schedule.uart_poll_ms
        );
    }

    #[test]
    fn load_nonexistent_path_falls_back_to_default() {
        let config = Config::load_from_path("/nonexistent/weather-config.toml");
        assert_eq!(config.station.location, "backyard");
    }

    #[test]
    fn load_partial_or_broken_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[station]\nlocation = 3").unwrap();
        let config = Config::load_from_path(file.path());
        assert_eq!(config.station.location, "backyard");
    }

    #[test]
    fn duration_helpers() {
        let config = Config::default();
        assert_eq!(config.query_interval(), Duration::from_secs(60));
        assert_eq!(config.gust_window(), Duration::from_millis(3000));
    }
}
