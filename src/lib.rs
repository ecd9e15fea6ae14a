//! # Weather Station Acquisition Engine
//!
//! This library implements the telemetry-acquisition core of a small
//! battery/mains-powered environmental station: it reads heterogeneous
//! sensors on a fixed cadence, derives higher-level metrics from raw
//! counters, and hands one assembled record per cycle to a publish sink.
//!
//! ## Design Philosophy
//!
//! ### Bounded memory, single process
//! Everything here is a single-device, bounded-memory, real-time signal
//! pipeline. There is no persistence and no historical query; state is a
//! handful of small accumulator structs that are rebuilt on restart.
//!
//! ### Cooperative scheduling
//! One tokio task runs the acquisition cycle, one continuously polls the
//! particulate-matter frame parser, and two periodic tasks sample the
//! anemometer and wind vane. All suspension points are explicit timed
//! waits; shared state has exactly one writer task and is read by the
//! scheduler between its own suspension points.
//!
//! ### Narrow seams
//! Hardware and transport live behind small traits ([`pms::ByteSource`],
//! [`wind::PulseCounter`], [`wind::AngleSensor`], [`sensors::TempHumiSensor`],
//! [`publish::PublishSink`], ...). The engine never touches a bus or a
//! socket directly, which is also what makes the whole pipeline testable
//! on a desktop.
//!
//! ## Data Flow
//! 1. **Continuous**: UART bytes → [`pms::PmParser`] → frames → [`scheduler::PmAggregate`]
//! 2. **Periodic**: pulse/angle samplers update [`wind`] state in the background
//! 3. **Per cycle**: scheduler triggers conversions, collects all partial
//!    results, computes AQI, assembles a [`Record`], hands it to the sinks,
//!    and re-schedules with drift correction.

use serde::Serialize;
use std::collections::BTreeMap;

pub mod aqi;
pub mod config;
pub mod pms;
pub mod publish;
pub mod rain;
pub mod scheduler;
pub mod sensors;
pub mod watchdog;
pub mod wind;

/// One assembled station reading: a flat, ordered mapping of field name to
/// numeric value, serialized as a JSON object for the publish sink.
///
/// Field names follow the station's wire vocabulary: `t_<sensor>` and
/// `h_<sensor>` for temperature/humidity pairs, `p_bme680`/`g_bme680` for
/// pressure and gas resistance, `wind`/`gust`/`wdir`, `pm25`/`pm_coarse`,
/// `rain_rate`/`rain_event`/`rain_day`, and the derived `aqi_pm25`/`aqi_tvoc`
/// indices. Absent sensors simply contribute no fields.
///
/// # Example
/// ```
/// use weather_station::Record;
///
/// let mut rec = Record::new();
/// rec.set("t_sht31", 21.4);
/// rec.set_opt("wdir", None); // absent values add nothing
/// assert_eq!(rec.get("t_sht31"), Some(21.4));
/// assert!(rec.get("wdir").is_none());
/// ```
#[derive(Clone, Debug, Default, Serialize)]
pub struct Record(BTreeMap<String, f64>);

impl Record {
    pub fn new() -> Self {
        Record(BTreeMap::new())
    }

    /// Insert a field, overwriting any previous value.
    pub fn set(&mut self, name: &str, value: f64) {
        self.0.insert(name.to_string(), value);
    }

    /// Insert a field only if the value is present.
    pub fn set_opt(&mut self, name: &str, value: Option<f64>) {
        if let Some(v) = value {
            self.set(name, v);
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// True when no sensor contributed anything this cycle.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Serialize to the JSON object handed to the publish sink.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_set_get_roundtrip() {
        let mut rec = Record::new();
        rec.set("pm25", 12.5);
        rec.set("wind", 3.0);
        assert_eq!(rec.get("pm25"), Some(12.5));
        assert_eq!(rec.len(), 2);
        assert!(!rec.is_empty());
    }

    #[test]
    fn record_serializes_as_flat_object() {
        let mut rec = Record::new();
        rec.set("gust", 7.5);
        rec.set("aqi_pm25", 52.0);
        let json = rec.to_json();
        // BTreeMap keeps keys sorted, so the output is stable.
        assert_eq!(json, r#"{"aqi_pm25":52.0,"gust":7.5}"#);
    }

    #[test]
    fn absent_optional_fields_add_nothing() {
        let mut rec = Record::new();
        rec.set_opt("rain_rate", None);
        assert!(rec.is_empty());
        rec.set_opt("rain_rate", Some(0.02));
        assert_eq!(rec.get("rain_rate"), Some(0.02));
    }
}
