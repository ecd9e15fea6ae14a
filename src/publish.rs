//! # Publish, Report and Display Seams
//!
//! The engine's output side is three narrow traits. Transport, wire
//! formatting and rendering are external collaborators; the scheduler only
//! ever hands them an assembled [`Record`] (or, for the text-protocol
//! reporter, a [`WxReport`] of named optional fields) and moves on. All three
//! are fire-and-forget: a sink that fails is expected to log and swallow the
//! failure itself, never to propagate it back into the acquisition cycle.

use crate::Record;
use log::info;

/// Fire-and-forget record publisher (MQTT-style topic + JSON payload).
/// At-least-once delivery is not guaranteed.
pub trait PublishSink: Send + Sync {
    fn publish(&self, topic: &str, record: &Record);
}

/// Reference sink: logs the serialized record. Development mode uses this in
/// place of a broker connection.
pub struct LogPublisher;

impl PublishSink for LogPublisher {
    fn publish(&self, topic: &str, record: &Record) {
        info!("pub {}: {}", topic, record.to_json());
    }
}

/// Named optional fields for the remote text-protocol weather report
/// (CWOP-style). Units follow that protocol's conventions: rain counts in
/// hundredths of an inch, wind in mph.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WxReport {
    pub temp_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub wind_dir_deg: Option<f64>,
    pub wind_mph: Option<f64>,
    pub gust_mph: Option<f64>,
    pub baro_mbar: Option<f64>,
    /// Rain in the past hour, hundredths of an inch.
    pub rain_rate_cin: Option<f64>,
    /// Rain this event, hundredths of an inch.
    pub rain_event_cin: Option<f64>,
}

/// Remote report sender. Formatting and transport are the collaborator's
/// problem; so are its failures.
pub trait ReportSink: Send + Sync {
    fn send(&self, report: &WxReport);
}

/// Reference reporter that discards everything.
pub struct NullReporter;

impl ReportSink for NullReporter {
    fn send(&self, _report: &WxReport) {}
}

/// Display collaborator: consumes the assembled record and the current mode.
pub trait DisplaySink: Send + Sync {
    fn render(&self, record: &Record, mode: u8);
}

/// Reference display that renders nothing.
pub struct NullDisplay;

impl DisplaySink for NullDisplay {
    fn render(&self, _record: &Record, _mode: u8) {}
}
