//! # Tipping-Bucket Rain Accumulator
//!
//! Converts a monotonically increasing bucket-tip counter into three derived
//! metrics: instantaneous rain rate in inches/hour, rain accumulated in the
//! current contiguous rain event, and rain accumulated "today" (local-time
//! day, boundary at a configurable minute after midnight, 08:00 by default,
//! matching the San Marcos Pass convention).
//!
//! ## Rate semantics
//! The rate is derived from tip spacing rather than a fixed window, which
//! gives a smooth decay when rain stops: as long as the last tip is less than
//! [`RATE_OFF_SECS`] old, the gauge reports the rate as if one tip had
//! occurred exactly now, so the rate glides toward zero instead of snapping.
//! Once no tip has been seen for [`EVENT_OFF_SECS`], the rain event is
//! closed and the event total resets.
//!
//! ## Event bookkeeping
//! A new event opens at the *previous read's* timestamp and count, not the
//! triggering tip's own. The tip that opens the event must land inside it;
//! anchoring at the tip itself would silently drop that first increment from
//! the event total. Preserve this exactly.
//!
//! ## Caller contract
//! The tip count must be non-decreasing between successive calls. A
//! decreasing count produces negative, meaningless totals; this mirrors the
//! hardware counter's semantics and is deliberately not runtime-checked.

use chrono::{DateTime, Local, Timelike};
use log::debug;

/// Force the rain rate to zero if no tip has occurred in this many seconds.
pub const RATE_OFF_SECS: i64 = 5 * 60;
/// Close the rain event if no tip has occurred in this many seconds.
pub const EVENT_OFF_SECS: i64 = 12 * 60 * 60;
/// Default rain-day boundary: minutes after local midnight.
pub const DAY_START_MINUTE: u32 = 8 * 60;

/// One gauge observation's derived metrics, all in inches.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RainReading {
    /// Rain rate in inches/hour; `None` until a second observation exists.
    pub rate_in_hr: Option<f64>,
    /// Rain accumulated in the current event, zero while no event is open.
    pub event_in: f64,
    /// Rain accumulated since the last day-boundary crossing.
    pub day_in: f64,
}

/// Time-windowed accumulator over a monotonic tip counter.
///
/// Calibration is expressed in mils (1/1000 inch) per tip; the typical
/// tipping bucket is 10 mils = 0.01 in per tip but the factor absorbs
/// per-gauge calibration.
pub struct RainGauge {
    mils_per_tip: u32,
    day_start_minute: u32,
    // rate state
    last_read_at: i64,
    last_tip_at: i64,
    last_count: u32,
    initialized: bool,
    // event state
    event_open: bool,
    event_start_count: u32,
    // day state
    day_start_count: u32,
    day_updated_minute: Option<u32>,
}

impl RainGauge {
    pub fn new(mils_per_tip: u32, day_start_minute: u32) -> Self {
        RainGauge {
            mils_per_tip,
            day_start_minute,
            last_read_at: 0,
            last_tip_at: 0,
            last_count: 0,
            initialized: false,
            event_open: false,
            event_start_count: 0,
            day_start_count: 0,
            day_updated_minute: None,
        }
    }

    /// Observe the counter at local wall-clock `now`.
    pub fn sample(&mut self, now: DateTime<Local>, count: u32) -> RainReading {
        let minute_of_day = now.hour() * 60 + now.minute();
        self.sample_at(now.timestamp(), minute_of_day, count)
    }

    /// Clock-explicit form of [`sample`](Self::sample); `minute_of_day` is
    /// minutes since local midnight, used only for the day-boundary reset.
    pub fn sample_at(&mut self, now_secs: i64, minute_of_day: u32, count: u32) -> RainReading {
        if !self.initialized {
            // No rate can be computed without a prior observation. Seed the
            // tip timestamp one RATE_OFF back so the first real observation
            // lands on the "rate off" path rather than reporting a phantom
            // decay.
            self.last_read_at = now_secs;
            self.last_tip_at = now_secs - RATE_OFF_SECS;
            self.last_count = count;
            self.initialized = true;
            return RainReading {
                rate_in_hr: None,
                event_in: 0.0,
                day_in: 0.0,
            };
        }

        let mils = f64::from(self.mils_per_tip);

        // Rate, in mils/second.
        let mut rate = 0.0;
        let mut dt = (now_secs - self.last_tip_at).max(1);
        if count == self.last_count {
            if dt < RATE_OFF_SECS {
                // The gauge tipped recently: report the average rate as if it
                // tipped exactly now, giving a graceful drop toward zero.
                rate = mils / dt as f64;
            } else if dt > EVENT_OFF_SECS {
                self.event_open = false;
            }
        } else {
            if dt >= RATE_OFF_SECS {
                // Long idle gap before this tip: averaging over the whole gap
                // would overstate nothing but understate badly; use the
                // sampling interval instead.
                dt = (now_secs - self.last_read_at).max(1);
            }
            rate = mils * f64::from(count - self.last_count) / dt as f64;
            debug!(
                "rain: rate={:.4} mils/s dc={} dt={}s",
                rate,
                count - self.last_count,
                dt
            );
            if !self.event_open {
                // Open the event at the previous read's count so the
                // triggering tip is included in the event total.
                self.event_open = true;
                self.event_start_count = self.last_count;
            }
            self.last_tip_at = now_secs;
        }
        let rate_in_hr = if rate != 0.0 {
            // mils/sec × 3600 s/hr ÷ 1000 mils/in, rounded to 3 decimals.
            (rate * 3.6 * 1000.0).round() / 1000.0
        } else {
            0.0
        };

        let event_in = if self.event_open {
            mils * f64::from(count - self.event_start_count) / 1000.0
        } else {
            0.0
        };

        // Day total resets when the previous sample's minute-of-day was
        // before the boundary and this one is at/after it.
        let crossed = match self.day_updated_minute {
            None => true,
            Some(prev) => prev < self.day_start_minute && minute_of_day >= self.day_start_minute,
        };
        if crossed {
            self.day_start_count = self.last_count;
        }
        let day_in = mils * f64::from(count - self.day_start_count) / 1000.0;

        self.last_read_at = now_secs;
        self.last_count = count;
        self.day_updated_minute = Some(minute_of_day);

        RainReading {
            rate_in_hr: Some(rate_in_hr),
            event_in,
            day_in,
        }
    }
}
