//! # Acquisition Scheduler
//!
//! Top-level composition point: the only component that knows what "a full
//! reading" is. Once per interval it walks the sensor suite in fixed order
//! (gas/environment sensor, each temperature/humidity slot, wind, the
//! accumulated PM aggregate, rain), waits out each conversion latency with a
//! cooperative sleep, derives the AQI fields, assembles a [`Record`] and
//! hands it to the sinks.
//!
//! ## Drift correction
//! The next cycle's nominal start advances by exactly one interval, not by
//! the measured elapsed time, so per-cycle jitter never compounds. A cycle
//! that overruns its interval by less than 50% skips the catch-up sleep but
//! keeps the nominal grid; beyond 50% the grid resynchronizes to "now" and
//! the backlog is abandoned. See [`next_cycle_start`].
//!
//! ## PM aggregation
//! Frames decode continuously on the parser-poll task and accumulate in a
//! shared [`PmAggregate`]. The scheduler snapshots and resets the aggregate
//! under a single lock acquisition ([`PmAggregate::take`]) so no frame
//! produced between the read and the reset can be lost.

use crate::aqi;
use crate::pms::{ByteSource, PmFrame, PmParser};
use crate::publish::{DisplaySink, PublishSink, ReportSink, WxReport};
use crate::rain::RainGauge;
use crate::sensors::{GasSensor, SensorSuite};
use crate::watchdog::WatchdogMarks;
use crate::wind::{Anemometer, AngleSensor, PulseCounter, Vane};
use crate::Record;
use chrono::Local;
use log::{info, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Normal operating mode: publish and report every cycle. Other modes are
/// display-local (diagnostics, calibration) and suppress external output.
pub const MODE_NORMAL: u8 = 0;

fn lock_ignoring_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Running sums of surfaced PM frame fields between scheduler cycles.
#[derive(Debug, Default)]
pub struct PmAggregate {
    sum_pm25: u64,
    sum_coarse: u64,
    count: u32,
}

impl PmAggregate {
    /// Fold one validated frame into the sums.
    pub fn add(&mut self, frame: &PmFrame) {
        self.sum_pm25 += u64::from(frame.pm25_atm);
        self.sum_coarse += u64::from(frame.large_particle_proxy());
        self.count += 1;
    }

    /// Snapshot the means and reset, as one operation. Returns `None` when
    /// no frames arrived since the last take.
    pub fn take(&mut self) -> Option<(f64, f64)> {
        if self.count == 0 {
            return None;
        }
        let n = f64::from(self.count);
        let means = (self.sum_pm25 as f64 / n, self.sum_coarse as f64 / n);
        *self = PmAggregate::default();
        Some(means)
    }

    pub fn frame_count(&self) -> u32 {
        self.count
    }
}

/// Aggregate handle shared between the parser-poll task and the scheduler.
pub type SharedPmAggregate = Arc<Mutex<PmAggregate>>;

pub fn shared_aggregate() -> SharedPmAggregate {
    Arc::new(Mutex::new(PmAggregate::default()))
}

/// Launch the continuous PM parser poll task: drain every decodable frame
/// into the aggregate, mark the watchdog, sleep, repeat for process life.
pub fn start_pm_poller<S: ByteSource + Send + 'static>(
    mut parser: PmParser<S>,
    aggregate: SharedPmAggregate,
    marks: Arc<WatchdogMarks>,
    poll_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            while let Some(frame) = parser.poll() {
                lock_ignoring_poison(&aggregate).add(&frame);
            }
            marks.mark_parser_poll(Instant::now());
            sleep(poll_interval).await;
        }
    })
}

/// Drift-corrected re-scheduling: given the cycle's nominal start, the time
/// it finished and the configured interval, return the next nominal start
/// and how long to sleep before it.
///
/// - Undershoot: sleep the remainder, advance the grid by one interval.
/// - Overshoot under 50%: advance the grid by one interval, no sleep.
/// - Overshoot of 50% or more: give up catching up, resync the grid to now.
pub fn next_cycle_start(
    nominal_start: Instant,
    now: Instant,
    interval: Duration,
) -> (Instant, Option<Duration>) {
    let elapsed = now.duration_since(nominal_start);
    if elapsed < interval {
        (nominal_start + interval, Some(interval - elapsed))
    } else if elapsed < interval + interval / 2 {
        (nominal_start + interval, None)
    } else {
        (now, None)
    }
}

/// Wind estimator pair; the vane is only meaningful alongside the anemometer.
pub struct WindSet {
    pub anemo: Arc<Anemometer<Arc<dyn PulseCounter>>>,
    pub vane: Option<Arc<Vane<Box<dyn AngleSensor>>>>,
}

/// Rain gauge plus the tip counter it reads.
pub struct RainSet {
    pub gauge: RainGauge,
    pub counter: Arc<dyn PulseCounter>,
}

/// The acquisition loop's state: capability set, estimators, sinks, and the
/// shared bits the background tasks write.
pub struct Scheduler {
    topic: String,
    interval: Duration,
    suite: SensorSuite,
    wind: Option<WindSet>,
    rain: Option<RainSet>,
    pm: SharedPmAggregate,
    publisher: Arc<dyn PublishSink>,
    reporter: Arc<dyn ReportSink>,
    display: Arc<dyn DisplaySink>,
    mode: Arc<AtomicU8>,
    marks: Arc<WatchdogMarks>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: String,
        interval: Duration,
        suite: SensorSuite,
        pm: SharedPmAggregate,
        publisher: Arc<dyn PublishSink>,
        reporter: Arc<dyn ReportSink>,
        display: Arc<dyn DisplaySink>,
        mode: Arc<AtomicU8>,
        marks: Arc<WatchdogMarks>,
    ) -> Self {
        Scheduler {
            topic,
            interval,
            suite,
            wind: None,
            rain: None,
            pm,
            publisher,
            reporter,
            display,
            mode,
            marks,
        }
    }

    pub fn with_wind(mut self, wind: WindSet) -> Self {
        self.wind = Some(wind);
        self
    }

    pub fn with_rain(mut self, rain: RainSet) -> Self {
        self.rain = Some(rain);
        self
    }

    /// Run one full measurement cycle and hand the record to the sinks.
    /// Returns the record for inspection.
    pub async fn run_cycle(&mut self) -> Record {
        let mut record = Record::new();
        let mut gas_ohms = None;

        // Gas/environment sensor first: it has the longest conversion.
        let mut gas_faulted = false;
        if let Some(gas) = self.suite.gas.as_mut() {
            let result = read_gas(gas.as_mut()).await;
            match result {
                Ok(r) => {
                    record.set("t_bme680", r.temp_c);
                    record.set("h_bme680", r.humidity_pct);
                    record.set("p_bme680", r.pressure_mbar / 1000.0); // Bar on the wire
                    record.set("g_bme680", r.gas_ohms);
                    gas_ohms = Some(r.gas_ohms);
                }
                Err(e) => {
                    // Faulted once means out for the rest of the process.
                    warn!("gas sensor fault, disabling: {}", e);
                    gas_faulted = true;
                }
            }
        }
        if gas_faulted {
            self.suite.gas = None;
        }

        // Temperature/humidity slots in configured order.
        for slot in self.suite.temp_humi.iter_mut().filter(|s| s.enabled) {
            let result = async {
                let latency = slot.driver.convert()?;
                sleep(latency + Duration::from_millis(2)).await;
                slot.driver.read_temp_humi()
            }
            .await;
            match result {
                Ok((t, h)) => {
                    record.set(&format!("t_{}", slot.name), t);
                    record.set(&format!("h_{}", slot.name), h);
                }
                Err(e) => {
                    warn!("{} sensor fault, disabling: {}", slot.name, e);
                    slot.enabled = false;
                }
            }
        }

        // Wind: readout is cheap, the background tasks did the work.
        if let Some(wind) = &self.wind {
            let (speed, gust) = wind.anemo.read(Instant::now());
            record.set("wind", speed);
            record.set("gust", gust);
            if let Some(vane) = &wind.vane {
                record.set("wdir", vane.read());
            }
        }

        // PM aggregate: snapshot and reset under one lock so frames decoded
        // mid-cycle land in the next cycle instead of vanishing.
        if let Some((pm25, coarse)) = lock_ignoring_poison(&self.pm).take() {
            record.set("pm25", pm25);
            record.set("pm_coarse", coarse);
        }

        // Rain gauge.
        if let Some(rain) = &mut self.rain {
            let reading = rain.gauge.sample(Local::now(), rain.counter.value());
            if let Some(rate) = reading.rate_in_hr {
                record.set("rain_rate", rate);
                record.set("rain_event", reading.event_in);
                record.set("rain_day", reading.day_in);
            }
        }

        // Derived AQI fields.
        if let Some(ohms) = gas_ohms {
            record.set("aqi_tvoc", f64::from(aqi::tvoc_from_resistance(ohms)));
        }
        if let Some(pm25) = record.get("pm25") {
            record.set("aqi_pm25", f64::from(aqi::pm25(pm25)));
        }

        if !record.is_empty() {
            let mode = self.mode.load(Ordering::Relaxed);
            self.display.render(&record, mode);
            if mode == MODE_NORMAL {
                self.publisher
                    .publish(&format!("{}/sensors", self.topic), &record);
                self.reporter.send(&wx_report(&record));
            }
            info!("cycle complete, {} fields", record.len());
        }

        record
    }

    /// Run the acquisition loop forever with drift-corrected re-scheduling
    /// and watchdog bookkeeping.
    pub async fn run(mut self) {
        let mut nominal = Instant::now();
        loop {
            self.run_cycle().await;
            let now = Instant::now();
            self.marks.mark_scheduler(now);

            let elapsed = now.duration_since(nominal);
            let (next, pause) = next_cycle_start(nominal, now, self.interval);
            if pause.is_none() {
                if next == now {
                    warn!(
                        "scheduling overrun: cycle took {:?}, resyncing to now",
                        elapsed
                    );
                } else {
                    warn!("scheduling overrun: cycle took {:?}, skipping sleep", elapsed);
                }
            }
            if let Some(d) = pause {
                sleep(d).await;
            }
            nominal = next;
        }
    }
}

/// Convert-wait-poll-read sequence for the gas sensor. A sensor that never
/// reports ready stalls the cycle; the external watchdog is the backstop.
async fn read_gas(gas: &mut dyn GasSensor) -> Result<crate::sensors::GasReading, crate::sensors::SensorError> {
    let latency = gas.convert()?;
    sleep(latency).await;
    while !gas.ready() {
        sleep(Duration::from_millis(10)).await;
    }
    gas.read_data()
}

/// Distill the record into the named optional fields of the text-protocol
/// report. Temperature/humidity prefer the dedicated sensor over the gas
/// sensor's internal one; rain converts to hundredths of an inch.
fn wx_report(record: &Record) -> WxReport {
    let pick = |names: &[&str]| names.iter().find_map(|n| record.get(n));
    WxReport {
        temp_c: pick(&["t_sht31", "t_si7021", "t_bme680"]),
        humidity_pct: pick(&["h_sht31", "h_si7021", "h_bme680"]),
        wind_dir_deg: record.get("wdir"),
        wind_mph: record.get("wind"),
        gust_mph: record.get("gust"),
        baro_mbar: record.get("p_bme680").map(|bar| bar * 1000.0),
        rain_rate_cin: record.get("rain_rate").map(|v| v * 100.0),
        rain_event_cin: record.get("rain_event").map(|v| v * 100.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::{NullDisplay, NullReporter};
    use crate::rain;
    use crate::sensors::sim::{FlakyReader, SimGas, SimTempHumi};
    use crate::sensors::{GasReading, TempHumiSensor};

    struct CapturePublisher(Mutex<Vec<(String, Record)>>);

    impl CapturePublisher {
        fn new() -> Arc<Self> {
            Arc::new(CapturePublisher(Mutex::new(Vec::new())))
        }
        fn published(&self) -> Vec<(String, Record)> {
            lock_ignoring_poison(&self.0).clone()
        }
    }

    impl PublishSink for CapturePublisher {
        fn publish(&self, topic: &str, record: &Record) {
            lock_ignoring_poison(&self.0).push((topic.to_string(), record.clone()));
        }
    }

    fn frame(pm25: u16, p03: u16, p25: u16) -> PmFrame {
        PmFrame {
            pm25_atm: pm25,
            particles_ge_0_3um: p03,
            particles_ge_2_5um: p25,
        }
    }

    fn test_suite() -> SensorSuite {
        SensorSuite::probe(
            Some(Box::new(SimGas {
                reading: GasReading {
                    temp_c: 19.5,
                    humidity_pct: 55.0,
                    pressure_mbar: 1012.0,
                    gas_ohms: 150_000.0,
                },
            })),
            vec![(
                "si7021".to_string(),
                Box::new(SimTempHumi {
                    temp_c: 20.5,
                    humidity_pct: 48.0,
                }) as Box<dyn TempHumiSensor>,
            )],
        )
    }

    fn test_scheduler(suite: SensorSuite, pm: SharedPmAggregate) -> (Scheduler, Arc<CapturePublisher>) {
        let publisher = CapturePublisher::new();
        let scheduler = Scheduler::new(
            "esp32/weather/test".to_string(),
            Duration::from_secs(60),
            suite,
            pm,
            publisher.clone(),
            Arc::new(NullReporter),
            Arc::new(NullDisplay),
            Arc::new(AtomicU8::new(MODE_NORMAL)),
            WatchdogMarks::new(),
        );
        (scheduler, publisher)
    }

    #[test]
    fn aggregate_means_and_resets_atomically() {
        let mut agg = PmAggregate::default();
        agg.add(&frame(10, 100, 10));
        agg.add(&frame(20, 200, 20));
        assert_eq!(agg.frame_count(), 2);
        assert_eq!(agg.take(), Some((15.0, 135.0)));
        // The take emptied it: no stale frames leak into the next cycle.
        assert_eq!(agg.take(), None);
    }

    #[test]
    fn drift_undershoot_advances_by_one_interval() {
        let interval = Duration::from_secs(60);
        let t0 = Instant::now();
        let finish = t0 + Duration::from_secs(45);
        let (next, pause) = next_cycle_start(t0, finish, interval);
        assert_eq!(next, t0 + interval);
        assert_eq!(pause, Some(Duration::from_secs(15)));
    }

    #[test]
    fn drift_full_interval_keeps_the_grid() {
        // Cycle took exactly 100% of the interval: next start is one
        // interval after the previous nominal start, not after the finish.
        let interval = Duration::from_secs(60);
        let t0 = Instant::now();
        let finish = t0 + interval;
        let (next, pause) = next_cycle_start(t0, finish, interval);
        assert_eq!(next, t0 + interval);
        assert_eq!(pause, None);
    }

    #[test]
    fn drift_moderate_overrun_skips_sleep_keeps_grid() {
        let interval = Duration::from_secs(60);
        let t0 = Instant::now();
        let finish = t0 + Duration::from_secs(80); // 133%
        let (next, pause) = next_cycle_start(t0, finish, interval);
        assert_eq!(next, t0 + interval);
        assert_eq!(pause, None);
    }

    #[test]
    fn drift_heavy_overrun_resyncs_to_now() {
        let interval = Duration::from_secs(60);
        let t0 = Instant::now();
        let finish = t0 + Duration::from_secs(120); // 200%
        let (next, pause) = next_cycle_start(t0, finish, interval);
        assert_eq!(next, finish);
        assert_eq!(pause, None);
    }

    #[test]
    fn drift_exact_threshold_resyncs() {
        let interval = Duration::from_secs(60);
        let t0 = Instant::now();
        let finish = t0 + Duration::from_secs(90); // exactly 150%
        let (next, _) = next_cycle_start(t0, finish, interval);
        assert_eq!(next, finish);
    }

    #[tokio::test]
    async fn cycle_assembles_record_and_publishes() {
        let pm = shared_aggregate();
        {
            let mut agg = lock_ignoring_poison(&pm);
            agg.add(&frame(10, 1000, 100));
            agg.add(&frame(14, 1200, 200));
        }
        let (mut scheduler, publisher) = test_scheduler(test_suite(), pm.clone());

        let record = scheduler.run_cycle().await;

        assert_eq!(record.get("t_bme680"), Some(19.5));
        assert_eq!(record.get("p_bme680"), Some(1.012));
        assert_eq!(record.get("t_si7021"), Some(20.5));
        assert_eq!(record.get("pm25"), Some(12.0));
        assert_eq!(record.get("pm_coarse"), Some(950.0));
        // pm25 mean of 12 µg/m³ sits at AQI 50 on the first segment edge.
        assert_eq!(record.get("aqi_pm25"), Some(50.0));
        assert!(record.get("aqi_tvoc").is_some());

        // Aggregate was reset by the cycle.
        assert!(lock_ignoring_poison(&pm).take().is_none());

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "esp32/weather/test/sensors");
    }

    #[tokio::test]
    async fn no_frames_means_no_pm_fields() {
        let (mut scheduler, _publisher) = test_scheduler(test_suite(), shared_aggregate());
        let record = scheduler.run_cycle().await;
        assert!(record.get("pm25").is_none());
        assert!(record.get("aqi_pm25").is_none());
        // Gas-based AQI is still there.
        assert!(record.get("aqi_tvoc").is_some());
    }

    #[tokio::test]
    async fn faulted_slot_is_disabled_not_retried() {
        let suite = SensorSuite::probe(
            None,
            vec![
                (
                    "si7021".to_string(),
                    Box::new(SimTempHumi {
                        temp_c: 21.0,
                        humidity_pct: 40.0,
                    }) as Box<dyn TempHumiSensor>,
                ),
                ("sht31".to_string(), Box::new(FlakyReader)),
            ],
        );
        let (mut scheduler, _publisher) = test_scheduler(suite, shared_aggregate());

        let record = scheduler.run_cycle().await;
        assert!(record.get("t_si7021").is_some());
        assert!(record.get("t_sht31").is_none());
        assert!(!scheduler.suite.temp_humi[1].enabled);

        // Second cycle: the flaky slot stays out, the good one keeps going.
        let record = scheduler.run_cycle().await;
        assert!(record.get("t_si7021").is_some());
        assert!(record.get("t_sht31").is_none());
    }

    #[tokio::test]
    async fn non_normal_mode_suppresses_publish() {
        let publisher = CapturePublisher::new();
        let mut scheduler = Scheduler::new(
            "esp32/weather/test".to_string(),
            Duration::from_secs(60),
            test_suite(),
            shared_aggregate(),
            publisher.clone(),
            Arc::new(NullReporter),
            Arc::new(NullDisplay),
            Arc::new(AtomicU8::new(1)), // diagnostics mode
            WatchdogMarks::new(),
        );
        let record = scheduler.run_cycle().await;
        assert!(!record.is_empty());
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn rain_first_sample_contributes_no_fields() {
        struct ZeroCounter;
        impl PulseCounter for ZeroCounter {
            fn value(&self) -> u32 {
                0
            }
        }
        let (scheduler, _publisher) = test_scheduler(test_suite(), shared_aggregate());
        let mut scheduler = scheduler.with_rain(RainSet {
            gauge: RainGauge::new(10, rain::DAY_START_MINUTE),
            counter: Arc::new(ZeroCounter),
        });

        let record = scheduler.run_cycle().await;
        assert!(record.get("rain_rate").is_none());

        // The second sample has a baseline and reports a (dry) rate.
        let record = scheduler.run_cycle().await;
        assert_eq!(record.get("rain_rate"), Some(0.0));
        assert_eq!(record.get("rain_day"), Some(0.0));
    }

    /// Thread-safe byte source for the spawned poller task.
    struct QueueSource(Arc<Mutex<std::collections::VecDeque<u8>>>);

    impl ByteSource for QueueSource {
        fn available(&mut self) -> usize {
            lock_ignoring_poison(&self.0).len()
        }
        fn read(&mut self, buf: &mut [u8]) -> usize {
            let mut q = lock_ignoring_poison(&self.0);
            let n = buf.len().min(q.len());
            for slot in buf.iter_mut().take(n) {
                *slot = q.pop_front().unwrap();
            }
            n
        }
    }

    #[tokio::test]
    async fn pm_poller_feeds_aggregate_and_watchdog() {
        let queue = Arc::new(Mutex::new(std::collections::VecDeque::new()));
        lock_ignoring_poison(&queue).extend(frame(42, 500, 50).encode());
        let parser = PmParser::new(QueueSource(queue.clone()));
        let pm = shared_aggregate();
        let marks = WatchdogMarks::new();

        let handle = start_pm_poller(
            parser,
            pm.clone(),
            marks.clone(),
            Duration::from_millis(5),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        let taken = lock_ignoring_poison(&pm).take();
        assert_eq!(taken, Some((42.0, 450.0)));
        assert!(marks.oldest_age(Instant::now()) < Duration::from_secs(10));
    }
}
