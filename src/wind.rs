//! # Wind Speed, Gust and Direction Estimation
//!
//! Two cooperating estimators that share nothing but the concept of a
//! background timer:
//!
//! - [`Anemometer`]: derives wind speed from a hardware pulse counter. A
//!   periodic background tick (default every 3 s) measures the pulse rate
//!   over the gust window and retains the running maximum; `read` reports
//!   the average speed since the previous `read` plus the gust peak, then
//!   resets both baselines.
//! - [`Vane`]: samples an analog angle sensor once a second, maps the
//!   reading linearly onto 0..360° and smooths it with a wrap-aware 9:1
//!   exponential moving average so the average never crosses the 0°/360°
//!   seam "the long way".
//!
//! Both structs carry their mutable state behind a mutex so a tokio task can
//! tick them while the scheduler reads; the state transitions themselves are
//! plain synchronous functions taking an explicit `now`, which keeps them
//! directly testable.
//!
//! NOAA standard sampling is a 2-minute average for "wind speed" and a 5 or
//! 8 second average for "wind gust" (<https://www.ndbc.noaa.gov/measdes.shtml>);
//! the defaults here approximate that within the station's cadence.

use log::debug;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Monotonic hardware pulse counter (anemometer contact closures).
pub trait PulseCounter: Send + Sync {
    fn value(&self) -> u32;
}

impl<T: PulseCounter + ?Sized> PulseCounter for Arc<T> {
    fn value(&self) -> u32 {
        (**self).value()
    }
}

/// Raw analog angle sensor with an optional calibration correction.
pub trait AngleSensor: Send {
    /// One raw ADC reading.
    fn read(&mut self) -> u16;
    /// Calibration correction applied to an oversampled average.
    fn correct(&self, raw: u16) -> u16 {
        raw
    }
}

impl<T: AngleSensor + ?Sized> AngleSensor for Box<T> {
    fn read(&mut self) -> u16 {
        (**self).read()
    }
    fn correct(&self, raw: u16) -> u16 {
        (**self).correct(raw)
    }
}

/// Minimum readout window; shorter windows report zero to suppress noise.
const MIN_READ_WINDOW: Duration = Duration::from_secs(3);

fn lock_ignoring_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Anemometer
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AnemoState {
    /// Baseline for the averaged speed returned by `read`.
    read_at: Option<Instant>,
    read_count: u32,
    /// Baseline for the gust window tick.
    gust_at: Option<Instant>,
    gust_count: u32,
    /// Peak pulse rate (Hz) observed over any gust window since last `read`.
    gust_peak_hz: f64,
}

/// Pulse-rate wind speed estimator.
///
/// The calibration factor converts pulse frequency in hertz to mph and is
/// typically around 2.5 to 3.5. (Specify it for km/h or m/s per hertz and
/// `read` reports those units instead.)
pub struct Anemometer<C: PulseCounter> {
    counter: C,
    mph_per_hz: f64,
    state: Mutex<AnemoState>,
}

impl<C: PulseCounter> Anemometer<C> {
    pub fn new(counter: C, mph_per_hz: f64) -> Self {
        Anemometer {
            counter,
            mph_per_hz,
            state: Mutex::new(AnemoState::default()),
        }
    }

    /// One gust-window measurement: pulse delta over the window, retaining
    /// the running maximum. Driven by the background poller.
    pub fn gust_tick(&self, now: Instant) {
        let count = self.counter.value();
        let mut st = lock_ignoring_poison(&self.state);
        if let Some(prev) = st.gust_at {
            let dt = now.duration_since(prev).as_secs_f64();
            if dt > 0.0 {
                let hz = f64::from(count.wrapping_sub(st.gust_count)) / dt;
                if hz > st.gust_peak_hz {
                    st.gust_peak_hz = hz;
                }
            }
        }
        st.gust_at = Some(now);
        st.gust_count = count;
    }

    /// Average speed since the previous `read` plus the gust peak, both in
    /// mph (per the calibration factor's units).
    ///
    /// Resets the gust peak and the speed baseline. Windows shorter than
    /// 3 seconds report `(0, 0)`; a pulse delta over a tiny window is noise,
    /// not wind.
    pub fn read(&self, now: Instant) -> (f64, f64) {
        let count = self.counter.value();
        let mut st = lock_ignoring_poison(&self.state);
        let (speed, gust) = match st.read_at {
            Some(prev) if now.duration_since(prev) >= MIN_READ_WINDOW => {
                let dt = now.duration_since(prev).as_secs_f64();
                let hz = f64::from(count.wrapping_sub(st.read_count)) / dt;
                debug!(
                    "wind: {}-{}={} pulses in {:.1}s -> {:.1} mph",
                    count,
                    st.read_count,
                    count.wrapping_sub(st.read_count),
                    dt,
                    hz * self.mph_per_hz
                );
                (hz * self.mph_per_hz, st.gust_peak_hz * self.mph_per_hz)
            }
            _ => (0.0, 0.0),
        };
        st.read_at = Some(now);
        st.read_count = count;
        st.gust_peak_hz = 0.0;
        (speed, gust)
    }
}

/// Launch the periodic gust poller for the process lifetime.
pub fn start_anemometer<C: PulseCounter + 'static>(
    anemo: Arc<Anemometer<C>>,
    gust_window: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(gust_window);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately and seeds the window baseline.
        loop {
            ticker.tick().await;
            anemo.gust_tick(Instant::now());
        }
    })
}

// ---------------------------------------------------------------------------
// Vane
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct VaneState {
    /// Smoothed direction in degrees from north, within [0, 360).
    direction: f64,
    obs_min: u16,
    obs_max: u16,
}

/// Analog wind vane: maps a voltage-like raw reading to degrees from north.
pub struct Vane<A: AngleSensor> {
    sensor: Mutex<A>,
    raw_min: u16,
    raw_max: u16,
    offset_deg: i64,
    state: Mutex<VaneState>,
}

impl<A: AngleSensor> Vane<A> {
    /// `raw_min`/`raw_max` are the calibrated sensor extremes; `offset_deg`
    /// is the reading when the vane points north.
    ///
    /// # Panics
    /// Panics if `raw_min >= raw_max`: an empty or inverted calibration span
    /// would map every reading to NaN, so it is rejected at construction.
    pub fn new(sensor: A, raw_min: u16, raw_max: u16, offset_deg: i64) -> Self {
        assert!(raw_min < raw_max, "vane calibration bounds inverted");
        Vane {
            sensor: Mutex::new(sensor),
            raw_min,
            raw_max,
            offset_deg,
            state: Mutex::new(VaneState {
                direction: 0.0,
                obs_min: u16::MAX,
                obs_max: 0,
            }),
        }
    }

    /// Observed raw extremes, for calibration bring-up.
    pub fn min_max(&self) -> (u16, u16) {
        let st = lock_ignoring_poison(&self.state);
        (st.obs_min, st.obs_max)
    }

    /// One corrected direction observation in degrees.
    ///
    /// Oversamples the sensor 8×, averages, applies the sensor's calibration
    /// correction, tracks observed min/max, then maps linearly between the
    /// configured bounds onto 0..360 with the north offset. A fraction below
    /// zero wraps by one full turn.
    pub fn raw_direction(&self) -> f64 {
        let corrected = {
            let mut sensor = lock_ignoring_poison(&self.sensor);
            let sum: u32 = (0..8).map(|_| u32::from(sensor.read())).sum();
            sensor.correct((sum / 8) as u16)
        };

        let mut st = lock_ignoring_poison(&self.state);
        if corrected < st.obs_min {
            st.obs_min = corrected;
        }
        if corrected > st.obs_max {
            st.obs_max = corrected;
        }
        drop(st);

        let span = f64::from(self.raw_max) - f64::from(self.raw_min);
        let mut frac = (f64::from(corrected) - f64::from(self.raw_min)) / span;
        if frac < 0.0 {
            frac += 1.0;
        }
        (((frac * 360.0).floor() as i64 + self.offset_deg).rem_euclid(360)) as f64
    }

    /// Wrap-aware 9:1 exponential moving average, rounded.
    ///
    /// Before averaging, whichever of old/new lags the other by more than
    /// 180° is lifted a full turn so the blend crosses the 0°/360° seam the
    /// short way.
    fn smooth(mut old_dir: f64, mut new_dir: f64) -> f64 {
        if new_dir - old_dir > 180.0 {
            old_dir += 360.0;
        } else if old_dir - new_dir > 180.0 {
            new_dir += 360.0;
        }
        ((9.0 * old_dir + new_dir + 5.0) / 10.0).floor().rem_euclid(360.0)
    }

    /// Seed the smoothed direction with one immediate reading. Call once
    /// before the background poller starts.
    pub fn seed(&self) {
        let dir = self.raw_direction();
        lock_ignoring_poison(&self.state).direction = dir;
    }

    /// One smoothing step. Driven by the background poller.
    pub fn tick(&self) {
        let new_dir = self.raw_direction();
        let mut st = lock_ignoring_poison(&self.state);
        st.direction = Self::smooth(st.direction, new_dir);
    }

    /// Current smoothed direction in degrees from north; never blocks on
    /// the sensor.
    pub fn read(&self) -> f64 {
        lock_ignoring_poison(&self.state).direction
    }
}

/// Seed the vane and launch its periodic poller for the process lifetime.
pub fn start_vane<A: AngleSensor + 'static>(
    vane: Arc<Vane<A>>,
    sample_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    vane.seed();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick; the seed already covers it
        loop {
            ticker.tick().await;
            vane.tick();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeCounter(AtomicU32);

    impl FakeCounter {
        fn new() -> Arc<Self> {
            Arc::new(FakeCounter(AtomicU32::new(0)))
        }
        fn add(&self, n: u32) {
            self.0.fetch_add(n, Ordering::SeqCst);
        }
    }

    impl PulseCounter for FakeCounter {
        fn value(&self) -> u32 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct FakeAngle {
        value: u16,
    }

    impl AngleSensor for FakeAngle {
        fn read(&mut self) -> u16 {
            self.value
        }
    }

    #[test]
    fn anemometer_first_read_is_zero() {
        let ctr = FakeCounter::new();
        let anemo = Anemometer::new(ctr.clone(), 2.5);
        ctr.add(100);
        assert_eq!(anemo.read(Instant::now()), (0.0, 0.0));
    }

    #[test]
    fn anemometer_short_window_reads_zero() {
        let ctr = FakeCounter::new();
        let anemo = Anemometer::new(ctr.clone(), 2.5);
        let t0 = Instant::now();
        anemo.read(t0);
        ctr.add(500);
        assert_eq!(anemo.read(t0 + Duration::from_secs(2)), (0.0, 0.0));
    }

    #[test]
    fn anemometer_average_speed_over_window() {
        let ctr = FakeCounter::new();
        let anemo = Anemometer::new(ctr.clone(), 2.5);
        let t0 = Instant::now();
        anemo.read(t0);
        // 150 pulses over 60 s = 2.5 Hz = 6.25 mph at 2.5 mph/Hz.
        ctr.add(150);
        let (speed, gust) = anemo.read(t0 + Duration::from_secs(60));
        assert!((speed - 6.25).abs() < 1e-9, "speed {}", speed);
        // No gust ticks ran, so the gust peak is still zero.
        assert_eq!(gust, 0.0);
    }

    #[test]
    fn gust_peak_is_retained_and_reset_by_read() {
        let ctr = FakeCounter::new();
        let anemo = Anemometer::new(ctr.clone(), 2.5);
        let t0 = Instant::now();
        anemo.read(t0);
        anemo.gust_tick(t0); // seeds the gust baseline

        // Strong 3-second window: 30 pulses = 10 Hz.
        ctr.add(30);
        anemo.gust_tick(t0 + Duration::from_secs(3));
        // Weak window afterwards must not lower the peak.
        ctr.add(3);
        anemo.gust_tick(t0 + Duration::from_secs(6));

        let (_speed, gust) = anemo.read(t0 + Duration::from_secs(10));
        assert!((gust - 25.0).abs() < 1e-9, "gust {}", gust);

        // The peak was reset by the read: only the new, weak window counts.
        ctr.add(1);
        anemo.gust_tick(t0 + Duration::from_secs(13));
        let (_s, gust2) = anemo.read(t0 + Duration::from_secs(16));
        assert!(gust2 < 1.0, "gust peak leaked across read: {}", gust2);
    }

    #[test]
    fn vane_linear_mapping_with_offset() {
        let vane = Vane::new(FakeAngle { value: 256 }, 0, 1024, 0);
        assert_eq!(vane.raw_direction(), 90.0);

        let vane = Vane::new(FakeAngle { value: 256 }, 0, 1024, 90);
        assert_eq!(vane.raw_direction(), 180.0);
    }

    #[test]
    fn vane_negative_fraction_wraps_forward() {
        // Reading below the calibrated minimum wraps by one full turn.
        let vane = Vane::new(FakeAngle { value: 50 }, 100, 900, 0);
        // frac = -0.0625 -> 0.9375 -> 337°
        assert_eq!(vane.raw_direction(), 337.0);
    }

    #[test]
    #[should_panic(expected = "vane calibration bounds inverted")]
    fn vane_rejects_inverted_calibration_bounds() {
        Vane::new(FakeAngle { value: 0 }, 900, 100, 0);
    }

    #[test]
    #[should_panic(expected = "vane calibration bounds inverted")]
    fn vane_rejects_empty_calibration_span() {
        Vane::new(FakeAngle { value: 0 }, 512, 512, 0);
    }

    #[test]
    fn vane_tracks_observed_extremes() {
        let vane = Vane::new(FakeAngle { value: 300 }, 0, 1024, 0);
        vane.raw_direction();
        assert_eq!(vane.min_max(), (300, 300));
    }

    #[test]
    fn smoothing_is_wrap_aware() {
        // From 350° toward 60° the average must travel through 0/360, not
        // through 180. First step lands just short of the seam, second step
        // crosses it.
        let step1 = Vane::<FakeAngle>::smooth(350.0, 60.0);
        assert_eq!(step1, 357.0);
        let step2 = Vane::<FakeAngle>::smooth(step1, 60.0);
        assert_eq!(step2, 3.0);
        // Sanity: nothing near the 180..210 "long way" band.
        assert!(!(90.0..=270.0).contains(&step1));
        assert!(!(90.0..=270.0).contains(&step2));
    }

    #[test]
    fn smoothing_converges_without_wrap() {
        let a = Vane::<FakeAngle>::smooth(20.0, 40.0);
        assert_eq!(a, 22.0);
        let b = Vane::<FakeAngle>::smooth(a, 40.0);
        assert_eq!(b, 24.0);
    }

    #[test]
    fn seed_then_read_returns_seeded_direction() {
        let vane = Vane::new(FakeAngle { value: 512 }, 0, 1024, 0);
        vane.seed();
        assert_eq!(vane.read(), 180.0);
    }
}
