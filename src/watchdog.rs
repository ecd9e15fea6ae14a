//! # Watchdog Liveness Marks and Supervisor
//!
//! Each long-running task records a liveness timestamp after every unit of
//! work: the scheduler after each acquisition cycle, the parser task after
//! each poll tick. A supervisory loop checks the oldest mark on a slow
//! cadence and, if it exceeds the fatal staleness threshold, invokes the
//! installed restart action. Starvation is a supervisory condition, not part
//! of the scheduler's own control flow: the action is a full process restart
//! (on the original hardware, a device reset), never a recoverable error.

use log::error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Oldest-mark age beyond which the process is considered wedged.
pub const FATAL_STALENESS: Duration = Duration::from_secs(10 * 60);
/// Supervisor check cadence; deliberately slow and prime-ish so it drifts
/// against the other task periods.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(33);

/// Per-task liveness marks, stored as milliseconds since construction so the
/// writers stay lock-free.
pub struct WatchdogMarks {
    base: Instant,
    scheduler_ms: AtomicU64,
    parser_poll_ms: AtomicU64,
}

impl WatchdogMarks {
    pub fn new() -> Arc<Self> {
        Arc::new(WatchdogMarks {
            base: Instant::now(),
            scheduler_ms: AtomicU64::new(0),
            parser_poll_ms: AtomicU64::new(0),
        })
    }

    fn since_base(&self, now: Instant) -> u64 {
        now.duration_since(self.base).as_millis() as u64
    }

    /// Record scheduler liveness; call after each acquisition cycle.
    pub fn mark_scheduler(&self, now: Instant) {
        self.scheduler_ms.store(self.since_base(now), Ordering::Relaxed);
    }

    /// Record parser-poll liveness; call after each poll tick.
    pub fn mark_parser_poll(&self, now: Instant) {
        self.parser_poll_ms.store(self.since_base(now), Ordering::Relaxed);
    }

    /// Age of the stalest mark.
    pub fn oldest_age(&self, now: Instant) -> Duration {
        let now_ms = self.since_base(now);
        let oldest = self
            .scheduler_ms
            .load(Ordering::Relaxed)
            .min(self.parser_poll_ms.load(Ordering::Relaxed));
        Duration::from_millis(now_ms.saturating_sub(oldest))
    }
}

/// Supervisory loop over a set of marks; owns the restart action.
pub struct Supervisor {
    marks: Arc<WatchdogMarks>,
    threshold: Duration,
    on_starvation: Box<dyn Fn() + Send + Sync>,
}

impl Supervisor {
    pub fn new(
        marks: Arc<WatchdogMarks>,
        threshold: Duration,
        on_starvation: Box<dyn Fn() + Send + Sync>,
    ) -> Self {
        Supervisor {
            marks,
            threshold,
            on_starvation,
        }
    }

    /// Whether the marks have starved past the threshold.
    pub fn starved(&self, now: Instant) -> bool {
        self.marks.oldest_age(now) > self.threshold
    }

    /// Run forever, invoking the restart action on starvation.
    pub async fn run(self) {
        loop {
            tokio::time::sleep(CHECK_INTERVAL).await;
            let now = Instant::now();
            if self.starved(now) {
                error!(
                    "watchdog starvation: oldest mark {:?} old, restarting",
                    self.marks.oldest_age(now)
                );
                (self.on_starvation)();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_marks_are_not_starved() {
        let marks = WatchdogMarks::new();
        let now = Instant::now();
        marks.mark_scheduler(now);
        marks.mark_parser_poll(now);
        let sup = Supervisor::new(marks, FATAL_STALENESS, Box::new(|| {}));
        assert!(!sup.starved(now + Duration::from_secs(9 * 60)));
    }

    #[test]
    fn one_stale_task_trips_the_threshold() {
        let marks = WatchdogMarks::new();
        let t0 = Instant::now();
        marks.mark_scheduler(t0);
        marks.mark_parser_poll(t0);
        // The scheduler keeps marking, the parser task goes quiet.
        let later = t0 + Duration::from_secs(11 * 60);
        marks.mark_scheduler(later);
        assert!(marks.oldest_age(later) > FATAL_STALENESS);

        let sup = Supervisor::new(marks, FATAL_STALENESS, Box::new(|| {}));
        assert!(sup.starved(later));
    }

    #[test]
    fn oldest_age_tracks_the_stalest_mark() {
        let marks = WatchdogMarks::new();
        let t0 = Instant::now();
        marks.mark_scheduler(t0);
        marks.mark_parser_poll(t0 + Duration::from_secs(60));
        let age = marks.oldest_age(t0 + Duration::from_secs(120));
        assert_eq!(age.as_secs(), 120);
    }
}
