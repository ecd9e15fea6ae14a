//! # Weather Station Entry Point
//!
//! Composes the acquisition pipeline from the station configuration and runs
//! it until killed. Hardware attaches behind the library's driver traits; the
//! `--sim` flag substitutes in-process simulated drivers so the whole
//! pipeline can run on a desk, which is also how the acquisition behavior is
//! soak-tested.

use anyhow::Result;
use log::info;
use std::env;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use std::time::Instant;
use weather_station::config::Config;
use weather_station::pms::{ByteSource, PmFrame, PmParser};
use weather_station::publish::{LogPublisher, NullDisplay, NullReporter};
use weather_station::rain::RainGauge;
use weather_station::scheduler::{self, RainSet, Scheduler, WindSet, MODE_NORMAL};
use weather_station::sensors::{sim, GasReading, SensorSuite, TempHumiSensor};
use weather_station::watchdog::{Supervisor, WatchdogMarks, FATAL_STALENESS};
use weather_station::wind::{
    start_anemometer, start_vane, Anemometer, AngleSensor, PulseCounter, Vane,
};

/// Simulated PMSx003 UART: emits one valid frame per second with a slow
/// triangle sweep on the PM2.5 field.
struct SimUart {
    started: Instant,
    emitted: u64,
    pending: Vec<u8>,
}

impl SimUart {
    fn new() -> Self {
        SimUart {
            started: Instant::now(),
            emitted: 0,
            pending: Vec::new(),
        }
    }

    fn refill(&mut self) {
        let due = self.started.elapsed().as_secs();
        while self.emitted < due {
            self.emitted += 1;
            let sweep = (self.emitted % 120) as u16;
            let pm25 = if sweep < 60 { sweep } else { 120 - sweep };
            let frame = PmFrame {
                pm25_atm: pm25,
                particles_ge_0_3um: 50 * pm25 + 300,
                particles_ge_2_5um: 2 * pm25,
            };
            self.pending.extend(frame.encode());
        }
    }
}

impl ByteSource for SimUart {
    fn available(&mut self) -> usize {
        self.refill();
        self.pending.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

/// Simulated pulse counter ticking at a fixed rate since process start.
struct SimPulses {
    started: Instant,
    per_sec: f64,
}

impl SimPulses {
    fn new(per_sec: f64) -> Self {
        SimPulses {
            started: Instant::now(),
            per_sec,
        }
    }
}

impl PulseCounter for SimPulses {
    fn value(&self) -> u32 {
        (self.started.elapsed().as_secs_f64() * self.per_sec) as u32
    }
}

/// Simulated wind vane drifting one raw count per second.
struct SimVane {
    started: Instant,
    span: u16,
}

impl AngleSensor for SimVane {
    fn read(&mut self) -> u16 {
        (self.started.elapsed().as_secs() % u64::from(self.span)) as u16
    }
}

fn simulated_suite() -> SensorSuite {
    SensorSuite::probe(
        Some(Box::new(sim::SimGas {
            reading: GasReading {
                temp_c: 21.0,
                humidity_pct: 45.0,
                pressure_mbar: 1013.2,
                gas_ohms: 180_000.0,
            },
        })),
        vec![(
            "si7021".to_string(),
            Box::new(sim::SimTempHumi {
                temp_c: 21.4,
                humidity_pct: 47.0,
            }) as Box<dyn TempHumiSensor>,
        )],
    )
}

async fn run(config: Config) -> Result<()> {
    let marks = WatchdogMarks::new();
    let mode = Arc::new(AtomicU8::new(MODE_NORMAL));

    // Continuous PM decode into the shared aggregate.
    let aggregate = scheduler::shared_aggregate();
    scheduler::start_pm_poller(
        PmParser::new(SimUart::new()),
        aggregate.clone(),
        marks.clone(),
        config.uart_poll_interval(),
    );

    // Wind estimators and their background samplers.
    let cal = &config.calibration;
    let anemo_counter: Arc<dyn PulseCounter> = Arc::new(SimPulses::new(2.0));
    let anemo = Arc::new(Anemometer::new(anemo_counter, cal.anemometer_mph_per_hz));
    start_anemometer(anemo.clone(), config.gust_window());

    let vane_sensor: Box<dyn AngleSensor> = Box::new(SimVane {
        started: Instant::now(),
        span: cal.vane_raw_max.max(1),
    });
    let vane = Arc::new(Vane::new(
        vane_sensor,
        cal.vane_raw_min,
        cal.vane_raw_max,
        cal.vane_north_offset_deg,
    ));
    start_vane(vane.clone(), config.vane_sample_interval());

    let rain = RainSet {
        gauge: RainGauge::new(cal.rain_mils_per_tip, cal.rain_day_start_minute),
        counter: Arc::new(SimPulses::new(0.002)),
    };

    // Self-restart on pipeline starvation; the service manager respawns us.
    let supervisor = Supervisor::new(
        marks.clone(),
        FATAL_STALENESS,
        Box::new(|| {
            log::error!("acquisition pipeline starved, exiting for restart");
            std::process::exit(1);
        }),
    );
    tokio::spawn(supervisor.run());

    let scheduler = Scheduler::new(
        config.topic(),
        config.query_interval(),
        simulated_suite(),
        aggregate,
        Arc::new(LogPublisher),
        Arc::new(NullReporter),
        Arc::new(NullDisplay),
        mode,
        marks,
    )
    .with_wind(WindSet {
        anemo,
        vane: Some(vane),
    })
    .with_rain(rain);

    scheduler.run().await;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let simulated = env::args().any(|arg| arg == "--sim");
    if !simulated {
        anyhow::bail!("no hardware drivers compiled into this build; run with --sim");
    }

    let config = Config::load();
    info!(
        "starting station '{}', publishing to {}",
        config.station.location,
        config.topic()
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))
}
