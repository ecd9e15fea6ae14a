//! # Air Quality Index Interpolation
//!
//! Piecewise-linear mapping from a pollutant concentration to the 0..500 AQI
//! scale, following the standard breakpoint formulation
//! (<https://en.wikipedia.org/wiki/Air_quality_index>).
//!
//! Two fixed breakpoint tables are provided: one for PM2.5 mass concentration
//! in µg/m³ and one for a gas-resistance-derived TVOC proxy. Gas resistance is
//! inversely related to pollutant concentration, so resistance readings are
//! first transformed through `20 - log2(ohms)` to obtain a value that grows
//! with pollution, and the resistance breakpoints are transformed the same way.
//!
//! The interpolator is a pure function: no hidden state, same input always
//! yields the same index.

/// AQI index thresholds paired positionally with every breakpoint table.
pub const AQI_STEPS: [u16; 6] = [50, 100, 150, 200, 300, 500];

/// PM2.5 concentration breakpoints in µg/m³ (EPA 24-hour scale).
pub const PM25_BREAKPOINTS: [f64; 6] = [12.0, 35.4, 55.4, 150.4, 250.4, 500.4];

/// BME680 gas resistance breakpoints in ohms, best to worst air.
///
/// Adapted from community-calibrated thresholds for the sensor's heater
/// profile. Stored in the resistance domain; [`tvoc_breakpoints`] transforms
/// them into the interpolation domain.
const TVOC_RESISTANCE_BREAKPOINTS: [f64; 6] =
    [420_000.0, 210_000.0, 105_000.0, 55_000.0, 27_500.0, 13_500.0];

/// TVOC breakpoints in the `20 - log2(ohms)` domain, strictly increasing.
pub fn tvoc_breakpoints() -> [f64; 6] {
    let mut table = [0.0; 6];
    for (slot, ohms) in table.iter_mut().zip(TVOC_RESISTANCE_BREAKPOINTS) {
        *slot = 20.0 - ohms.log2();
    }
    table
}

/// Walk a breakpoint table and linearly interpolate the AQI for `value`.
///
/// Values above the top breakpoint clamp to the top index (500). Within the
/// table, the segment containing `value` is found by linear scan from the
/// bottom; each segment's lower edge is the previous breakpoint + 0.1 with the
/// previous index + 1 (0/0 for the first segment), and the result is rounded
/// to the nearest integer index.
pub fn interpolate(value: f64, breakpoints: &[f64; 6]) -> u16 {
    if value > breakpoints[5] {
        return AQI_STEPS[5];
    }
    let mut c_low = 0.0;
    let mut i_low = 0.0;
    let mut ix = 0;
    while value > breakpoints[ix] {
        c_low = breakpoints[ix] + 0.1;
        i_low = f64::from(AQI_STEPS[ix]) + 1.0;
        ix += 1;
    }
    let c_high = breakpoints[ix];
    let i_high = f64::from(AQI_STEPS[ix]);
    let aqi = (i_high - i_low) / (c_high - c_low) * (value - c_low) + i_low;
    (aqi + 0.5) as u16
}

/// AQI from a PM2.5 mass concentration in µg/m³.
pub fn pm25(concentration: f64) -> u16 {
    interpolate(concentration, &PM25_BREAKPOINTS)
}

/// AQI proxy from a BME680 gas resistance reading in ohms.
pub fn tvoc_from_resistance(ohms: f64) -> u16 {
    let r = (20.0 - ohms.log2()).max(0.0);
    interpolate(r, &tvoc_breakpoints())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_index_at_every_breakpoint() {
        for (i, &bp) in PM25_BREAKPOINTS.iter().enumerate() {
            assert_eq!(
                interpolate(bp, &PM25_BREAKPOINTS),
                AQI_STEPS[i],
                "breakpoint {} should map exactly to its index",
                bp
            );
        }
        let tvoc = tvoc_breakpoints();
        for (i, &bp) in tvoc.iter().enumerate() {
            assert_eq!(interpolate(bp, &tvoc), AQI_STEPS[i]);
        }
    }

    #[test]
    fn monotonic_non_decreasing() {
        let mut last = 0;
        let mut v = 0.0;
        while v < 520.0 {
            let idx = interpolate(v, &PM25_BREAKPOINTS);
            assert!(
                idx >= last,
                "AQI went backwards at {} ({} < {})",
                v,
                idx,
                last
            );
            last = idx;
            v += 0.25;
        }
    }

    #[test]
    fn clamps_above_top_breakpoint() {
        assert_eq!(interpolate(500.5, &PM25_BREAKPOINTS), 500);
        assert_eq!(interpolate(10_000.0, &PM25_BREAKPOINTS), 500);
    }

    #[test]
    fn interpolates_within_first_segment() {
        // Halfway into the 0..12.0 segment maps halfway into 0..50.
        assert_eq!(pm25(6.0), 25);
        assert_eq!(pm25(0.0), 0);
    }

    #[test]
    fn idempotent_pure_function() {
        assert_eq!(pm25(42.0), pm25(42.0));
        assert_eq!(tvoc_from_resistance(100_000.0), tvoc_from_resistance(100_000.0));
    }

    #[test]
    fn tvoc_table_matches_resistance_transform() {
        // The transformed table must stay strictly increasing, and the
        // known first entry is 20 - log2(420000) ≈ 1.31997.
        let table = tvoc_breakpoints();
        assert!((table[0] - 1.319_969).abs() < 1e-5);
        for w in table.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn tvoc_resistance_clamps_negative_transform() {
        // Extremely clean air (huge resistance) transforms below zero and
        // must clamp to index 0 territory rather than extrapolate.
        assert_eq!(tvoc_from_resistance(4.0e9), 0);
    }

    #[test]
    fn tvoc_dirty_air_scores_high() {
        // 13.5 kΩ is the top breakpoint: exactly 500.
        assert_eq!(tvoc_from_resistance(13_500.0), 500);
        assert_eq!(tvoc_from_resistance(8_000.0), 500);
    }
}
