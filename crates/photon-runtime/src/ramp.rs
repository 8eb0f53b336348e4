//! Laser power ramp curves.
//!
//! A ramp of `duration_s` at `rate_hz` is discretised into
//! `n = round(duration_s * rate_hz)` intervals, clamped to
//! `1..=MAX_RAMP_INTERVALS`.  Step `i` of `0..=n` is written at `t = i / n`;
//! the final step always lands exactly on the end power.

use photon_types::{RampLaserPowerParams, RampType};

/// Upper bound on ramp intervals: a day at 10 Hz fits comfortably.
pub const MAX_RAMP_INTERVALS: u32 = 1_000_000;

/// Power at normalised time `t` (clamped to `[0, 1]`).
///
/// | Curve | Value |
/// |---|---|
/// | `LINEAR` | `start + (end - start) * t` |
/// | `LOGARITHMIC` | `start + (end - start) * log10(1 + 9t)` |
/// | `EXPONENTIAL` | `start + (end - start) * t²` |
/// | `CONSTANT` | `end` |
pub fn ramp_value(curve: RampType, start: f64, end: f64, t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    let span = end - start;
    match curve {
        RampType::Linear => start + span * t,
        RampType::Logarithmic => start + span * (1.0 + 9.0 * t).log10(),
        RampType::Exponential => start + span * t * t,
        RampType::Constant => end,
    }
}

/// Number of intervals for a ramp; never zero, never above
/// [`MAX_RAMP_INTERVALS`].
pub fn interval_count(duration_s: f64, rate_hz: u32) -> u32 {
    let n = (duration_s * f64::from(rate_hz)).round();
    if n.is_nan() || n < 1.0 {
        1
    } else if n >= f64::from(MAX_RAMP_INTERVALS) {
        MAX_RAMP_INTERVALS
    } else {
        n as u32
    }
}

/// Power values written by a ramp, first to last (`n + 1` of them),
/// computed lazily.
pub fn ramp_steps(params: &RampLaserPowerParams, rate_hz: u32) -> impl Iterator<Item = f64> + '_ {
    let n = interval_count(params.duration_s, rate_hz);
    (0..=n).map(move |i| {
        ramp_value(
            params.ramp_type,
            params.start_power_watts,
            params.end_power_watts,
            f64::from(i) / f64::from(n),
        )
    })
}

/// [`ramp_steps`] collected.
pub fn ramp_schedule(params: &RampLaserPowerParams, rate_hz: u32) -> Vec<f64> {
    ramp_steps(params, rate_hz).collect()
}
