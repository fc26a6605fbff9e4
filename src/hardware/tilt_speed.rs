//! Conversion from tilt speed in degrees per second to the stage's fractional
//! speed parameter.
//!
//! The stage setter does not take degrees per second. The mapping below is an
//! empirical calibration: linear at low speeds, cubic regression above 1.5 deg/s.
//! The non-zero intercepts absorb a constant command delay.

use crate::error::{DaqError, DaqResult};

/// Fastest tilt the stage supports, in degrees per second.
pub const MAX_TILT_SPEED_DEG_PER_S: f64 = 15.0;

/// Boundary between the linear and cubic regimes, in degrees per second.
pub const CUBIC_REGIME_START_DEG_PER_S: f64 = 1.5;

const LINEAR_SLOPE: f64 = 0.034841591;
const LINEAR_INTERCEPT: f64 = 0.000376177;

/// Slowest tilt the stage supports (about 0.0108 deg/s): the linear fit's zero.
pub const MIN_TILT_SPEED_DEG_PER_S: f64 = LINEAR_INTERCEPT / LINEAR_SLOPE;

/// Degrees per second of travel per unit of fractional speed in the linear regime.
pub const DEG_PER_S_PER_FRACTION: f64 = 1.0 / LINEAR_SLOPE;

/// Convert a tilt speed in degrees per second to the fractional speed.
///
/// # Errors
/// Speeds above 15 deg/s or at/below the minimum cannot be produced by the stage,
/// nor can speeds whose fitted fraction falls outside (0, 1] (the top of the
/// cubic fit, from about 14.87 deg/s).
pub fn fractional_tilt_speed(speed_deg_per_s: f64) -> DaqResult<f64> {
    let fraction = fit_fraction(speed_deg_per_s)?;
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(DaqError::validation(
            "tilt_speed",
            format!("{speed_deg_per_s:.4} deg/s maps to fractional speed {fraction:.4}, outside (0, 1]"),
        ));
    }
    Ok(fraction)
}

fn fit_fraction(speed_deg_per_s: f64) -> DaqResult<f64> {
    if !speed_deg_per_s.is_finite() {
        return Err(DaqError::validation(
            "tilt_speed",
            format!("{speed_deg_per_s} deg/s is not a finite speed"),
        ));
    }

    if speed_deg_per_s > MAX_TILT_SPEED_DEG_PER_S {
        Err(DaqError::validation(
            "tilt_speed",
            format!(
                "{speed_deg_per_s:.4} deg/s exceeds the maximum tilt speed of {MAX_TILT_SPEED_DEG_PER_S} deg/s"
            ),
        ))
    } else if speed_deg_per_s > CUBIC_REGIME_START_DEG_PER_S {
        let v = speed_deg_per_s;
        Ok(0.000267533 * v.powi(3) - 0.002387867 * v.powi(2) + 0.043866877 * v - 0.004913243)
    } else if speed_deg_per_s <= MIN_TILT_SPEED_DEG_PER_S {
        Err(DaqError::validation(
            "tilt_speed",
            format!(
                "{speed_deg_per_s:.4} deg/s is below the minimum tilt speed of {MIN_TILT_SPEED_DEG_PER_S:.4} deg/s"
            ),
        ))
    } else {
        Ok(LINEAR_SLOPE * speed_deg_per_s - LINEAR_INTERCEPT)
    }
}

/// Speed needed to cover `distance_deg` in `duration_s`, as a fractional speed.
pub fn fractional_speed_for(distance_deg: f64, duration_s: f64) -> DaqResult<f64> {
    if !(duration_s > 0.0) {
        return Err(DaqError::validation(
            "exposure_time",
            format!("cannot tilt over a non-positive duration ({duration_s} s)"),
        ));
    }
    fractional_tilt_speed(distance_deg.abs() / duration_s)
}
