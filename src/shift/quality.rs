//! Plausibility check for estimated shifts.
//!
//! Drift over a tilt series is smooth, so the x and y shift sequences should be
//! close to monotonic. Each strict local minimum or maximum counts as an extremum;
//! too many in either axis means the registration locked onto noise. Extrema
//! that stand out from a neighbour by no more than the tolerance are sub-pixel
//! registration jitter and are not counted.

use crate::config::ShiftCorrectionConfig;
use crate::error::{DaqError, DaqResult};
use crate::shift::ShiftVector;
use tracing::debug;

/// Default maximum number of extrema per axis.
pub const DEFAULT_MAX_EXTREMA: usize = 2;

/// Default extremum tolerance in micrometres (half a 1k pixel on the reference camera).
pub const DEFAULT_EXTREMUM_TOLERANCE_UM: f64 = 0.1;

/// Extrema counts for one shift sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityReport {
    /// Extrema in the x sequence
    pub x_extrema: usize,
    /// Extrema in the y sequence
    pub y_extrema: usize,
    /// Whether both counts are within the limit
    pub passed: bool,
}

impl QualityReport {
    /// Convert a failed report into [`DaqError::RegistrationQuality`].
    pub fn into_result(self) -> DaqResult<()> {
        if self.passed {
            Ok(())
        } else {
            Err(DaqError::RegistrationQuality {
                x_extrema: self.x_extrema,
                y_extrema: self.y_extrema,
            })
        }
    }
}

/// Extrema-count quality gate.
#[derive(Debug, Clone, Copy)]
pub struct QualityGate {
    max_extrema: usize,
    tolerance: f64,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EXTREMA)
    }
}

impl QualityGate {
    /// Gate allowing at most `max_extrema` extrema per axis, with the default
    /// tolerance.
    pub fn new(max_extrema: usize) -> Self {
        Self {
            max_extrema,
            tolerance: DEFAULT_EXTREMUM_TOLERANCE_UM,
        }
    }

    /// Ignore extrema within `tolerance_um` of a neighbour.
    pub fn with_tolerance(mut self, tolerance_um: f64) -> Self {
        self.tolerance = tolerance_um.max(0.0);
        self
    }

    /// Gate configured from settings.
    pub fn from_config(config: &ShiftCorrectionConfig) -> Self {
        Self::new(config.max_extrema).with_tolerance(config.extremum_tolerance_um)
    }

    /// Count extrema and decide.
    pub fn check(&self, shifts: &[ShiftVector]) -> QualityReport {
        let xs: Vec<f64> = shifts.iter().map(|s| s.x).collect();
        let ys: Vec<f64> = shifts.iter().map(|s| s.y).collect();
        let x_extrema = count_extrema(&xs, self.tolerance);
        let y_extrema = count_extrema(&ys, self.tolerance);
        let passed = x_extrema <= self.max_extrema && y_extrema <= self.max_extrema;
        debug!(x_extrema, y_extrema, passed, "Shift quality check");
        QualityReport {
            x_extrema,
            y_extrema,
            passed,
        }
    }
}

/// Number of strict local minima plus strict local maxima that exceed both
/// neighbours by more than `tolerance`.
pub fn count_extrema(values: &[f64], tolerance: f64) -> usize {
    values
        .windows(3)
        .filter(|w| {
            let (left, right) = (w[1] - w[0], w[1] - w[2]);
            (left > tolerance && right > tolerance) || (left < -tolerance && right < -tolerance)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_ramp_passes() {
        let shifts: Vec<ShiftVector> = (0..10)
            .map(|i| ShiftVector::new(i as f64 * 0.1, -(i as f64) * 0.05))
            .collect();
        let report = QualityGate::default().check(&shifts);
        assert_eq!(report.x_extrema, 0);
        assert_eq!(report.y_extrema, 0);
        assert!(report.passed);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_alternating_noise_fails() {
        let shifts: Vec<ShiftVector> = (0..10)
            .map(|i| {
                let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
                ShiftVector::new(sign, 0.0)
            })
            .collect();
        let report = QualityGate::default().check(&shifts);
        assert_eq!(report.x_extrema, 8);
        assert!(!report.passed);
        assert!(matches!(
            report.into_result(),
            Err(DaqError::RegistrationQuality { x_extrema: 8, y_extrema: 0 })
        ));
    }

    #[test]
    fn test_single_turning_point_passes() {
        // Parabolic drift turns once
        let ys = [4.0, 1.0, 0.0, 1.0, 4.0];
        assert_eq!(count_extrema(&ys, 0.0), 1);
    }

    #[test]
    fn test_plateaus_are_not_extrema() {
        assert_eq!(count_extrema(&[0.0, 1.0, 1.0, 0.0], 0.0), 0);
        assert_eq!(count_extrema(&[1.0, 2.0], 0.0), 0);
        assert_eq!(count_extrema(&[], 0.0), 0);
    }

    #[test]
    fn test_sub_pixel_jitter_passes() {
        // Static specimen: registration noise of a few hundredths of a micrometre
        let jitter = [0.0, 0.021, -0.012, 0.018, -0.025, 0.004, 0.02, -0.019, 0.011];
        let shifts: Vec<ShiftVector> = jitter
            .iter()
            .zip(jitter.iter().rev())
            .map(|(&x, &y)| ShiftVector::new(x, y))
            .collect();

        assert!(count_extrema(&jitter, 0.0) > DEFAULT_MAX_EXTREMA);
        let report = QualityGate::default().check(&shifts);
        assert_eq!((report.x_extrema, report.y_extrema), (0, 0));
        assert!(report.passed);
    }

    #[test]
    fn test_extremum_just_above_tolerance_counts() {
        assert_eq!(count_extrema(&[0.0, 0.15, 0.0], 0.1), 1);
        assert_eq!(count_extrema(&[0.0, 0.15, 0.1], 0.1), 0);
        let gate = QualityGate::new(0).with_tolerance(0.1);
        assert!(!gate.check(&[ShiftVector::ZERO, ShiftVector::new(0.0, -0.2), ShiftVector::ZERO]).passed);
    }
}
