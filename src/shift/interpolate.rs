//! Sparse shift samples to one shift per output angle.
//!
//! An output angle equal to a sample angle gets that sample exactly. Anything
//! else is interpolated linearly between the two samples that bracket it, and
//! only those two. Angles outside the sampled range are an error unless
//! clamping is requested; values are never extrapolated.

use crate::error::{DaqError, DaqResult};
use crate::shift::ShiftVector;

/// What to do with output angles outside the sampled range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutOfRange {
    /// Reject the request
    #[default]
    Error,
    /// Use the nearest end sample
    Clamp,
}

/// Piecewise-linear interpolator over monotonic sample angles.
#[derive(Debug, Clone)]
pub struct ShiftInterpolator {
    // Stored ascending
    angles: Vec<f64>,
    shifts: Vec<ShiftVector>,
    out_of_range: OutOfRange,
}

impl ShiftInterpolator {
    /// Build from samples sorted ascending or descending.
    pub fn new(angles: &[f64], shifts: &[ShiftVector]) -> DaqResult<Self> {
        if angles.is_empty() {
            return Err(DaqError::validation(
                "sample_angles",
                "at least one sample is required",
            ));
        }
        if angles.len() != shifts.len() {
            return Err(DaqError::validation(
                "sample_shifts",
                format!(
                    "{} shifts for {} sample angles",
                    shifts.len(),
                    angles.len()
                ),
            ));
        }

        let ascending = angles.windows(2).all(|w| w[0] < w[1]);
        let descending = angles.windows(2).all(|w| w[0] > w[1]);
        let (angles, shifts) = if ascending {
            (angles.to_vec(), shifts.to_vec())
        } else if descending {
            (
                angles.iter().rev().copied().collect(),
                shifts.iter().rev().copied().collect(),
            )
        } else {
            return Err(DaqError::validation(
                "sample_angles",
                "sample angles must be strictly ascending or strictly descending",
            ));
        };

        Ok(Self {
            angles,
            shifts,
            out_of_range: OutOfRange::Error,
        })
    }

    /// Choose the out-of-range policy.
    pub fn with_out_of_range(mut self, policy: OutOfRange) -> Self {
        self.out_of_range = policy;
        self
    }

    /// Shift at `alpha`.
    pub fn at(&self, alpha: f64) -> DaqResult<ShiftVector> {
        let first = self.angles[0];
        let last = self.angles[self.angles.len() - 1];

        if !alpha.is_finite() {
            return Err(DaqError::validation(
                "output_angles",
                format!("{alpha} is not a tilt angle"),
            ));
        }
        if alpha < first || alpha > last {
            return match self.out_of_range {
                OutOfRange::Clamp if alpha < first => Ok(self.shifts[0]),
                OutOfRange::Clamp => Ok(self.shifts[self.shifts.len() - 1]),
                OutOfRange::Error => Err(DaqError::validation(
                    "output_angles",
                    format!("{alpha} deg is outside the sampled range [{first}, {last}]"),
                )),
            };
        }

        // Index of the first sample angle >= alpha
        let upper = self.angles.partition_point(|&a| a < alpha);
        if self.angles[upper] == alpha {
            return Ok(self.shifts[upper]);
        }

        let lower = upper - 1;
        let (a0, a1) = (self.angles[lower], self.angles[upper]);
        let (s0, s1) = (self.shifts[lower], self.shifts[upper]);
        let t = (alpha - a0) / (a1 - a0);
        Ok(ShiftVector::new(
            s0.x + (s1.x - s0.x) * t,
            s0.y + (s1.y - s0.y) * t,
        ))
    }

    /// One shift per output angle, in output order.
    pub fn interpolate(&self, output_angles: &[f64]) -> DaqResult<Vec<ShiftVector>> {
        output_angles.iter().map(|&alpha| self.at(alpha)).collect()
    }
}
