//! Sampler -> estimator -> quality gate -> interpolator, with one retry.
//!
//! A one-shot calibration that fails the quality gate is retried once
//! batch-wise. If that fails too, no correction is applied and the caller gets
//! `None`; [`full_shifts_or_zero`] turns that into all-zero shifts.

use crate::acquisition::AcquisitionCoordinator;
use crate::error::{DaqError, DaqResult};
use crate::hardware::DeviceConnector;
use crate::shift::interpolate::{OutOfRange, ShiftInterpolator};
use crate::shift::quality::QualityGate;
use crate::shift::sampler::{SamplingStrategy, ShiftSampler};
use crate::shift::ShiftVector;
use crate::sync::CancelToken;
use tracing::{info, warn};

/// Closed-loop image-shift correction.
pub struct ShiftCorrection<C: DeviceConnector> {
    sampler: ShiftSampler<C>,
    gate: QualityGate,
    out_of_range: OutOfRange,
}

impl<C: DeviceConnector> ShiftCorrection<C> {
    /// Pipeline using the coordinator's `shift_correction` settings.
    pub fn new(coordinator: AcquisitionCoordinator<C>, camera: impl Into<String>) -> DaqResult<Self> {
        let gate = QualityGate::from_config(&coordinator.settings().shift_correction);
        Ok(Self {
            sampler: ShiftSampler::new(coordinator, camera)?,
            gate,
            out_of_range: OutOfRange::Error,
        })
    }

    /// Pipeline from explicit parts.
    pub fn from_parts(sampler: ShiftSampler<C>, gate: QualityGate) -> Self {
        Self {
            sampler,
            gate,
            out_of_range: OutOfRange::Error,
        }
    }

    /// Policy for output angles outside the sampled range.
    pub fn with_out_of_range(mut self, policy: OutOfRange) -> Self {
        self.out_of_range = policy;
        self
    }

    /// Sample at `sample_angles` and interpolate to `output_angles`.
    ///
    /// Returns `None` when the estimates fail the quality gate with both
    /// strategies (only one-shot is retried). Device, validation and
    /// cancellation errors propagate.
    pub async fn obtain(
        &self,
        sample_angles: &[f64],
        output_angles: &[f64],
        strategy: SamplingStrategy,
        cancel: &CancelToken,
    ) -> DaqResult<Option<Vec<ShiftVector>>> {
        let mut strategy = strategy;
        loop {
            let shifts = self.sampler.sample(sample_angles, strategy, cancel).await?;
            let report = self.gate.check(&shifts);

            if report.passed {
                info!(
                    "{} calibration passed ({} x-extrema, {} y-extrema)",
                    strategy, report.x_extrema, report.y_extrema
                );
                let interpolator = ShiftInterpolator::new(sample_angles, &shifts)?
                    .with_out_of_range(self.out_of_range);
                return interpolator.interpolate(output_angles).map(Some);
            }

            let failure = report.into_result().err();
            match strategy {
                SamplingStrategy::OneShot => {
                    warn!(
                        "One-shot calibration rejected ({}), retrying batch-wise",
                        failure.as_ref().map(DaqError::to_string).unwrap_or_default()
                    );
                    strategy = SamplingStrategy::BatchWise;
                }
                SamplingStrategy::BatchWise => {
                    warn!(
                        "Batch-wise calibration rejected ({}), giving up on shift correction",
                        failure.as_ref().map(DaqError::to_string).unwrap_or_default()
                    );
                    return Ok(None);
                }
            }
        }
    }
}

/// `shifts`, or `count` zero shifts when no correction could be obtained.
pub fn full_shifts_or_zero(shifts: Option<Vec<ShiftVector>>, count: usize) -> Vec<ShiftVector> {
    match shifts {
        Some(shifts) => shifts,
        None => {
            warn!("No usable shift correction; acquiring without image-shift compensation");
            vec![ShiftVector::ZERO; count]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_zero_fallback() {
        assert_eq!(full_shifts_or_zero(None, 3), vec![ShiftVector::ZERO; 3]);
        assert!(logs_contain("No usable shift correction"));
        let shifts = vec![ShiftVector::new(1.0, 1.0)];
        assert_eq!(full_shifts_or_zero(Some(shifts.clone()), 1), shifts);
    }
}
