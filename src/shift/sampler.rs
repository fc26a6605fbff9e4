//! Calibration image acquisition at sparse tilt angles.
//!
//! Two strategies:
//!
//! - **One-shot**: a single stationary-angle series over `[0, angles...]`, every
//!   image registered against the angle-0 reference.
//! - **Batch-wise**: negative and non-negative angles are handled separately,
//!   each starting from 0 and walking outwards in batches. Every batch starts
//!   with a fresh reference at the current angle, and the image shift is
//!   advanced to the batch's last correction before the next batch, so large
//!   cumulative drift never has to be registered in one go.

use crate::acquisition::device_state::DeviceStateSnapshot;
use crate::acquisition::{AcquisitionCoordinator, AcquisitionRequest};
use crate::error::{DaqError, DaqResult};
use crate::hardware::{DeviceConnector, ImageShift, Sampling, TiltStage};
use crate::shift::estimator::ShiftEstimator;
use crate::shift::{CalibrationSample, ShiftVector};
use crate::sync::CancelToken;
use std::fmt;
use tracing::{debug, error, info};

/// How calibration images are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    /// One series, one reference
    OneShot,
    /// Per-sign batches with a moving reference
    BatchWise,
}

impl fmt::Display for SamplingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplingStrategy::OneShot => f.write_str("one-shot"),
            SamplingStrategy::BatchWise => f.write_str("batch-wise"),
        }
    }
}

/// Most calibration angles a single calibration may request.
pub const MAX_SAMPLE_ANGLES: usize = 1000;

/// Angles at which to take calibration images between `start` and `stop`.
///
/// Evenly spaced with at most `interval` degrees between neighbours, always
/// including 0. Ordered from `start` towards `stop`.
pub fn compute_sample_angles(start: f64, stop: f64, interval: f64) -> DaqResult<Vec<f64>> {
    if !(interval > 0.0 && interval.is_finite()) {
        return Err(DaqError::validation(
            "correction_interval",
            format!("must be a positive number of degrees, got {interval}"),
        ));
    }
    if !(start.is_finite() && stop.is_finite()) {
        return Err(DaqError::validation(
            "tilt_range",
            format!("[{start}, {stop}] is not a finite range"),
        ));
    }

    let span = stop - start;
    let intervals = (span.abs() / interval).ceil();
    if intervals >= MAX_SAMPLE_ANGLES as f64 {
        return Err(DaqError::validation(
            "correction_interval",
            format!(
                "{interval} deg over [{start}, {stop}] needs more than {MAX_SAMPLE_ANGLES} calibration images"
            ),
        ));
    }
    let count = intervals as usize + 1;
    let mut angles: Vec<f64> = if count == 1 {
        vec![start]
    } else {
        (0..count)
            .map(|i| start + span * i as f64 / (count - 1) as f64)
            .collect()
    };

    if !angles.iter().any(|&a| a.abs() < 1e-9) {
        angles.push(0.0);
        if start <= stop {
            angles.sort_by(f64::total_cmp);
        } else {
            angles.sort_by(|a, b| b.total_cmp(a));
        }
    }
    Ok(angles)
}

/// Split `items` into `ceil(len / max)` batches whose sizes differ by at most one.
fn split_batches<T>(items: &[T], max: usize) -> Vec<&[T]> {
    if items.is_empty() {
        return Vec::new();
    }
    let max = max.max(1);
    let batches = items.len().div_ceil(max);
    let base = items.len() / batches;
    let extra = items.len() % batches;

    let mut out = Vec::with_capacity(batches);
    let mut start = 0;
    for i in 0..batches {
        let len = base + usize::from(i < extra);
        out.push(&items[start..start + len]);
        start += len;
    }
    out
}

/// Takes calibration images and estimates their compensating shifts.
pub struct ShiftSampler<C: DeviceConnector> {
    coordinator: AcquisitionCoordinator<C>,
    estimator: ShiftEstimator,
    camera: String,
    exposure_time: f64,
    sampling: Sampling,
    batch_size: usize,
}

impl<C: DeviceConnector> ShiftSampler<C> {
    /// Sampler using the coordinator's `shift_correction` settings.
    pub fn new(coordinator: AcquisitionCoordinator<C>, camera: impl Into<String>) -> DaqResult<Self> {
        let config = &coordinator.settings().shift_correction;
        let sampling = config.calibration_sampling.parse()?;
        Ok(Self {
            estimator: ShiftEstimator::from_config(config),
            exposure_time: config.calibration_exposure_s,
            batch_size: config.batch_size,
            sampling,
            camera: camera.into(),
            coordinator,
        })
    }

    /// Override the calibration exposure time.
    pub fn with_exposure_time(mut self, seconds: f64) -> Self {
        self.exposure_time = seconds;
        self
    }

    /// Override the calibration sampling.
    pub fn with_sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }

    /// Override the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Compensating shift for every angle in `angles`, in input order.
    ///
    /// The blanker/valve/screen flags are restored afterwards, or the instrument
    /// is made safe if the sampling was cancelled.
    pub async fn sample(
        &self,
        angles: &[f64],
        strategy: SamplingStrategy,
        cancel: &CancelToken,
    ) -> DaqResult<Vec<ShiftVector>> {
        if angles.is_empty() {
            return Err(DaqError::validation(
                "sample_angles",
                "at least one calibration angle is required",
            ));
        }
        if let Some(bad) = angles.iter().find(|a| !a.is_finite()) {
            return Err(DaqError::validation(
                "sample_angles",
                format!("{bad} is not a tilt angle"),
            ));
        }

        info!(
            "Sampling shifts at {} angles ({})",
            angles.len(),
            strategy
        );
        let connection = self.coordinator.connector().connect()?;
        let snapshot = DeviceStateSnapshot::capture_and_prepare(&connection).await?;

        let result = match strategy {
            SamplingStrategy::OneShot => self.one_shot(&connection, angles, cancel).await,
            SamplingStrategy::BatchWise => self.batch_wise(&connection, angles, cancel).await,
        };

        let teardown = match &result {
            Err(DaqError::Cancelled) => DeviceStateSnapshot::make_safe(&connection, false).await,
            _ => snapshot.restore(&connection).await,
        };
        match (result, teardown) {
            (Ok(shifts), Ok(())) => Ok(shifts),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), teardown) => {
                if let Err(teardown_error) = teardown {
                    error!("Teardown after failed sampling also failed: {}", teardown_error);
                }
                Err(e)
            }
        }
    }

    async fn one_shot(
        &self,
        connection: &C::Connection,
        angles: &[f64],
        cancel: &CancelToken,
    ) -> DaqResult<Vec<ShiftVector>> {
        let origin = connection.image_shift().await?;

        let mut series_angles = Vec::with_capacity(angles.len() + 1);
        series_angles.push(0.0);
        series_angles.extend_from_slice(angles);

        let samples = self.calibration_samples(&series_angles, cancel).await?;
        let shifts = self.estimator.estimate_samples(&samples)?;
        Ok(shifts.into_iter().map(|s| s + origin).collect())
    }

    async fn batch_wise(
        &self,
        connection: &C::Connection,
        angles: &[f64],
        cancel: &CancelToken,
    ) -> DaqResult<Vec<ShiftVector>> {
        let (mut negatives, mut positives): (Vec<(usize, f64)>, Vec<(usize, f64)>) =
            angles.iter().copied().enumerate().partition(|&(_, a)| a < 0.0);

        // Walk each sign outwards from 0
        let starts_positive = angles[0] > 0.0;
        if starts_positive {
            positives.reverse();
        } else {
            negatives.reverse();
        }
        let groups = if starts_positive {
            [positives, negatives]
        } else {
            [negatives, positives]
        };

        let stationary_speed = self.coordinator.settings().timing.stationary_tilt_speed;
        let mut shifts = vec![ShiftVector::ZERO; angles.len()];

        for group in groups.iter().filter(|g| !g.is_empty()) {
            connection.tilt_to(0.0, stationary_speed).await?;
            connection.set_image_shift(ShiftVector::ZERO).await?;

            for batch in split_batches(group, self.batch_size) {
                if cancel.is_cancelled() {
                    return Err(DaqError::Cancelled);
                }

                let origin = connection.image_shift().await?;
                let here = connection.stage_alpha().await?;

                let mut series_angles = Vec::with_capacity(batch.len() + 1);
                series_angles.push(here);
                series_angles.extend(batch.iter().map(|&(_, a)| a));

                let samples = self.calibration_samples(&series_angles, cancel).await?;
                let relative = self.estimator.estimate_samples(&samples)?;
                for (&(index, _), shift) in batch.iter().zip(relative) {
                    shifts[index] = origin + shift;
                }

                if let Some(&(last, alpha)) = batch.last() {
                    debug!(
                        "Batch of {} done at {:.2} deg, advancing image shift to {:?}",
                        batch.len(),
                        alpha,
                        shifts[last]
                    );
                    connection.set_image_shift(shifts[last]).await?;
                }
            }
        }

        Ok(shifts)
    }

    async fn calibration_samples(
        &self,
        angles: &[f64],
        cancel: &CancelToken,
    ) -> DaqResult<Vec<CalibrationSample>> {
        let request = AcquisitionRequest::builder(self.camera.as_str(), angles.len())
            .exposure_time(self.exposure_time)
            .sampling(self.sampling)
            .blanker_optimization(true)
            .stationary_angles(angles.to_vec())
            .build();
        let series = self
            .coordinator
            .acquisition_series_until(&request, cancel.cancelled())
            .await?;
        CalibrationSample::from_series(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_angles_include_zero() {
        let angles = compute_sample_angles(-30.0, 30.0, 10.0).unwrap();
        assert_eq!(angles, vec![-30.0, -20.0, -10.0, 0.0, 10.0, 20.0, 30.0]);

        let angles = compute_sample_angles(-25.0, 25.0, 10.0).unwrap();
        assert_eq!(angles.len(), 7);
        assert!(angles.contains(&0.0));
        assert!(angles.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_sample_angles_follow_direction() {
        let angles = compute_sample_angles(15.0, -15.0, 10.0).unwrap();
        assert_eq!(angles.first(), Some(&15.0));
        assert!(angles.windows(2).all(|w| w[0] > w[1]));
        assert!(angles.contains(&0.0));
    }

    #[test]
    fn test_sample_angles_reject_bad_interval() {
        assert!(compute_sample_angles(-10.0, 10.0, 0.0).is_err());
        assert!(compute_sample_angles(-10.0, 10.0, -1.0).is_err());
    }

    #[test]
    fn test_sample_angles_capped() {
        let err = compute_sample_angles(-60.0, 60.0, 1e-300).unwrap_err();
        assert!(
            matches!(err, DaqError::Validation { ref parameter, .. } if parameter == "correction_interval")
        );
        assert!(compute_sample_angles(-60.0, 60.0, 0.1).is_err());
        let angles = compute_sample_angles(-60.0, 60.0, 0.125).unwrap();
        assert_eq!(angles.len(), 961);
    }

    #[test]
    fn test_split_batches_near_equal() {
        let items: Vec<usize> = (0..23).collect();
        let batches = split_batches(&items, 10);
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![8, 8, 7]);
        assert_eq!(batches.concat(), items);

        assert_eq!(split_batches(&items[..5], 10).len(), 1);
        assert!(split_batches::<usize>(&[], 10).is_empty());
    }
}
