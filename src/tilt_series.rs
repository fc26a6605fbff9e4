//! Continuous-rotation tilt series (MicroED-style data collection).
//!
//! A plan sweeps the stage from `start` to `stop` in intervals of `step`
//! degrees, acquiring one image per interval while tilting through it with the
//! beam unblanked only during recording. Optionally, image-shift corrections are
//! calibrated first at sparse angles and interpolated to each interval's
//! midpoint.
//!
//! Whatever goes wrong, the session leaves the instrument safe: beam blanked,
//! column valve closed (if requested), stage and image shift back at zero.

use crate::acquisition::device_state::DeviceStateSnapshot;
use crate::acquisition::{AcquisitionCoordinator, AcquisitionRequest, AcquisitionSeries};
use crate::config::Settings;
use crate::error::{DaqError, DaqResult};
use crate::hardware::{DeviceConnector, ImageShift, Sampling, TiltStage};
use crate::shift::correction::{full_shifts_or_zero, ShiftCorrection};
use crate::shift::sampler::{compute_sample_angles, SamplingStrategy};
use crate::shift::ShiftVector;
use crate::sync::CancelToken;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Tolerance when checking that the tilt range is a whole number of steps.
const STEP_TOLERANCE: f64 = 1e-6;

/// Angles and camera parameters of one tilt series.
#[derive(Debug, Clone, PartialEq)]
pub struct TiltSeriesPlan {
    /// Camera name
    pub camera: String,
    /// Tilt bounds, `start..=stop` by `step` (N+1 values)
    pub alpha_arr: Vec<f64>,
    /// Acquisition angles: midpoints of consecutive bounds (N values)
    pub alphas: Vec<f64>,
    /// Exposure per interval, in seconds
    pub integration_time: f64,
    /// Camera resolution
    pub sampling: Sampling,
}

impl TiltSeriesPlan {
    /// Plan a sweep from `start` to `stop` (degrees) in steps of `step` degrees.
    ///
    /// The direction follows the sign of `stop - start`; `step` itself must be
    /// positive and divide the range.
    pub fn new(
        camera: impl Into<String>,
        start: f64,
        stop: f64,
        step: f64,
        integration_time: f64,
        sampling: Sampling,
    ) -> DaqResult<Self> {
        if !(step > 0.0 && step.is_finite()) {
            return Err(DaqError::validation(
                "step",
                format!("must be a positive number of degrees, got {step}"),
            ));
        }
        if !(start.is_finite() && stop.is_finite()) || start == stop {
            return Err(DaqError::validation(
                "tilt_range",
                format!("[{start}, {stop}] is not a usable tilt range"),
            ));
        }
        if !(integration_time > 0.0 && integration_time.is_finite()) {
            return Err(DaqError::validation(
                "integration_time",
                format!("must be a positive number of seconds, got {integration_time}"),
            ));
        }

        let intervals = (stop - start).abs() / step;
        if (intervals - intervals.round()).abs() > STEP_TOLERANCE {
            return Err(DaqError::validation(
                "step",
                format!("a {step} deg step does not evenly divide [{start}, {stop}]"),
            ));
        }
        let intervals = intervals.round() as usize;

        let alpha_arr: Vec<f64> = (0..=intervals)
            .map(|i| start + (stop - start) * i as f64 / intervals as f64)
            .collect();
        let alphas = alpha_arr.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();

        Ok(Self {
            camera: camera.into(),
            alpha_arr,
            alphas,
            integration_time,
            sampling,
        })
    }

    /// First bound.
    pub fn start(&self) -> f64 {
        self.alpha_arr[0]
    }

    /// Last bound.
    pub fn stop(&self) -> f64 {
        self.alpha_arr[self.alpha_arr.len() - 1]
    }

    /// Number of acquisitions.
    pub fn len(&self) -> usize {
        self.alphas.len()
    }

    /// Always false for a constructed plan.
    pub fn is_empty(&self) -> bool {
        self.alphas.is_empty()
    }

    /// Tilt speed in degrees per second.
    pub fn tilt_speed(&self) -> f64 {
        (self.alpha_arr[1] - self.alpha_arr[0]).abs() / self.integration_time
    }
}

/// Per-run choices.
#[derive(Debug, Clone, PartialEq)]
pub struct TiltSeriesOptions {
    /// Calibrate and apply image-shift corrections
    pub shift_correction: bool,
    /// Calibration spacing in degrees; `None` uses the configured default
    pub correction_interval: Option<f64>,
    /// Initial calibration strategy
    pub strategy: SamplingStrategy,
    /// Close the column valve when exiting after a failure
    pub close_valve_on_abort: bool,
}

impl Default for TiltSeriesOptions {
    fn default() -> Self {
        Self {
            shift_correction: true,
            correction_interval: None,
            strategy: SamplingStrategy::OneShot,
            close_valve_on_abort: true,
        }
    }
}

/// Result of a tilt series.
#[derive(Debug)]
pub struct TiltSeriesOutcome {
    /// Identifier of this run, also attached to its log lines
    pub run_id: Uuid,
    /// The acquired images, one per interval
    pub series: AcquisitionSeries,
    /// Image shifts applied, one per interval
    pub shifts: Vec<ShiftVector>,
    /// False if correction was disabled or fell back to zero shifts
    pub corrected: bool,
}

/// Runs tilt series against one instrument.
pub struct TiltSeriesSession<C: DeviceConnector> {
    coordinator: AcquisitionCoordinator<C>,
}

impl<C: DeviceConnector> TiltSeriesSession<C> {
    /// Create a session.
    pub fn new(connector: Arc<C>, settings: Arc<Settings>) -> Self {
        Self {
            coordinator: AcquisitionCoordinator::new(connector, settings),
        }
    }

    /// The underlying coordinator.
    pub fn coordinator(&self) -> &AcquisitionCoordinator<C> {
        &self.coordinator
    }

    /// Run the plan. On any error the instrument is made safe before returning.
    pub async fn run(
        &self,
        plan: &TiltSeriesPlan,
        options: &TiltSeriesOptions,
        cancel: &CancelToken,
    ) -> DaqResult<TiltSeriesOutcome> {
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            "Tilt series {:.2} -> {:.2} deg, {} images at {:.3} deg/s",
            plan.start(),
            plan.stop(),
            plan.len(),
            plan.tilt_speed()
        );

        let result = self.execute(run_id, plan, options, cancel).await;
        if let Err(e) = &result {
            error!(%run_id, "Tilt series failed: {}", e);
            self.exit_safely(options.close_valve_on_abort).await;
        }
        result
    }

    async fn execute(
        &self,
        run_id: Uuid,
        plan: &TiltSeriesPlan,
        options: &TiltSeriesOptions,
        cancel: &CancelToken,
    ) -> DaqResult<TiltSeriesOutcome> {
        let settings = self.coordinator.settings();

        let (shifts, corrected) = if options.shift_correction {
            let interval = options
                .correction_interval
                .unwrap_or(settings.shift_correction.correction_interval_deg);
            let samples = compute_sample_angles(plan.start(), plan.stop(), interval)?;
            let correction = ShiftCorrection::new(self.coordinator.clone(), plan.camera.clone())?;
            let obtained = correction
                .obtain(&samples, &plan.alphas, options.strategy, cancel)
                .await?;
            let corrected = obtained.is_some();
            (full_shifts_or_zero(obtained, plan.len()), corrected)
        } else {
            (vec![ShiftVector::ZERO; plan.len()], false)
        };

        if cancel.is_cancelled() {
            return Err(DaqError::Cancelled);
        }

        {
            let connection = self.coordinator.connector().connect()?;
            connection
                .tilt_to(plan.start(), settings.timing.stationary_tilt_speed)
                .await?;
            connection.wait_settled().await?;
        }

        let request = AcquisitionRequest::builder(plan.camera.as_str(), plan.len())
            .exposure_time(plan.integration_time)
            .sampling(plan.sampling)
            .blanker_optimization(true)
            .tilt_bounds(plan.alpha_arr.clone())
            .shifts(shifts.clone())
            .close_valve_on_abort(options.close_valve_on_abort)
            .build();

        let series = self
            .coordinator
            .acquisition_series_until(&request, cancel.cancelled())
            .await?;

        info!(%run_id, corrected, "Tilt series complete");
        Ok(TiltSeriesOutcome {
            run_id,
            series,
            shifts,
            corrected,
        })
    }

    /// Blank, optionally close the valve, and zero the stage and image shift.
    /// Failures are logged, not returned.
    async fn exit_safely(&self, close_valve: bool) {
        let connection = match self.coordinator.connector().connect() {
            Ok(connection) => connection,
            Err(e) => {
                error!("Could not connect to make the instrument safe: {}", e);
                return;
            }
        };

        if let Err(e) = DeviceStateSnapshot::make_safe(&connection, close_valve).await {
            error!("Failed to make the instrument safe: {}", e);
        }
        let speed = self.coordinator.settings().timing.stationary_tilt_speed;
        if let Err(e) = connection.tilt_to(0.0, speed).await {
            error!("Failed to zero the alpha tilt: {}", e);
        }
        if let Err(e) = connection.set_image_shift(ShiftVector::ZERO).await {
            error!("Failed to zero the image shift: {}", e);
        }
        info!("Instrument left in a safe state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_bounds_and_midpoints() {
        let plan = TiltSeriesPlan::new("BM-Ceta", -2.0, 2.0, 1.0, 1.0, Sampling::Quarter).unwrap();
        assert_eq!(plan.alpha_arr, vec![-2.0, -1.0, 0.0, 1.0, 2.0]);
        assert_eq!(plan.alphas, vec![-1.5, -0.5, 0.5, 1.5]);
        assert_eq!(plan.len(), 4);
        assert!((plan.tilt_speed() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_plan_descending() {
        let plan = TiltSeriesPlan::new("BM-Ceta", 10.0, 0.0, 2.5, 0.5, Sampling::Half).unwrap();
        assert_eq!(plan.alpha_arr, vec![10.0, 7.5, 5.0, 2.5, 0.0]);
        assert_eq!(plan.start(), 10.0);
        assert_eq!(plan.stop(), 0.0);
    }

    #[test]
    fn test_plan_rejects_uneven_step() {
        let err = TiltSeriesPlan::new("BM-Ceta", 0.0, 10.0, 3.0, 1.0, Sampling::Quarter)
            .unwrap_err();
        assert!(matches!(err, DaqError::Validation { ref parameter, .. } if parameter == "step"));
    }

    #[test]
    fn test_plan_rejects_bad_inputs() {
        assert!(TiltSeriesPlan::new("BM-Ceta", 0.0, 10.0, 0.0, 1.0, Sampling::Quarter).is_err());
        assert!(TiltSeriesPlan::new("BM-Ceta", 5.0, 5.0, 1.0, 1.0, Sampling::Quarter).is_err());
        assert!(TiltSeriesPlan::new("BM-Ceta", 0.0, 10.0, 1.0, 0.0, Sampling::Quarter).is_err());
    }
}
