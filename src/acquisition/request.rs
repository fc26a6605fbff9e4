//! Acquisition requests and their structural validation.
//!
//! Validation happens in two stages. [`AcquisitionRequest::validate`] checks
//! everything that can be checked without talking to the instrument (counts,
//! lengths, mutual exclusion, exposure sign, tilt speeds). The coordinator then
//! checks the camera-dependent parameters by querying the device, still before
//! any instrument state is mutated.

use crate::error::{DaqError, DaqResult};
use crate::hardware::tilt_speed::fractional_speed_for;
use crate::hardware::{ReadoutArea, Sampling};
use crate::shift::ShiftVector;

/// Everything needed to run one acquisition series.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionRequest {
    /// Number of acquisitions, N >= 1
    pub count: usize,
    /// Camera name
    pub camera: String,
    /// Exposure (integration) time per acquisition, in seconds
    pub exposure_time: f64,
    /// Camera resolution
    pub sampling: Sampling,
    /// Sensor readout area
    pub readout_area: ReadoutArea,
    /// Let a worker unblank only while the camera records
    pub blanker_optimization: bool,
    /// N+1 angles; tilt continuously from `tilt_bounds[i]` to `tilt_bounds[i+1]` during acquisition i
    pub tilt_bounds: Option<Vec<f64>>,
    /// N angles; tilt to `stationary_angles[i]` and stop before acquisition i
    pub stationary_angles: Option<Vec<f64>>,
    /// N image shifts, applied before the corresponding acquisition
    pub shifts: Option<Vec<ShiftVector>>,
    /// Close the column valve when making the instrument safe after a cancellation
    pub close_valve_on_abort: bool,
}

impl AcquisitionRequest {
    /// Start building a request for `count` acquisitions on `camera`.
    pub fn builder(camera: impl Into<String>, count: usize) -> AcquisitionRequestBuilder {
        AcquisitionRequestBuilder::new(camera, count)
    }

    /// True when a tilting worker is needed.
    pub fn is_tilting(&self) -> bool {
        self.tilt_bounds.is_some()
    }

    /// Number of barrier parties: the coordinator plus each active worker.
    pub fn party_count(&self) -> usize {
        1 + usize::from(self.blanker_optimization) + usize::from(self.is_tilting())
    }

    /// True when workers have to be spawned.
    pub fn needs_workers(&self) -> bool {
        self.party_count() > 1
    }

    /// Structural validation that needs no device access.
    pub fn validate(&self) -> DaqResult<()> {
        let n = self.count;
        if n == 0 {
            return Err(DaqError::validation(
                "count",
                "at least one acquisition is required",
            ));
        }

        if !(self.exposure_time > 0.0 && self.exposure_time.is_finite()) {
            return Err(DaqError::validation(
                "exposure_time",
                format!("must be a positive number of seconds, got {}", self.exposure_time),
            ));
        }

        if let Some(shifts) = &self.shifts {
            if shifts.len() != n {
                return Err(DaqError::validation(
                    "shifts",
                    format!("expected {n} entries, got {}", shifts.len()),
                ));
            }
        }

        if let Some(angles) = &self.stationary_angles {
            if angles.len() != n {
                return Err(DaqError::validation(
                    "stationary_angles",
                    format!("expected {n} entries, got {}", angles.len()),
                ));
            }
        }

        if let Some(bounds) = &self.tilt_bounds {
            if bounds.len() != n + 1 {
                return Err(DaqError::validation(
                    "tilt_bounds",
                    format!("expected {} entries, got {}", n + 1, bounds.len()),
                ));
            }
            if self.stationary_angles.is_some() {
                return Err(DaqError::validation(
                    "tilt_bounds",
                    "cannot tilt while acquiring and also stop at stationary angles",
                ));
            }
            self.tilt_speeds()?;
        }

        Ok(())
    }

    /// Fractional tilt speed for each step, or an empty list when not tilting.
    pub fn tilt_speeds(&self) -> DaqResult<Vec<f64>> {
        let Some(bounds) = &self.tilt_bounds else {
            return Ok(Vec::new());
        };
        bounds
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                fractional_speed_for(pair[1] - pair[0], self.exposure_time).map_err(|e| {
                    DaqError::validation(
                        "tilt_bounds",
                        format!("step {i} ({} -> {} deg): {e}", pair[0], pair[1]),
                    )
                })
            })
            .collect()
    }
}

/// Options for a single acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SingleAcquisitionOptions {
    /// Sensor readout area
    pub readout_area: ReadoutArea,
    /// Keep the beam blanked except while recording
    pub blanker_optimization: bool,
    /// Tilt to this angle (degrees) while recording
    pub tilt_destination: Option<f64>,
}

impl Default for SingleAcquisitionOptions {
    fn default() -> Self {
        Self {
            readout_area: ReadoutArea::Full,
            blanker_optimization: true,
            tilt_destination: None,
        }
    }
}

/// Builder for [`AcquisitionRequest`].
///
/// Empty sequences are treated as absent.
#[derive(Debug, Clone)]
pub struct AcquisitionRequestBuilder {
    inner: AcquisitionRequest,
}

impl AcquisitionRequestBuilder {
    /// Defaults: 1 s exposure, 1k sampling, full readout, blanker optimization on.
    pub fn new(camera: impl Into<String>, count: usize) -> Self {
        Self {
            inner: AcquisitionRequest {
                count,
                camera: camera.into(),
                exposure_time: 1.0,
                sampling: Sampling::Quarter,
                readout_area: ReadoutArea::Full,
                blanker_optimization: true,
                tilt_bounds: None,
                stationary_angles: None,
                shifts: None,
                close_valve_on_abort: false,
            },
        }
    }

    /// Exposure time in seconds.
    pub fn exposure_time(mut self, seconds: f64) -> Self {
        self.inner.exposure_time = seconds;
        self
    }

    /// Camera resolution.
    pub fn sampling(mut self, sampling: Sampling) -> Self {
        self.inner.sampling = sampling;
        self
    }

    /// Sensor readout area.
    pub fn readout_area(mut self, area: ReadoutArea) -> Self {
        self.inner.readout_area = area;
        self
    }

    /// Enable or disable the blanking worker.
    pub fn blanker_optimization(mut self, enabled: bool) -> Self {
        self.inner.blanker_optimization = enabled;
        self
    }

    /// Tilt while acquiring.
    pub fn tilt_bounds(mut self, bounds: Vec<f64>) -> Self {
        self.inner.tilt_bounds = (!bounds.is_empty()).then_some(bounds);
        self
    }

    /// Stop at these angles before each acquisition.
    pub fn stationary_angles(mut self, angles: Vec<f64>) -> Self {
        self.inner.stationary_angles = (!angles.is_empty()).then_some(angles);
        self
    }

    /// Image shifts per acquisition.
    pub fn shifts(mut self, shifts: Vec<ShiftVector>) -> Self {
        self.inner.shifts = (!shifts.is_empty()).then_some(shifts);
        self
    }

    /// Close the column valve if the series is cancelled.
    pub fn close_valve_on_abort(mut self, close: bool) -> Self {
        self.inner.close_valve_on_abort = close;
        self
    }

    /// Finish building. Does not validate.
    pub fn build(self) -> AcquisitionRequest {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(count: usize) -> AcquisitionRequestBuilder {
        AcquisitionRequest::builder("BM-Ceta", count).exposure_time(1.0)
    }

    #[test]
    fn test_valid_plain_request() {
        let request = base(3).blanker_optimization(false).build();
        assert!(request.validate().is_ok());
        assert_eq!(request.party_count(), 1);
        assert!(!request.needs_workers());
    }

    #[test]
    fn test_zero_count_rejected() {
        let err = base(0).build().validate().unwrap_err();
        assert!(matches!(err, DaqError::Validation { ref parameter, .. } if parameter == "count"));
    }

    #[test]
    fn test_shift_length_mismatch_rejected() {
        let request = base(5).shifts(vec![ShiftVector::ZERO; 4]).build();
        let err = request.validate().unwrap_err();
        assert!(matches!(err, DaqError::Validation { ref parameter, .. } if parameter == "shifts"));
    }

    #[test]
    fn test_tilt_bounds_length() {
        let request = base(2).tilt_bounds(vec![0.0, 1.0]).build();
        let err = request.validate().unwrap_err();
        assert!(matches!(err, DaqError::Validation { ref parameter, .. } if parameter == "tilt_bounds"));

        let request = base(2).tilt_bounds(vec![0.0, 1.0, 2.0]).build();
        assert!(request.validate().is_ok());
        assert_eq!(request.party_count(), 3);
    }

    #[test]
    fn test_tilt_bounds_and_stationary_angles_exclusive() {
        let request = base(2)
            .tilt_bounds(vec![0.0, 1.0, 2.0])
            .stationary_angles(vec![0.0, 1.0])
            .build();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_unreachable_tilt_speed_rejected() {
        // 40 degrees in one second is faster than the stage can go
        let request = base(1).tilt_bounds(vec![0.0, 40.0]).build();
        let err = request.validate().unwrap_err();
        assert!(err.to_string().contains("tilt_bounds"));
    }

    #[test]
    fn test_speed_just_under_nominal_maximum_rejected() {
        // 14.95 deg/s is below 15 deg/s but beyond a fractional speed of 1
        let request = base(1).tilt_bounds(vec![0.0, 14.95]).build();
        let err = request.validate().unwrap_err();
        assert!(matches!(err, DaqError::Validation { ref parameter, .. } if parameter == "tilt_bounds"));

        let request = base(1).tilt_bounds(vec![0.0, 14.8]).build();
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_empty_sequences_are_absent() {
        let request = base(2)
            .tilt_bounds(Vec::new())
            .shifts(Vec::new())
            .blanker_optimization(false)
            .build();
        assert!(request.tilt_bounds.is_none());
        assert!(request.shifts.is_none());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_non_positive_exposure_rejected() {
        assert!(base(1).exposure_time(0.0).build().validate().is_err());
        assert!(base(1).exposure_time(-1.0).build().validate().is_err());
    }
}
