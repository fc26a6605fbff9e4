//! Closed-loop image-shift correction.
//!
//! Calibration images are taken at a sparse set of tilt angles, registered
//! against an angle-0 reference, checked for plausibility, and interpolated to
//! every angle of the real acquisition:
//!
//! ```text
//! ShiftSampler -> ShiftEstimator -> quality gate -> ShiftInterpolator
//! ```
//!
//! [`correction::ShiftCorrection`] wires the stages together, including the
//! batch-wise retry and the no-correction fallback.

pub mod correction;
pub mod estimator;
pub mod interpolate;
pub mod phase_correlation;
pub mod quality;
pub mod sampler;

pub use correction::ShiftCorrection;
pub use estimator::ShiftEstimator;
pub use interpolate::{OutOfRange, ShiftInterpolator};
pub use quality::{QualityGate, QualityReport};
pub use sampler::{compute_sample_angles, SamplingStrategy, ShiftSampler};

use crate::acquisition::{Acquisition, AcquisitionSeries, Image};
use crate::error::{DaqError, DaqResult};
use serde::{Deserialize, Serialize};
use std::ops::{Add, Neg, Sub};

/// Lateral image shift `(x, y)` in micrometres.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ShiftVector {
    /// Horizontal component
    pub x: f64,
    /// Vertical component
    pub y: f64,
}

impl ShiftVector {
    /// No shift.
    pub const ZERO: ShiftVector = ShiftVector { x: 0.0, y: 0.0 };

    /// New shift vector.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean length.
    pub fn norm(self) -> f64 {
        self.x.hypot(self.y)
    }

    /// True if both components are within `tolerance` of `other`.
    pub fn approx_eq(self, other: ShiftVector, tolerance: f64) -> bool {
        (self.x - other.x).abs() <= tolerance && (self.y - other.y).abs() <= tolerance
    }
}

impl Add for ShiftVector {
    type Output = ShiftVector;

    fn add(self, rhs: Self) -> Self::Output {
        ShiftVector::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for ShiftVector {
    type Output = ShiftVector;

    fn sub(self, rhs: Self) -> Self::Output {
        ShiftVector::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Neg for ShiftVector {
    type Output = ShiftVector;

    fn neg(self) -> Self::Output {
        ShiftVector::new(-self.x, -self.y)
    }
}

/// One calibration image and where it was taken.
#[derive(Debug, Clone)]
pub struct CalibrationSample {
    /// Tilt angle in degrees
    pub alpha: f64,
    /// Calibration image
    pub image: Image,
    /// Pixel size `(x, y)` in metres
    pub pixel_size: (f64, f64),
}

impl CalibrationSample {
    /// Take the image, recorded tilt and pixel size from an acquisition.
    pub fn from_acquisition(acquisition: Acquisition) -> DaqResult<Self> {
        let alpha = acquisition.metadata.alpha_tilt().ok_or_else(|| {
            DaqError::Registration("calibration image has no alpha tilt".to_string())
        })?;
        let pixel_size = acquisition.metadata.pixel_size().ok_or_else(|| {
            DaqError::Registration(format!("calibration image at {alpha:.2} deg has no pixel size"))
        })?;
        Ok(Self {
            alpha,
            image: acquisition.image,
            pixel_size,
        })
    }

    /// Convert a whole calibration series, keeping its order.
    pub fn from_series(series: AcquisitionSeries) -> DaqResult<Vec<Self>> {
        series
            .into_acquisitions()
            .into_iter()
            .map(Self::from_acquisition)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_arithmetic() {
        let a = ShiftVector::new(1.0, 2.0);
        let b = ShiftVector::new(0.5, -1.0);
        assert_eq!(a + b, ShiftVector::new(1.5, 1.0));
        assert_eq!(a - b, ShiftVector::new(0.5, 3.0));
        assert_eq!(-a, ShiftVector::new(-1.0, -2.0));
        assert!((ShiftVector::new(3.0, 4.0).norm() - 5.0).abs() < 1e-12);
        assert!(a.approx_eq(ShiftVector::new(1.0001, 1.9999), 1e-3));
    }

    #[test]
    fn test_sample_from_acquisition() {
        let metadata = crate::metadata::MetadataBuilder::new()
            .alpha_tilt(-4.0)
            .pixel_size(2.0e-7, 2.0e-7)
            .build();
        let sample =
            CalibrationSample::from_acquisition(Acquisition::new(Image::zeros(8, 8), metadata))
                .unwrap();
        assert_eq!(sample.alpha, -4.0);
        assert_eq!(sample.pixel_size, (2.0e-7, 2.0e-7));
        assert_eq!(sample.image.shape(), (8, 8));
    }

    #[test]
    fn test_sample_without_pixel_size_rejected() {
        let metadata = crate::metadata::MetadataBuilder::new().alpha_tilt(0.0).build();
        let err =
            CalibrationSample::from_acquisition(Acquisition::new(Image::zeros(8, 8), metadata))
                .unwrap_err();
        assert!(matches!(err, DaqError::Registration(_)));
    }
}
