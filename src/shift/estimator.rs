//! Registers a calibration stack against its first image and converts the
//! pixel offsets into compensating image shifts.
//!
//! Registration yields content displacement `(row, col)`. The image shift that
//! moves the content back is `x = -col * px`, `y = +row * py` (rows grow
//! downwards, the y axis grows upwards), with pixel sizes taken from the
//! reference image in metres and reported in micrometres.

use crate::acquisition::{AcquisitionSeries, Image};
use crate::config::ShiftCorrectionConfig;
use crate::error::{DaqError, DaqResult};
use crate::shift::phase_correlation::{PhaseCorrelator, PixelOffset};
use crate::shift::{CalibrationSample, ShiftVector};
use tracing::debug;

/// Phase-correlation shift estimator.
#[derive(Debug, Clone, Copy)]
pub struct ShiftEstimator {
    hann_window: bool,
}

impl Default for ShiftEstimator {
    fn default() -> Self {
        Self { hann_window: true }
    }
}

impl ShiftEstimator {
    /// Estimator with or without Hann apodization.
    pub fn new(hann_window: bool) -> Self {
        Self { hann_window }
    }

    /// Estimator configured from settings.
    pub fn from_config(config: &ShiftCorrectionConfig) -> Self {
        Self::new(config.hann_window)
    }

    /// Pixel offset of every image after the first, relative to the first.
    pub fn pixel_offsets(&self, stack: &[&Image]) -> DaqResult<Vec<PixelOffset>> {
        let (reference, rest) = stack
            .split_first()
            .ok_or_else(|| DaqError::Registration("empty image stack".to_string()))?;

        let (height, width) = reference.shape();
        if let Some(position) = rest.iter().position(|image| image.shape() != (height, width)) {
            let odd = rest[position];
            return Err(DaqError::validation(
                "image_stack",
                format!(
                    "image {} is {}x{}, reference is {}x{}",
                    position + 1,
                    odd.width(),
                    odd.height(),
                    width,
                    height
                ),
            ));
        }

        let correlator = PhaseCorrelator::new(height, width, self.hann_window)?;
        let reference = correlator.spectrum(reference)?;
        rest.iter()
            .map(|image| correlator.offset_from_spectrum(&reference, image))
            .collect()
    }

    /// Compensating image shift (micrometres) for every image after the first.
    ///
    /// `pixel_size` is `(x, y)` in metres.
    pub fn estimate(
        &self,
        stack: &[&Image],
        pixel_size: (f64, f64),
    ) -> DaqResult<Vec<ShiftVector>> {
        let (px_um, py_um) = (pixel_size.0 * 1e6, pixel_size.1 * 1e6);
        let shifts: Vec<ShiftVector> = self
            .pixel_offsets(stack)?
            .into_iter()
            .map(|offset| ShiftVector::new(-offset.col * px_um, offset.row * py_um))
            .collect();
        debug!("Estimated {} shifts: {:?}", shifts.len(), shifts);
        Ok(shifts)
    }

    /// [`estimate`](Self::estimate) on calibration samples, using the first
    /// sample as reference and its pixel size for the whole stack.
    pub fn estimate_samples(&self, samples: &[CalibrationSample]) -> DaqResult<Vec<ShiftVector>> {
        let reference = samples
            .first()
            .ok_or_else(|| DaqError::Registration("no calibration samples".to_string()))?;
        let stack: Vec<&Image> = samples.iter().map(|sample| &sample.image).collect();
        debug!(
            "Registering {} samples against the image at {:.2} deg",
            samples.len() - 1,
            reference.alpha
        );
        self.estimate(&stack, reference.pixel_size)
    }

    /// [`estimate`](Self::estimate) on an acquired series, using the first
    /// acquisition's pixel size.
    pub fn estimate_series(&self, series: &AcquisitionSeries) -> DaqResult<Vec<ShiftVector>> {
        let reference = series
            .get(0)
            .ok_or_else(|| DaqError::Registration("empty calibration series".to_string()))?;
        let pixel_size = reference.metadata.pixel_size().ok_or_else(|| {
            DaqError::Registration("reference image has no pixel size".to_string())
        })?;
        self.estimate(&series.image_stack(), pixel_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(size: usize, row: f64, col: f64) -> Image {
        let mut pixels = vec![0.0f32; size * size];
        for r in 0..size {
            for c in 0..size {
                let d2 = (r as f64 - row).powi(2) + (c as f64 - col).powi(2);
                let secondary = (r as f64 - row - 7.0).powi(2) + (c as f64 - col + 4.0).powi(2);
                pixels[r * size + c] = ((-d2 / 8.0).exp() + 0.5 * (-secondary / 4.0).exp()) as f32;
            }
        }
        Image::new(size, size, pixels).unwrap()
    }

    #[test]
    fn test_offsets_relative_to_first_image() {
        let reference = blob(64, 32.0, 32.0);
        let down_right = blob(64, 34.0, 35.0);
        let estimator = ShiftEstimator::new(false);

        let offsets = estimator.pixel_offsets(&[&reference, &down_right]).unwrap();
        assert_eq!(offsets.len(), 1);
        assert!((offsets[0].row - 2.0).abs() < 0.2);
        assert!((offsets[0].col - 3.0).abs() < 0.2);
    }

    #[test]
    fn test_physical_conversion_signs() {
        let reference = blob(64, 32.0, 32.0);
        let moved = blob(64, 34.0, 35.0);
        let estimator = ShiftEstimator::new(false);

        // 0.1 um pixels
        let shifts = estimator.estimate(&[&reference, &moved], (1e-7, 1e-7)).unwrap();
        // Content moved right and down: shift left and up to compensate
        assert!((shifts[0].x + 0.3).abs() < 0.02, "x {}", shifts[0].x);
        assert!((shifts[0].y - 0.2).abs() < 0.02, "y {}", shifts[0].y);
    }

    #[test]
    fn test_mismatched_stack_rejected() {
        let a = blob(64, 32.0, 32.0);
        let b = blob(32, 16.0, 16.0);
        let err = ShiftEstimator::default().pixel_offsets(&[&a, &b]).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_samples_use_reference_pixel_size() {
        let sample = |alpha: f64, image: Image, pixel: f64| CalibrationSample {
            alpha,
            image,
            pixel_size: (pixel, pixel),
        };
        let samples = [
            sample(0.0, blob(64, 32.0, 32.0), 1e-7),
            sample(2.0, blob(64, 34.0, 35.0), 5e-7),
        ];

        let shifts = ShiftEstimator::new(false).estimate_samples(&samples).unwrap();
        assert_eq!(shifts.len(), 1);
        assert!((shifts[0].x + 0.3).abs() < 0.02, "x {}", shifts[0].x);
        assert!(ShiftEstimator::default().estimate_samples(&[]).is_err());
    }

    #[test]
    fn test_empty_stack_rejected() {
        assert!(matches!(
            ShiftEstimator::default().pixel_offsets(&[]),
            Err(DaqError::Registration(_))
        ));
    }
}
