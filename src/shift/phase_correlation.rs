//! Phase correlation: translational offset between two images.
//!
//! Both images are mean-subtracted, optionally Hann-windowed, and transformed
//! with a 2D FFT (rows, then columns). The normalized cross-power spectrum
//! `F_img * conj(F_ref) / |F_img * conj(F_ref)|` is transformed back; its peak
//! sits at the displacement of the image content relative to the reference.
//! Peak indices past the midpoint wrap to negative offsets, and a parabola
//! through the neighbours refines each axis to sub-pixel precision.

use crate::acquisition::Image;
use crate::error::{DaqError, DaqResult};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;

/// Content displacement in pixels: positive `row` is down, positive `col` is right.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PixelOffset {
    /// Vertical displacement
    pub row: f64,
    /// Horizontal displacement
    pub col: f64,
}

/// FFT plans and window for one image size.
pub struct PhaseCorrelator {
    height: usize,
    width: usize,
    row_fft: Arc<dyn Fft<f64>>,
    row_ifft: Arc<dyn Fft<f64>>,
    col_fft: Arc<dyn Fft<f64>>,
    col_ifft: Arc<dyn Fft<f64>>,
    window: Option<(Vec<f64>, Vec<f64>)>,
}

impl std::fmt::Debug for PhaseCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseCorrelator")
            .field("height", &self.height)
            .field("width", &self.width)
            .field("windowed", &self.window.is_some())
            .finish()
    }
}

impl PhaseCorrelator {
    /// Plan transforms for `height x width` images.
    pub fn new(height: usize, width: usize, hann_window: bool) -> DaqResult<Self> {
        if height < 2 || width < 2 {
            return Err(DaqError::Registration(format!(
                "cannot register {width}x{height} images"
            )));
        }
        let mut planner = FftPlanner::new();
        let window = hann_window.then(|| (hann(height), hann(width)));
        Ok(Self {
            height,
            width,
            row_fft: planner.plan_fft_forward(width),
            row_ifft: planner.plan_fft_inverse(width),
            col_fft: planner.plan_fft_forward(height),
            col_ifft: planner.plan_fft_inverse(height),
            window,
        })
    }

    /// `(height, width)` this correlator was planned for.
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Forward spectrum of `image` after mean subtraction and windowing.
    pub fn spectrum(&self, image: &Image) -> DaqResult<Vec<Complex<f64>>> {
        if image.shape() != self.shape() {
            return Err(DaqError::Registration(format!(
                "image is {}x{}, expected {}x{}",
                image.width(),
                image.height(),
                self.width,
                self.height
            )));
        }

        let mean = image.mean();
        let mut data: Vec<Complex<f64>> = image
            .pixels()
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let weight = match &self.window {
                    Some((rows, cols)) => rows[i / self.width] * cols[i % self.width],
                    None => 1.0,
                };
                Complex::new((v as f64 - mean) * weight, 0.0)
            })
            .collect();

        self.fft2(&mut data, false);
        Ok(data)
    }

    /// Displacement of `image` relative to the reference whose spectrum is given.
    pub fn offset_from_spectrum(
        &self,
        reference: &[Complex<f64>],
        image: &Image,
    ) -> DaqResult<PixelOffset> {
        let spectrum = self.spectrum(image)?;
        if reference.len() != spectrum.len() {
            return Err(DaqError::Registration(
                "reference spectrum has the wrong size".to_string(),
            ));
        }

        let mut cross: Vec<Complex<f64>> = spectrum
            .iter()
            .zip(reference)
            .map(|(a, b)| {
                let product = a * b.conj();
                let magnitude = product.norm();
                if magnitude > f64::EPSILON {
                    product / magnitude
                } else {
                    Complex::new(0.0, 0.0)
                }
            })
            .collect();

        self.fft2(&mut cross, true);
        let surface: Vec<f64> = cross.iter().map(|c| c.re).collect();
        Ok(self.locate_peak(&surface))
    }

    /// Displacement of `image` relative to `reference`.
    pub fn offset(&self, reference: &Image, image: &Image) -> DaqResult<PixelOffset> {
        let reference = self.spectrum(reference)?;
        self.offset_from_spectrum(&reference, image)
    }

    fn fft2(&self, data: &mut [Complex<f64>], inverse: bool) {
        let (row_plan, col_plan) = if inverse {
            (&self.row_ifft, &self.col_ifft)
        } else {
            (&self.row_fft, &self.col_fft)
        };

        // Rows are contiguous; rustfft processes every chunk of plan length
        row_plan.process(data);

        let mut columns = transpose(data, self.height, self.width);
        col_plan.process(&mut columns);
        data.copy_from_slice(&transpose(&columns, self.width, self.height));
    }

    fn locate_peak(&self, surface: &[f64]) -> PixelOffset {
        let (peak, _) = surface
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |(best, best_v), (i, &v)| {
                if v > best_v {
                    (i, v)
                } else {
                    (best, best_v)
                }
            });
        let (row, col) = (peak / self.width, peak % self.width);

        let at = |r: usize, c: usize| surface[r * self.width + c];
        let up = at((row + self.height - 1) % self.height, col);
        let down = at((row + 1) % self.height, col);
        let left = at(row, (col + self.width - 1) % self.width);
        let right = at(row, (col + 1) % self.width);
        let centre = at(row, col);

        PixelOffset {
            row: wrap(row, self.height) + parabolic(up, centre, down),
            col: wrap(col, self.width) + parabolic(left, centre, right),
        }
    }
}

fn transpose(data: &[Complex<f64>], rows: usize, cols: usize) -> Vec<Complex<f64>> {
    let mut out = vec![Complex::new(0.0, 0.0); data.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}

fn hann(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / (n - 1) as f64).cos()))
        .collect()
}

fn wrap(index: usize, len: usize) -> f64 {
    if index > len / 2 {
        index as f64 - len as f64
    } else {
        index as f64
    }
}

/// Vertex offset of the parabola through three equally spaced samples.
fn parabolic(before: f64, centre: f64, after: f64) -> f64 {
    let curvature = before - 2.0 * centre + after;
    if curvature.abs() < f64::EPSILON {
        return 0.0;
    }
    (0.5 * (before - after) / curvature).clamp(-0.5, 0.5)
}
