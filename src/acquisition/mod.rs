//! Acquisitions, acquisition series, and the coordinator that produces them.
//!
//! - [`request`] describes and validates what to acquire.
//! - [`coordinator`] drives the camera and the blanking/tilting workers.
//! - [`device_state`] records and restores the shared instrument flags.

pub mod coordinator;
pub mod device_state;
pub mod request;

pub use coordinator::AcquisitionCoordinator;
pub use request::{AcquisitionRequest, AcquisitionRequestBuilder, SingleAcquisitionOptions};

use crate::metadata::AcquisitionMetadata;
use crate::workers::{BlankingStep, TiltStep};
use std::time::Instant;

/// A 2D image, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    width: usize,
    height: usize,
    pixels: Vec<f32>,
}

impl Image {
    /// Wrap a pixel buffer. Returns `None` if the buffer does not match the size.
    pub fn new(width: usize, height: usize, pixels: Vec<f32>) -> Option<Self> {
        (width * height == pixels.len()).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    /// All-zero image.
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0.0; width * height],
        }
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// `(height, width)`
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Pixel at `(row, col)`.
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        (row < self.height && col < self.width).then(|| self.pixels[row * self.width + col])
    }

    /// Raw pixel buffer.
    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    /// Mutable raw pixel buffer.
    pub fn pixels_mut(&mut self) -> &mut [f32] {
        &mut self.pixels
    }

    /// Mean intensity.
    pub fn mean(&self) -> f64 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        self.pixels.iter().map(|&v| v as f64).sum::<f64>() / self.pixels.len() as f64
    }
}

/// One image plus its metadata, as returned by the camera.
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    /// Pixel data
    pub image: Image,
    /// Metadata reported with the image
    pub metadata: AcquisitionMetadata,
}

impl Acquisition {
    /// Pair an image with its metadata.
    pub fn new(image: Image, metadata: AcquisitionMetadata) -> Self {
        Self { image, metadata }
    }
}

/// Coordinator-side timing of one acquire call.
#[derive(Debug, Clone, Copy)]
pub struct AcquireTiming {
    /// Step index
    pub index: usize,
    /// When the coordinator left the barrier (or started, without workers)
    pub released_at: Instant,
    /// When the blocking acquire returned
    pub returned_at: Instant,
}

/// Timing reports collected from every party of a series.
#[derive(Debug, Clone, Default)]
pub struct SeriesTiming {
    /// Coordinator acquire timings, one per step
    pub acquisitions: Vec<AcquireTiming>,
    /// Blanking worker report, if the worker ran
    pub blanking: Option<Vec<BlankingStep>>,
    /// Tilting worker report, if the worker ran
    pub tilting: Option<Vec<TiltStep>>,
}

/// Ordered result of an acquisition series. Append-only.
#[derive(Debug, Clone, Default)]
pub struct AcquisitionSeries {
    acquisitions: Vec<Acquisition>,
    timing: SeriesTiming,
}

impl AcquisitionSeries {
    /// Empty series.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_capacity(n: usize) -> Self {
        Self {
            acquisitions: Vec::with_capacity(n),
            timing: SeriesTiming::default(),
        }
    }

    /// Append an acquisition.
    pub fn push(&mut self, acquisition: Acquisition) {
        self.acquisitions.push(acquisition);
    }

    /// Number of acquisitions.
    pub fn len(&self) -> usize {
        self.acquisitions.len()
    }

    /// True if nothing was acquired.
    pub fn is_empty(&self) -> bool {
        self.acquisitions.is_empty()
    }

    /// Acquisition at `index`.
    pub fn get(&self, index: usize) -> Option<&Acquisition> {
        self.acquisitions.get(index)
    }

    /// Iterate in acquisition order.
    pub fn iter(&self) -> std::slice::Iter<'_, Acquisition> {
        self.acquisitions.iter()
    }

    /// Images in acquisition order.
    pub fn image_stack(&self) -> Vec<&Image> {
        self.acquisitions.iter().map(|a| &a.image).collect()
    }

    /// Timing reports from the coordinator and workers.
    pub fn timing(&self) -> &SeriesTiming {
        &self.timing
    }

    pub(crate) fn timing_mut(&mut self) -> &mut SeriesTiming {
        &mut self.timing
    }

    /// Take ownership of the acquisitions.
    pub fn into_acquisitions(self) -> Vec<Acquisition> {
        self.acquisitions
    }
}

impl<'a> IntoIterator for &'a AcquisitionSeries {
    type Item = &'a Acquisition;
    type IntoIter = std::slice::Iter<'a, Acquisition>;

    fn into_iter(self) -> Self::IntoIter {
        self.acquisitions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_rejects_wrong_buffer() {
        assert!(Image::new(4, 4, vec![0.0; 15]).is_none());
        let image = Image::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(image.shape(), (3, 2));
        assert_eq!(image.get(2, 1), Some(6.0));
        assert_eq!(image.get(3, 0), None);
        assert!((image.mean() - 3.5).abs() < 1e-12);
    }

    #[test]
    fn test_series_preserves_order() {
        let mut series = AcquisitionSeries::new();
        for i in 0..3 {
            let image = Image::new(1, 1, vec![i as f32]).unwrap();
            series.push(Acquisition::new(image, AcquisitionMetadata::new()));
        }
        let values: Vec<f32> = series.iter().map(|a| a.image.pixels()[0]).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
        assert_eq!(series.image_stack().len(), 3);
    }
}
