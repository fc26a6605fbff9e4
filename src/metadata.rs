//! Per-acquisition metadata.
//!
//! Every image coming off the camera carries a key-value map describing how it was
//! taken. The core only relies on a handful of keys (pixel size above all, since it
//! converts registration offsets into physical image shifts), but the map is kept
//! open-ended so file writers outside this crate can round-trip whatever the device
//! reports.
//!
//! ## Well-known keys
//!
//! - **`PixelSize`**: `[x, y]` in metres.
//! - **`ExposureTime`**: seconds.
//! - **`Camera`**: camera name.
//! - **`Binning`**: `[width, height]` binning factors.
//! - **`AlphaTilt`**: stage alpha at the end of the acquire, in degrees.
//! - **`AcquisitionTime`**: RFC 3339 timestamp.
//!
//! ## `MetadataBuilder`
//!
//! A `MetadataBuilder` is provided to assemble metadata step by step, which is how the
//! simulated camera tags its frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Pixel size key, `[x, y]` in metres.
pub const PIXEL_SIZE: &str = "PixelSize";
/// Exposure time key, seconds.
pub const EXPOSURE_TIME: &str = "ExposureTime";
/// Camera name key.
pub const CAMERA: &str = "Camera";
/// Binning key, `[width, height]`.
pub const BINNING: &str = "Binning";
/// Alpha tilt key, degrees.
pub const ALPHA_TILT: &str = "AlphaTilt";
/// Acquisition timestamp key.
pub const ACQUISITION_TIME: &str = "AcquisitionTime";

/// Key-value metadata of a single acquisition.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AcquisitionMetadata {
    entries: BTreeMap<String, Value>,
}

impl AcquisitionMetadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Iterate over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Pixel size `(x, y)` in metres.
    pub fn pixel_size(&self) -> Option<(f64, f64)> {
        let values = self.entries.get(PIXEL_SIZE)?.as_array()?;
        match values.as_slice() {
            [x, y] => Some((x.as_f64()?, y.as_f64()?)),
            _ => None,
        }
    }

    /// Exposure time in seconds.
    pub fn exposure_time(&self) -> Option<f64> {
        self.entries.get(EXPOSURE_TIME)?.as_f64()
    }

    /// Alpha tilt in degrees.
    pub fn alpha_tilt(&self) -> Option<f64> {
        self.entries.get(ALPHA_TILT)?.as_f64()
    }

    /// Camera name.
    pub fn camera(&self) -> Option<&str> {
        self.entries.get(CAMERA)?.as_str()
    }

    /// Acquisition timestamp.
    pub fn acquisition_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.entries.get(ACQUISITION_TIME)?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// A builder for constructing `AcquisitionMetadata` instances.
#[derive(Default)]
pub struct MetadataBuilder {
    inner: AcquisitionMetadata,
}

impl MetadataBuilder {
    /// Start from empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pixel size in metres.
    pub fn pixel_size(mut self, x: f64, y: f64) -> Self {
        self.inner.insert(PIXEL_SIZE, serde_json::json!([x, y]));
        self
    }

    /// Exposure time in seconds.
    pub fn exposure_time(mut self, seconds: f64) -> Self {
        self.inner.insert(EXPOSURE_TIME, serde_json::json!(seconds));
        self
    }

    /// Camera name.
    pub fn camera(mut self, name: &str) -> Self {
        self.inner.insert(CAMERA, serde_json::json!(name));
        self
    }

    /// Binning factors.
    pub fn binning(mut self, width: u32, height: u32) -> Self {
        self.inner.insert(BINNING, serde_json::json!([width, height]));
        self
    }

    /// Alpha tilt in degrees.
    pub fn alpha_tilt(mut self, alpha: f64) -> Self {
        self.inner.insert(ALPHA_TILT, serde_json::json!(alpha));
        self
    }

    /// Acquisition timestamp.
    pub fn acquisition_time(mut self, at: DateTime<Utc>) -> Self {
        self.inner
            .insert(ACQUISITION_TIME, serde_json::json!(at.to_rfc3339()));
        self
    }

    /// Arbitrary extra entry.
    pub fn entry(mut self, key: &str, value: Value) -> Self {
        self.inner.insert(key, value);
        self
    }

    /// Finish building.
    pub fn build(self) -> AcquisitionMetadata {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        let now = Utc::now();
        let metadata = MetadataBuilder::new()
            .pixel_size(2.0e-7, 2.5e-7)
            .exposure_time(0.25)
            .camera("BM-Ceta")
            .alpha_tilt(-12.5)
            .acquisition_time(now)
            .build();

        assert_eq!(metadata.pixel_size(), Some((2.0e-7, 2.5e-7)));
        assert_eq!(metadata.exposure_time(), Some(0.25));
        assert_eq!(metadata.camera(), Some("BM-Ceta"));
        assert_eq!(metadata.alpha_tilt(), Some(-12.5));
        assert_eq!(
            metadata.acquisition_time().map(|t| t.timestamp_micros()),
            Some(now.timestamp_micros())
        );
    }

    #[test]
    fn test_malformed_pixel_size_is_none() {
        let metadata = MetadataBuilder::new()
            .entry(PIXEL_SIZE, serde_json::json!([1.0]))
            .build();
        assert_eq!(metadata.pixel_size(), None);
    }
}
