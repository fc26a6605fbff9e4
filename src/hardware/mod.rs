//! Device control surface.
//!
//! The microscope is exposed as a set of capability traits (beam blanker, column
//! valve, viewing screen, image shift, tilt stage, camera) combined into
//! [`Microscope`]. Every call is a blocking, RPC-like round trip to the instrument:
//! failures propagate immediately and nothing here retries.
//!
//! ## Thread affinity
//!
//! A control connection may only be driven from the thread that created it. The
//! traits therefore use `#[async_trait(?Send)]` and connections are not required to
//! be `Send`. Anything that runs on another thread (the blanking and tilting
//! workers) opens its own connection through a [`DeviceConnector`], which *is*
//! `Send + Sync` and can be shared freely.

pub mod mock;
pub mod tilt_speed;

use crate::acquisition::Acquisition;
use crate::error::{DaqError, DaqResult};
use crate::shift::ShiftVector;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Camera resolution mode.
///
/// Each tag selects an entry of the camera's supported-binning list by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sampling {
    /// 4k images (4096 x 4096)
    Full,
    /// 2k images (2048 x 2048)
    Half,
    /// 1k images (1024 x 1024)
    Quarter,
    /// 0.5k images (512 x 512)
    Eighth,
}

impl Sampling {
    /// Index into the camera's supported-binning list.
    pub fn binning_index(self) -> usize {
        match self {
            Sampling::Full => 0,
            Sampling::Half => 1,
            Sampling::Quarter => 2,
            Sampling::Eighth => 3,
        }
    }

    /// The conventional tag ("4k", "2k", "1k", "0.5k").
    pub fn as_str(self) -> &'static str {
        match self {
            Sampling::Full => "4k",
            Sampling::Half => "2k",
            Sampling::Quarter => "1k",
            Sampling::Eighth => "0.5k",
        }
    }
}

impl fmt::Display for Sampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sampling {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "4k" | "full" => Ok(Sampling::Full),
            "2k" | "half" => Ok(Sampling::Half),
            "1k" | "quarter" => Ok(Sampling::Quarter),
            "0.5k" | "eighth" => Ok(Sampling::Eighth),
            other => Err(DaqError::validation(
                "sampling",
                format!("unknown sampling '{other}', expected one of 4k, 2k, 1k, 0.5k"),
            )),
        }
    }
}

/// Area read from the sensor, centred on the sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadoutArea {
    /// Whole sensor
    #[default]
    Full,
    /// Central half
    Half,
    /// Central quarter
    Quarter,
}

impl ReadoutArea {
    /// Device readout code.
    pub fn code(self) -> u8 {
        match self {
            ReadoutArea::Full => 0,
            ReadoutArea::Half => 1,
            ReadoutArea::Quarter => 2,
        }
    }

    /// Fraction of each sensor dimension that is read out.
    pub fn fraction(self) -> f64 {
        match self {
            ReadoutArea::Full => 1.0,
            ReadoutArea::Half => 0.5,
            ReadoutArea::Quarter => 0.25,
        }
    }
}

impl TryFrom<u8> for ReadoutArea {
    type Error = DaqError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ReadoutArea::Full),
            1 => Ok(ReadoutArea::Half),
            2 => Ok(ReadoutArea::Quarter),
            other => Err(DaqError::validation(
                "readout_area",
                format!("unknown readout area code {other}, expected 0, 1 or 2"),
            )),
        }
    }
}

/// A binning mode as reported by the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binning {
    /// Horizontal binning factor
    pub width: u32,
    /// Vertical binning factor
    pub height: u32,
}

impl Binning {
    /// Square binning.
    pub const fn square(factor: u32) -> Self {
        Self {
            width: factor,
            height: factor,
        }
    }
}

/// Everything the camera needs before each acquire.
///
/// The device resets these as a side effect of acquiring, so they are re-applied
/// on every iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Camera name
    pub camera: String,
    /// Binning code resolved from the sampling tag
    pub binning: Binning,
    /// Readout area
    pub readout_area: ReadoutArea,
    /// Exposure time in seconds
    pub exposure_time: f64,
}

/// Column valve state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValvePosition {
    /// Valve open, beam can reach the specimen
    Open,
    /// Valve closed
    Closed,
}

/// Fluorescent viewing screen state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScreenPosition {
    /// Screen inserted, blocks the camera
    Inserted,
    /// Screen retracted
    Retracted,
}

/// Stage state returned by a completed move.
///
/// There is no cached "current position"; callers either keep the snapshot
/// returned by the move or re-query with [`TiltStage::stage_alpha`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    /// Alpha tilt in degrees
    pub alpha: f64,
    /// Incremented by every completed move
    pub version: u64,
}

/// Beam blanker control.
#[async_trait(?Send)]
pub trait BeamBlanker {
    /// True when the beam is blanked.
    async fn beam_is_blank(&self) -> DaqResult<bool>;
    /// Blank the beam.
    async fn blank_beam(&self) -> DaqResult<()>;
    /// Unblank the beam.
    async fn unblank_beam(&self) -> DaqResult<()>;
}

/// Column valve control.
#[async_trait(?Send)]
pub trait ColumnValve {
    /// Current valve position.
    async fn column_valve_position(&self) -> DaqResult<ValvePosition>;
    /// Open the column valve.
    async fn open_column_valve(&self) -> DaqResult<()>;
    /// Close the column valve.
    async fn close_column_valve(&self) -> DaqResult<()>;
}

/// Viewing screen control.
#[async_trait(?Send)]
pub trait ViewingScreen {
    /// Current screen position.
    async fn screen_position(&self) -> DaqResult<ScreenPosition>;
    /// Insert the screen.
    async fn insert_screen(&self) -> DaqResult<()>;
    /// Retract the screen.
    async fn retract_screen(&self) -> DaqResult<()>;
}

/// Image shift (image-positioning actuator), in micrometres.
#[async_trait(?Send)]
pub trait ImageShift {
    /// Current image shift.
    async fn image_shift(&self) -> DaqResult<ShiftVector>;
    /// Apply an image shift.
    async fn set_image_shift(&self, shift: ShiftVector) -> DaqResult<()>;
}

/// Alpha tilt control.
#[async_trait(?Send)]
pub trait TiltStage {
    /// Query the current alpha tilt, in degrees.
    async fn stage_alpha(&self) -> DaqResult<f64>;

    /// Tilt to `alpha` at a fractional `speed` in (0, 1]. Blocks until the move
    /// completes.
    async fn tilt_to(&self, alpha: f64, speed: f64) -> DaqResult<StageSnapshot>;

    /// Wait for mechanical settling after a move.
    async fn wait_settled(&self) -> DaqResult<()>;
}

/// Camera selection, configuration and the synchronous acquire primitive.
#[async_trait(?Send)]
pub trait Camera {
    /// Names of the cameras that can be selected.
    async fn available_cameras(&self) -> DaqResult<Vec<String>>;

    /// Supported exposure range `(min, max)` in seconds.
    async fn exposure_time_range(&self, camera: &str) -> DaqResult<(f64, f64)>;

    /// Supported binnings, finest first.
    async fn supported_binnings(&self, camera: &str) -> DaqResult<Vec<Binning>>;

    /// Select the camera and apply binning, readout area and exposure.
    async fn configure(&self, settings: &CameraSettings) -> DaqResult<()>;

    /// Acquire one image. Spans roughly two exposure intervals (blind, then
    /// recording) and resets the camera configuration.
    async fn acquire(&self) -> DaqResult<Acquisition>;
}

/// Full control surface used by the coordinator.
pub trait Microscope:
    BeamBlanker + ColumnValve + ViewingScreen + ImageShift + TiltStage + Camera
{
}

impl<T> Microscope for T where
    T: BeamBlanker + ColumnValve + ViewingScreen + ImageShift + TiltStage + Camera
{
}

/// Opens thread-affine connections to the instrument.
///
/// The connector is shared between the coordinator and its workers; each context
/// calls [`DeviceConnector::connect`] once from its own thread and drives only the
/// connection it created.
pub trait DeviceConnector: Send + Sync + 'static {
    /// Connection type; need not be `Send`.
    type Connection: Microscope + 'static;

    /// Open a new connection bound to the calling thread.
    fn connect(&self) -> DaqResult<Self::Connection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_tags_round_trip() {
        for sampling in [
            Sampling::Full,
            Sampling::Half,
            Sampling::Quarter,
            Sampling::Eighth,
        ] {
            assert_eq!(sampling.as_str().parse::<Sampling>().unwrap(), sampling);
        }
        assert_eq!("quarter".parse::<Sampling>().unwrap(), Sampling::Quarter);
    }

    #[test]
    fn test_unknown_sampling_is_validation_error() {
        let err = "3k".parse::<Sampling>().unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("sampling"));
    }

    #[test]
    fn test_binning_indices() {
        assert_eq!(Sampling::Full.binning_index(), 0);
        assert_eq!(Sampling::Eighth.binning_index(), 3);
    }

    #[test]
    fn test_readout_area_codes() {
        assert_eq!(ReadoutArea::try_from(1).unwrap(), ReadoutArea::Half);
        assert!(ReadoutArea::try_from(3).is_err());
        assert_eq!(ReadoutArea::Quarter.code(), 2);
    }
}
