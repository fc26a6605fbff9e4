//! Core library for tem_daq.
//!
//! Coordinates dose-minimizing, tilt-synchronized acquisitions on a transmission
//! electron microscope. A series of images is taken while a blanking worker keeps
//! the beam off outside each recording window and a tilting worker rotates the
//! stage through one interval per image, all three stepping through shared
//! per-image barriers. Before a continuous tilt series, image-shift corrections
//! can be calibrated at sparse angles by phase correlation and interpolated to
//! every acquisition angle.
//!
//! Instruments are reached through the capability traits in [`hardware`]; a
//! simulated microscope in [`hardware::mock`] backs the tests and the binary.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod hardware;
pub mod metadata;
pub mod shift;
pub mod sync;
pub mod tilt_series;
pub mod workers;
