//! Configuration using Figment
//!
//! Settings are layered from (in order of precedence):
//! 1. Environment variables prefixed with `TEMDAQ_` (nested keys separated by `__`)
//! 2. TOML configuration file (default: `config/tem_daq.toml`, optional)
//! 3. Built-in defaults
//!
//! # Environment Variable Overrides
//!
//! ```text
//! TEMDAQ_APPLICATION__LOG_LEVEL=debug
//! TEMDAQ_TIMING__BLANKER_BLIND_MARGIN_S=0.5
//! TEMDAQ_SHIFT_CORRECTION__BATCH_SIZE=5
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tem_daq::config::Settings;
//!
//! let settings = Settings::load(None)?;
//! println!("Log level: {}", settings.application.log_level);
//! # Ok::<(), tem_daq::error::DaqError>(())
//! ```

use crate::error::{DaqError, DaqResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/tem_daq.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Worker timing margins
    #[serde(default)]
    pub timing: TimingConfig,
    /// Worker lifecycle settings
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Calibration and shift-correction settings
    #[serde(default)]
    pub shift_correction: ShiftCorrectionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "tem_daq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Sleep margins used by the workers to stay inside the camera's exposure window.
///
/// The camera's acquire command spends one exposure interval blind and one
/// recording, after a command latency. These margins place worker activity inside
/// the recording interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Extra wait after the barrier before unblanking, on top of the exposure time.
    pub blanker_blind_margin_s: f64,
    /// Extra time the beam stays unblanked, on top of the exposure time.
    pub blanker_recording_margin_s: f64,
    /// Extra wait after the barrier before tilting, on top of the exposure time.
    pub tilt_blind_margin_s: f64,
    /// Angular tolerance when checking whether the stage is already at the start angle.
    pub tilt_tolerance_deg: f64,
    /// Fractional speed for stationary-angle moves.
    pub stationary_tilt_speed: f64,
    /// Fractional speed used to reach the first tilt bound.
    pub start_tilt_speed: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            blanker_blind_margin_s: 0.425,
            blanker_recording_margin_s: 0.025,
            tilt_blind_margin_s: 0.03,
            tilt_tolerance_deg: 0.01,
            stationary_tilt_speed: 0.25,
            start_tilt_speed: 0.25,
        }
    }
}

/// Worker lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// How long to wait for each worker to finish once the coordinator is done.
    pub join_timeout_s: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            join_timeout_s: 10.0,
        }
    }
}

impl WorkerConfig {
    /// Join timeout as a `Duration`.
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.join_timeout_s)
    }
}

/// Calibration and shift-correction configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftCorrectionConfig {
    /// Maximum calibration images per batch when sampling batch-wise.
    pub batch_size: usize,
    /// Maximum local extrema per axis before registration is considered failed.
    pub max_extrema: usize,
    /// Local extrema within this many micrometres of either neighbour are noise.
    pub extremum_tolerance_um: f64,
    /// Exposure time for calibration images, in seconds.
    pub calibration_exposure_s: f64,
    /// Sampling tag for calibration images ("4k", "2k", "1k", "0.5k").
    pub calibration_sampling: String,
    /// Maximum spacing between calibration angles, in degrees.
    pub correction_interval_deg: f64,
    /// Apply a Hann window before phase correlation.
    pub hann_window: bool,
}

impl Default for ShiftCorrectionConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_extrema: 2,
            extremum_tolerance_um: 0.1,
            calibration_exposure_s: 0.25,
            calibration_sampling: "1k".to_string(),
            correction_interval_deg: 5.0,
            hann_window: true,
        }
    }
}

impl Settings {
    /// Load from the default path (if present) and the environment.
    pub fn load(path: Option<&Path>) -> DaqResult<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TEMDAQ_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would break the worker timing or calibration loop.
    pub fn validate(&self) -> DaqResult<()> {
        let timing = &self.timing;
        let margins = [
            ("timing.blanker_blind_margin_s", timing.blanker_blind_margin_s),
            (
                "timing.blanker_recording_margin_s",
                timing.blanker_recording_margin_s,
            ),
            ("timing.tilt_blind_margin_s", timing.tilt_blind_margin_s),
            ("timing.tilt_tolerance_deg", timing.tilt_tolerance_deg),
        ];
        for (name, value) in margins {
            if !value.is_finite() || value < 0.0 {
                return Err(DaqError::Configuration(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }

        for (name, speed) in [
            ("timing.stationary_tilt_speed", timing.stationary_tilt_speed),
            ("timing.start_tilt_speed", timing.start_tilt_speed),
        ] {
            if !(speed > 0.0 && speed <= 1.0) {
                return Err(DaqError::Configuration(format!(
                    "{name} must be a fractional speed in (0, 1], got {speed}"
                )));
            }
        }

        if !(self.workers.join_timeout_s > 0.0) {
            return Err(DaqError::Configuration(format!(
                "workers.join_timeout_s must be positive, got {}",
                self.workers.join_timeout_s
            )));
        }

        let shift = &self.shift_correction;
        if shift.batch_size == 0 {
            return Err(DaqError::Configuration(
                "shift_correction.batch_size must be at least 1".to_string(),
            ));
        }
        if !(shift.calibration_exposure_s > 0.0) {
            return Err(DaqError::Configuration(format!(
                "shift_correction.calibration_exposure_s must be positive, got {}",
                shift.calibration_exposure_s
            )));
        }
        if !(shift.extremum_tolerance_um >= 0.0 && shift.extremum_tolerance_um.is_finite()) {
            return Err(DaqError::Configuration(format!(
                "shift_correction.extremum_tolerance_um must be a non-negative number, got {}",
                shift.extremum_tolerance_um
            )));
        }
        if !(shift.correction_interval_deg > 0.0) {
            return Err(DaqError::Configuration(format!(
                "shift_correction.correction_interval_deg must be positive, got {}",
                shift.correction_interval_deg
            )));
        }
        shift
            .calibration_sampling
            .parse::<crate::hardware::Sampling>()
            .map_err(|e| DaqError::Configuration(e.to_string()))?;

        Ok(())
    }
}
