//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failure that can occur while driving the microscope.
//!
//! ## Error Hierarchy
//!
//! `DaqError` is an enum that consolidates the failure classes of a tilt series:
//!
//! - **`Validation`**: A malformed request (length mismatches, out-of-range exposure,
//!   unknown sampling, unreachable tilt speed). Always detected before any hardware state
//!   is mutated and never retried. The `parameter` field names the offending input.
//! - **`Device`**: An underlying hardware call failed or returned something unexpected.
//!   Fatal for the in-flight series; propagated after best-effort teardown.
//! - **`RegistrationQuality`**: The estimated shifts failed the quality gate. The shift
//!   correction pipeline retries once with the batch-wise strategy, then degrades to
//!   "no correction" instead of failing the acquisition.
//! - **`Registration`**: The calibration stack could not be registered at all (empty
//!   stack, mismatched image sizes, missing pixel size).
//! - **`Cancelled`**: An external interrupt. Fatal; triggers the safe-state teardown.
//! - **`Worker`**: A blanking or tilting worker failed, panicked, or missed its join
//!   deadline.
//! - **`Config`** / **`Configuration`**: Loading or validating settings failed.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! simplifying error handling with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Every way an acquisition, calibration, or configuration step can fail.
#[derive(Error, Debug)]
pub enum DaqError {
    /// A request parameter is invalid.
    #[error("Invalid {parameter}: {reason}")]
    Validation {
        /// Name of the offending request field.
        parameter: String,
        /// Human readable description of the problem.
        reason: String,
    },

    /// A hardware call failed.
    #[error("Device error: {0}")]
    Device(String),

    /// Shift estimates look non-monotonic and are probably wrong.
    #[error(
        "Shift registration failed the quality gate ({x_extrema} x-extrema, {y_extrema} y-extrema)"
    )]
    RegistrationQuality {
        /// Local extrema found in the x-shift sequence.
        x_extrema: usize,
        /// Local extrema found in the y-shift sequence.
        y_extrema: usize,
    },

    /// The calibration stack could not be registered.
    #[error("Image registration error: {0}")]
    Registration(String),

    /// The series was interrupted from outside.
    #[error("Acquisition cancelled")]
    Cancelled,

    /// A worker thread failed.
    #[error("{worker} worker failed: {reason}")]
    Worker {
        /// Worker name ("blanking" or "tilting").
        worker: String,
        /// What went wrong.
        reason: String,
    },

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O failure (thread spawning, runtime construction).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// Shorthand for a [`DaqError::Validation`] error.
    pub fn validation(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`DaqError::Worker`] error.
    pub fn worker(worker: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Worker {
            worker: worker.into(),
            reason: reason.into(),
        }
    }

    /// True for the error classes that are detected before any hardware mutation.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Device("stage not responding".to_string());
        assert_eq!(err.to_string(), "Device error: stage not responding");
    }

    #[test]
    fn test_validation_names_parameter() {
        let err = DaqError::validation("shifts", "expected 5 entries, got 4");
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "Invalid shifts: expected 5 entries, got 4");
    }

    #[test]
    fn test_quality_error_reports_counts() {
        let err = DaqError::RegistrationQuality {
            x_extrema: 4,
            y_extrema: 1,
        };
        assert!(err.to_string().contains("4 x-extrema"));
        assert!(!err.is_validation());
    }
}
