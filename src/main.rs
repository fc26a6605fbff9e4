//! Command-line driver for the simulated instrument.
//!
//! `simulate` runs a complete tilt series (calibration, correction, acquisition)
//! against the mock microscope; `tilt-speed` prints the stage's fractional speed
//! for a requested rotation rate.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tem_daq::config::Settings;
use tem_daq::hardware::mock::MockMicroscope;
use tem_daq::hardware::tilt_speed::fractional_tilt_speed;
use tem_daq::hardware::Sampling;
use tem_daq::shift::SamplingStrategy;
use tem_daq::sync::CancelSource;
use tem_daq::tilt_series::{TiltSeriesOptions, TiltSeriesPlan, TiltSeriesSession};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/tem_daq.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a tilt series on the simulated microscope
    Simulate {
        /// First tilt bound in degrees
        #[arg(long, default_value = "-10", allow_hyphen_values = true)]
        start: f64,

        /// Last tilt bound in degrees
        #[arg(long, default_value = "10", allow_hyphen_values = true)]
        stop: f64,

        /// Degrees per image
        #[arg(long, default_value = "1")]
        step: f64,

        /// Exposure per image in seconds
        #[arg(short, long, default_value = "0.5")]
        exposure: f64,

        /// Camera sampling (4k, 2k, 1k, 0.5k)
        #[arg(long, default_value = "1k")]
        sampling: Sampling,

        /// Camera name
        #[arg(long, default_value = "BM-Ceta")]
        camera: String,

        /// Degrees between calibration images
        #[arg(long)]
        correction_interval: Option<f64>,

        /// Start calibration batch-wise instead of one-shot
        #[arg(long)]
        batch_wise: bool,

        /// Skip image-shift calibration
        #[arg(long)]
        no_shift_correction: bool,

        /// Leave the column valve open if the run fails
        #[arg(long)]
        keep_valve_open: bool,

        /// Write a JSON summary (shifts and per-image metadata) here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Convert a rotation rate to the stage's fractional tilt speed
    TiltSpeed {
        /// Rotation rate in degrees per second
        deg_per_s: f64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level)),
        )
        .init();

    match cli.command {
        Commands::TiltSpeed { deg_per_s } => {
            let fraction = fractional_tilt_speed(deg_per_s)?;
            println!("{deg_per_s} deg/s -> fractional speed {fraction:.6}");
            Ok(())
        }
        Commands::Simulate {
            start,
            stop,
            step,
            exposure,
            sampling,
            camera,
            correction_interval,
            batch_wise,
            no_shift_correction,
            keep_valve_open,
            output,
        } => {
            let plan = TiltSeriesPlan::new(camera, start, stop, step, exposure, sampling)?;
            let options = TiltSeriesOptions {
                shift_correction: !no_shift_correction,
                correction_interval,
                strategy: if batch_wise {
                    SamplingStrategy::BatchWise
                } else {
                    SamplingStrategy::OneShot
                },
                close_valve_on_abort: !keep_valve_open,
            };

            let cancel = CancelSource::new();
            let token = cancel.token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Ctrl-C received, cancelling");
                    cancel.cancel();
                }
            });

            let session =
                TiltSeriesSession::new(Arc::new(MockMicroscope::new()), Arc::new(settings));
            let outcome = session.run(&plan, &options, &token).await?;

            info!(
                "Acquired {} images (shift correction {})",
                outcome.series.len(),
                if outcome.corrected { "applied" } else { "not applied" }
            );

            if let Some(path) = output {
                let images: Vec<_> = outcome
                    .series
                    .iter()
                    .zip(&plan.alphas)
                    .map(|(acquisition, alpha)| {
                        json!({
                            "alpha": alpha,
                            "mean": acquisition.image.mean(),
                            "metadata": acquisition.metadata,
                        })
                    })
                    .collect();
                let summary = json!({
                    "run_id": outcome.run_id,
                    "alpha_bounds": plan.alpha_arr,
                    "corrected": outcome.corrected,
                    "shifts": outcome.shifts,
                    "images": images,
                });
                std::fs::write(&path, serde_json::to_string_pretty(&summary)?)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!("Summary written to {}", path.display());
            }
            Ok(())
        }
    }
}
