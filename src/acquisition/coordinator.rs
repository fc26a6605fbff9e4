//! Acquisition coordinator.
//!
//! Drives one acquisition series:
//!
//! 1. Validate the request: first structurally, then against the camera's
//!    reported capabilities. Nothing is mutated until both pass.
//! 2. Record the blanker/valve/screen flags and force blanked/open/retracted.
//! 3. If blanker optimization or tilting is requested, create one barrier per
//!    step and start the workers on their own threads.
//! 4. For each step: apply the image shift, move to the stationary angle, configure
//!    the camera, (un)blank if no worker owns the beam, meet the workers at the
//!    step's barrier, acquire, and append the result.
//! 5. Join the workers (signalling them first on failure), then restore the flags,
//!    or make the instrument safe after a cancellation.
//!
//! A series either returns all N acquisitions or fails; hardware side effects
//! of a failed series are not rolled back beyond the flag restore.

use crate::acquisition::device_state::DeviceStateSnapshot;
use crate::acquisition::request::{AcquisitionRequest, SingleAcquisitionOptions};
use crate::acquisition::{AcquireTiming, Acquisition, AcquisitionSeries};
use crate::config::Settings;
use crate::error::{DaqError, DaqResult};
use crate::hardware::{
    BeamBlanker, Camera, CameraSettings, DeviceConnector, ImageShift, Microscope, Sampling,
    TiltStage,
};
use crate::sync::SyncBarriers;
use crate::workers::{BlankingPlan, TiltPlan, WorkerReports, WorkerSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Runs acquisition series against the instrument behind a [`DeviceConnector`].
///
/// Every call opens its own connection on the calling thread; the workers open
/// theirs on their own threads.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tem_daq::acquisition::{AcquisitionCoordinator, AcquisitionRequest};
/// use tem_daq::config::Settings;
/// use tem_daq::hardware::mock::MockMicroscope;
///
/// # tokio_test::block_on(async {
/// let coordinator = AcquisitionCoordinator::new(
///     Arc::new(MockMicroscope::new()),
///     Arc::new(Settings::default()),
/// );
/// let request = AcquisitionRequest::builder("BM-Ceta", 2)
///     .exposure_time(0.1)
///     .blanker_optimization(false)
///     .build();
/// let series = coordinator.acquisition_series(&request).await.unwrap();
/// assert_eq!(series.len(), 2);
/// # });
/// ```
pub struct AcquisitionCoordinator<C: DeviceConnector> {
    connector: Arc<C>,
    settings: Arc<Settings>,
}

impl<C: DeviceConnector> Clone for AcquisitionCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<C: DeviceConnector> AcquisitionCoordinator<C> {
    /// Create a coordinator.
    pub fn new(connector: Arc<C>, settings: Arc<Settings>) -> Self {
        Self {
            connector,
            settings,
        }
    }

    /// The shared connector.
    pub fn connector(&self) -> &Arc<C> {
        &self.connector
    }

    /// The settings in use.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Acquire a single image, optionally tilting to
    /// `options.tilt_destination` while recording.
    pub async fn acquisition(
        &self,
        camera: &str,
        exposure_time: f64,
        sampling: Sampling,
        options: SingleAcquisitionOptions,
    ) -> DaqResult<Acquisition> {
        let mut builder = AcquisitionRequest::builder(camera, 1)
            .exposure_time(exposure_time)
            .sampling(sampling)
            .readout_area(options.readout_area)
            .blanker_optimization(options.blanker_optimization);

        if let Some(destination) = options.tilt_destination {
            let start = {
                let connection = self.connector.connect()?;
                connection.stage_alpha().await?
            };
            builder = builder.tilt_bounds(vec![start, destination]);
        }

        let series = self.acquisition_series(&builder.build()).await?;
        series
            .into_acquisitions()
            .into_iter()
            .next()
            .ok_or_else(|| DaqError::Device("camera returned no image".to_string()))
    }

    /// Run a series to completion.
    pub async fn acquisition_series(
        &self,
        request: &AcquisitionRequest,
    ) -> DaqResult<AcquisitionSeries> {
        self.acquisition_series_until(request, std::future::pending())
            .await
    }

    /// Run a series, aborting with [`DaqError::Cancelled`] if `cancel` resolves
    /// first.
    pub async fn acquisition_series_until<F>(
        &self,
        request: &AcquisitionRequest,
        cancel: F,
    ) -> DaqResult<AcquisitionSeries>
    where
        F: Future<Output = ()>,
    {
        request.validate()?;
        let tilt_speeds = request.tilt_speeds()?;

        let connection = self.connector.connect()?;
        let camera_settings = resolve_camera_settings(&connection, request).await?;

        info!(
            count = request.count,
            camera = %request.camera,
            exposure_time = request.exposure_time,
            sampling = %request.sampling,
            blanker_optimization = request.blanker_optimization,
            tilting = request.is_tilting(),
            "Starting acquisition series"
        );

        let snapshot = DeviceStateSnapshot::capture_and_prepare(&connection).await?;

        let mut workers = match self.start_workers(request, tilt_speeds) {
            Ok(workers) => workers,
            Err(e) => {
                error!("Failed to start workers: {}", e);
                if let Err(restore_error) = snapshot.restore(&connection).await {
                    error!("Failed to restore instrument flags: {}", restore_error);
                }
                return Err(e);
            }
        };

        let outcome = tokio::select! {
            result = self.run_steps(&connection, request, &camera_settings, workers.as_mut()) => result,
            _ = cancel => {
                warn!("Acquisition series cancelled");
                Err(DaqError::Cancelled)
            }
        };

        let join_timeout = self.settings.workers.join_timeout();
        let reports = match workers {
            Some(workers) if outcome.is_ok() => workers.finish(join_timeout).await,
            Some(workers) => workers.abort(join_timeout).await,
            None => Ok(WorkerReports::default()),
        };

        let teardown = match &outcome {
            Err(DaqError::Cancelled) => {
                DeviceStateSnapshot::make_safe(&connection, request.close_valve_on_abort).await
            }
            _ => snapshot.restore(&connection).await,
        };

        let mut series = match outcome {
            Ok(series) => series,
            Err(e) => {
                if let Err(worker_error) = reports {
                    warn!("Worker error during aborted series: {}", worker_error);
                }
                if let Err(teardown_error) = teardown {
                    error!("Teardown after failed series also failed: {}", teardown_error);
                }
                return Err(e);
            }
        };

        let reports = reports?;
        teardown?;

        let timing = series.timing_mut();
        timing.blanking = reports.blanking;
        timing.tilting = reports.tilting;

        info!("Acquisition series complete ({} images)", series.len());
        Ok(series)
    }

    fn start_workers(
        &self,
        request: &AcquisitionRequest,
        tilt_speeds: Vec<f64>,
    ) -> DaqResult<Option<WorkerSet>> {
        if !request.needs_workers() {
            return Ok(None);
        }

        let timing = &self.settings.timing;
        let barriers = SyncBarriers::new(request.count, request.party_count());
        let mut workers = WorkerSet::new(barriers);

        if request.blanker_optimization {
            let plan = BlankingPlan::new(request.count, request.exposure_time, timing);
            workers.spawn_blanking(Arc::clone(&self.connector), plan)?;
        }
        if let Some(bounds) = &request.tilt_bounds {
            let plan = TiltPlan::new(bounds.clone(), tilt_speeds, request.exposure_time, timing)?;
            workers.spawn_tilting(Arc::clone(&self.connector), plan)?;
        }

        debug!(
            "Started workers for {} parties over {} steps",
            request.party_count(),
            request.count
        );
        Ok(Some(workers))
    }

    async fn run_steps(
        &self,
        connection: &C::Connection,
        request: &AcquisitionRequest,
        camera_settings: &CameraSettings,
        mut workers: Option<&mut WorkerSet>,
    ) -> DaqResult<AcquisitionSeries> {
        let mut series = AcquisitionSeries::with_capacity(request.count);
        let stationary_speed = self.settings.timing.stationary_tilt_speed;

        for index in 0..request.count {
            if let Some(shift) = request.shifts.as_ref().and_then(|s| s.get(index)) {
                connection.set_image_shift(*shift).await?;
            }

            if let Some(&alpha) = request.stationary_angles.as_ref().and_then(|a| a.get(index)) {
                connection.tilt_to(alpha, stationary_speed).await?;
                connection.wait_settled().await?;
            }

            // Acquiring resets the camera, so this is repeated every step
            connection.configure(camera_settings).await?;

            if !request.blanker_optimization {
                connection.unblank_beam().await?;
            }

            if let Some(workers) = workers.as_deref_mut() {
                workers.wait_at(index).await?;
            }

            let released_at = Instant::now();
            let acquisition = connection.acquire().await?;
            let returned_at = Instant::now();

            if !request.blanker_optimization {
                connection.blank_beam().await?;
            }

            debug!(
                step = index,
                acquire_ms = (returned_at - released_at).as_millis() as u64,
                "Acquired image {}/{}",
                index + 1,
                request.count
            );
            series.timing_mut().acquisitions.push(AcquireTiming {
                index,
                released_at,
                returned_at,
            });
            series.push(acquisition);
        }

        Ok(series)
    }
}

/// Check the camera-dependent parameters against the device and resolve the
/// sampling tag to a binning. Only queries; never mutates.
async fn resolve_camera_settings<M: Microscope + ?Sized>(
    device: &M,
    request: &AcquisitionRequest,
) -> DaqResult<CameraSettings> {
    let cameras = device.available_cameras().await?;
    if !cameras.iter().any(|c| c == &request.camera) {
        return Err(DaqError::validation(
            "camera",
            format!(
                "'{}' is not available (available: {})",
                request.camera,
                cameras.join(", ")
            ),
        ));
    }

    let (min, max) = device.exposure_time_range(&request.camera).await?;
    if !(request.exposure_time > min && request.exposure_time < max) {
        return Err(DaqError::validation(
            "exposure_time",
            format!(
                "{} s is outside the supported range ({min}, {max}) for {}",
                request.exposure_time, request.camera
            ),
        ));
    }

    let binnings = device.supported_binnings(&request.camera).await?;
    let binning = binnings
        .get(request.sampling.binning_index())
        .copied()
        .ok_or_else(|| {
            DaqError::validation(
                "sampling",
                format!(
                    "{} needs binning option {} but {} only supports {}",
                    request.sampling,
                    request.sampling.binning_index(),
                    request.camera,
                    binnings.len()
                ),
            )
        })?;

    Ok(CameraSettings {
        camera: request.camera.clone(),
        binning,
        readout_area: request.readout_area,
        exposure_time: request.exposure_time,
    })
}
