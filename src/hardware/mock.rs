//! Simulated microscope.
//!
//! Provides an in-process instrument for tests and the demo binary. Timing is
//! real (tokio sleeps, never `std::thread::sleep`), so the blanking and tilting
//! workers interact with it the same way they would with hardware.
//!
//! # Behaviour
//!
//! - `acquire` takes a command latency (default 0.4 s), then one exposure blind,
//!   then one exposure recording. Image intensity scales with the fraction of the
//!   recording interval during which the beam was actually unblanked.
//! - Acquiring resets the camera configuration; acquiring without `configure`
//!   is a device error.
//! - Tilting takes `|delta| / (speed * 28.7 deg/s)`. The stage angle is
//!   interpolated while a move is in flight.
//! - The specimen is a fixed set of Gaussian blobs drawn from a seeded RNG. The
//!   rendered content is displaced by `drift(alpha) + image_shift`, so applying
//!   the negated drift as image shift re-centres it.
//! - Every command is recorded in an event log with its time and thread.
//!
//! # Thread affinity
//!
//! [`MockConnection`] is `!Send` and rejects calls from any thread other than the
//! one that opened it. The connector counts live connections so tests can check
//! that workers released theirs.

use crate::acquisition::{Acquisition, Image};
use crate::error::{DaqError, DaqResult};
use crate::hardware::tilt_speed::DEG_PER_S_PER_FRACTION;
use crate::hardware::{
    BeamBlanker, Binning, Camera, CameraSettings, ColumnValve, DeviceConnector, ImageShift,
    ScreenPosition, StageSnapshot, TiltStage, ValvePosition, ViewingScreen,
};
use crate::metadata::MetadataBuilder;
use crate::shift::ShiftVector;
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::trace;

/// Specimen drift as a function of tilt, in micrometres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftModel {
    /// Drift per degree
    pub linear: ShiftVector,
    /// Drift per degree squared
    pub quadratic: ShiftVector,
}

impl DriftModel {
    /// A perfectly eucentric specimen.
    pub const NONE: DriftModel = DriftModel {
        linear: ShiftVector::ZERO,
        quadratic: ShiftVector::ZERO,
    };

    /// Drift at `alpha` degrees.
    pub fn at(&self, alpha: f64) -> ShiftVector {
        ShiftVector::new(
            self.linear.x * alpha + self.quadratic.x * alpha * alpha,
            self.linear.y * alpha + self.quadratic.y * alpha * alpha,
        )
    }
}

impl Default for DriftModel {
    fn default() -> Self {
        Self {
            linear: ShiftVector::new(0.04, -0.02),
            quadratic: ShiftVector::new(0.0005, 0.0008),
        }
    }
}

/// Simulation parameters and fault injection.
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Selectable cameras
    pub cameras: Vec<String>,
    /// Supported exposure range in seconds
    pub exposure_range: (f64, f64),
    /// Supported square binning factors, finest first
    pub binnings: Vec<u32>,
    /// Sensor edge length in pixels
    pub sensor_size: usize,
    /// Unbinned pixel size in metres
    pub pixel_size_m: f64,
    /// Command latency before the blind interval of an acquire
    pub acquire_latency: Duration,
    /// Mechanical settling time
    pub settle_time: Duration,
    /// Extra time added to every tilt (simulates a sluggish stage)
    pub extra_tilt_time: Duration,
    /// Specimen drift model
    pub drift: DriftModel,
    /// Specimen and noise seed
    pub seed: u64,
    /// Number of Gaussian features in the specimen
    pub feature_count: usize,
    /// Uniform noise amplitude, in counts
    pub noise: f32,
    /// Fail the acquire with this global index (0-based)
    pub fail_acquire_at: Option<usize>,
    /// Initial stage alpha in degrees
    pub initial_alpha: f64,
    /// Initial beam blanker state
    pub initial_beam_blanked: bool,
    /// Initial column valve state
    pub initial_valve: ValvePosition,
    /// Initial viewing screen state
    pub initial_screen: ScreenPosition,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            cameras: vec!["BM-Ceta".to_string()],
            exposure_range: (0.01, 60.0),
            binnings: vec![1, 2, 4, 8],
            sensor_size: 512,
            pixel_size_m: 5.0e-8,
            acquire_latency: Duration::from_millis(400),
            settle_time: Duration::from_millis(50),
            extra_tilt_time: Duration::ZERO,
            drift: DriftModel::default(),
            seed: 7,
            feature_count: 60,
            noise: 0.5,
            fail_acquire_at: None,
            initial_alpha: 0.0,
            initial_beam_blanked: false,
            initial_valve: ValvePosition::Closed,
            initial_screen: ScreenPosition::Inserted,
        }
    }
}

/// What a recorded command did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceEventKind {
    /// Beam blanked
    BeamBlanked,
    /// Beam unblanked
    BeamUnblanked,
    /// Column valve opened
    ValveOpened,
    /// Column valve closed
    ValveClosed,
    /// Viewing screen inserted
    ScreenInserted,
    /// Viewing screen retracted
    ScreenRetracted,
    /// Image shift applied
    ImageShiftSet(ShiftVector),
    /// Stage move issued
    TiltStarted {
        /// Target alpha
        target: f64,
        /// Fractional speed
        speed: f64,
    },
    /// Stage move completed
    TiltFinished {
        /// Alpha reached
        alpha: f64,
    },
    /// Camera configured
    CameraConfigured,
    /// Acquire issued
    AcquireStarted {
        /// Global acquire index
        index: usize,
    },
    /// Acquire returned
    AcquireFinished {
        /// Global acquire index
        index: usize,
        /// Fraction of the recording interval with the beam on
        beam_fraction: f64,
    },
}

/// One entry of the event log.
#[derive(Debug, Clone, Copy)]
pub struct DeviceEvent {
    /// When the command took effect
    pub at: Instant,
    /// Thread that issued it
    pub thread: ThreadId,
    /// What happened
    pub kind: DeviceEventKind,
}

#[derive(Debug, Clone, Copy)]
struct StageMotion {
    from: f64,
    to: f64,
    started: Instant,
    duration: Duration,
}

impl StageMotion {
    fn at_rest(alpha: f64) -> Self {
        Self {
            from: alpha,
            to: alpha,
            started: Instant::now(),
            duration: Duration::ZERO,
        }
    }

    fn alpha_at(&self, t: Instant) -> f64 {
        if self.duration.is_zero() || t >= self.started + self.duration {
            self.to
        } else if t <= self.started {
            self.from
        } else {
            let progress = (t - self.started).as_secs_f64() / self.duration.as_secs_f64();
            self.from + (self.to - self.from) * progress
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Feature {
    x: f64,
    y: f64,
    sigma: f64,
    amplitude: f64,
}

#[derive(Debug)]
struct MicroscopeState {
    beam_history: Vec<(Instant, bool)>,
    valve: ValvePosition,
    screen: ScreenPosition,
    image_shift: ShiftVector,
    motion: StageMotion,
    stage_version: u64,
    camera: Option<CameraSettings>,
    acquisitions: usize,
    events: Vec<DeviceEvent>,
}

impl MicroscopeState {
    fn log(&mut self, kind: DeviceEventKind) {
        self.events.push(DeviceEvent {
            at: Instant::now(),
            thread: std::thread::current().id(),
            kind,
        });
    }

    fn beam_blanked(&self) -> bool {
        self.beam_history.last().map_or(true, |&(_, blanked)| blanked)
    }

    fn set_beam(&mut self, blanked: bool) {
        self.beam_history.push((Instant::now(), blanked));
        self.log(if blanked {
            DeviceEventKind::BeamBlanked
        } else {
            DeviceEventKind::BeamUnblanked
        });
    }

    fn unblanked_during(&self, from: Instant, to: Instant) -> Duration {
        let mut total = Duration::ZERO;
        for (i, &(at, blanked)) in self.beam_history.iter().enumerate() {
            let end = self.beam_history.get(i + 1).map_or(to, |&(next, _)| next);
            let start = at.max(from);
            let end = end.min(to);
            if !blanked && end > start {
                total += end - start;
            }
        }
        total
    }
}

struct Shared {
    config: MockConfig,
    specimen: Vec<Feature>,
    state: RwLock<MicroscopeState>,
    live: AtomicUsize,
    opened: AtomicUsize,
    calls: AtomicUsize,
}

/// Simulated instrument. Cloning shares the same instrument.
#[derive(Clone)]
pub struct MockMicroscope {
    shared: Arc<Shared>,
}

impl Default for MockMicroscope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockMicroscope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockMicroscope")
            .field("live_connections", &self.live_connections())
            .field("device_calls", &self.device_calls())
            .finish()
    }
}

impl MockMicroscope {
    /// Simulated instrument with default parameters.
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    /// Simulated instrument with custom parameters.
    pub fn with_config(config: MockConfig) -> Self {
        let specimen = generate_specimen(&config);
        let state = MicroscopeState {
            beam_history: vec![(Instant::now(), config.initial_beam_blanked)],
            valve: config.initial_valve,
            screen: config.initial_screen,
            image_shift: ShiftVector::ZERO,
            motion: StageMotion::at_rest(config.initial_alpha),
            stage_version: 0,
            camera: None,
            acquisitions: 0,
            events: Vec::new(),
        };
        Self {
            shared: Arc::new(Shared {
                config,
                specimen,
                state: RwLock::new(state),
                live: AtomicUsize::new(0),
                opened: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Simulation parameters.
    pub fn config(&self) -> &MockConfig {
        &self.shared.config
    }

    /// Connections currently open.
    pub fn live_connections(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Connections opened so far.
    pub fn connections_opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Device calls made so far, over all connections.
    pub fn device_calls(&self) -> usize {
        self.shared.calls.load(Ordering::SeqCst)
    }

    /// Snapshot of the event log.
    pub async fn events(&self) -> Vec<DeviceEvent> {
        self.shared.state.read().await.events.clone()
    }

    /// Current blanker state.
    pub async fn beam_blanked(&self) -> bool {
        self.shared.state.read().await.beam_blanked()
    }

    /// Current valve state.
    pub async fn valve(&self) -> ValvePosition {
        self.shared.state.read().await.valve
    }

    /// Current screen state.
    pub async fn screen(&self) -> ScreenPosition {
        self.shared.state.read().await.screen
    }

    /// Current stage alpha.
    pub async fn alpha(&self) -> f64 {
        self.shared.state.read().await.motion.alpha_at(Instant::now())
    }

    /// Current image shift.
    pub async fn image_shift(&self) -> ShiftVector {
        self.shared.state.read().await.image_shift
    }

    /// Number of acquire calls so far.
    pub async fn acquisitions(&self) -> usize {
        self.shared.state.read().await.acquisitions
    }

    /// Total time the beam was unblanked between `from` and `to`.
    pub async fn unblanked_during(&self, from: Instant, to: Instant) -> Duration {
        self.shared.state.read().await.unblanked_during(from, to)
    }

    /// Image shift that exactly cancels the specimen drift at `alpha`.
    pub fn ideal_correction(&self, alpha: f64) -> ShiftVector {
        -self.shared.config.drift.at(alpha)
    }
}

impl DeviceConnector for MockMicroscope {
    type Connection = MockConnection;

    fn connect(&self) -> DaqResult<MockConnection> {
        self.shared.live.fetch_add(1, Ordering::SeqCst);
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            shared: Arc::clone(&self.shared),
            thread: std::thread::current().id(),
            _not_send: PhantomData,
        })
    }
}

/// Thread-affine connection to a [`MockMicroscope`].
pub struct MockConnection {
    shared: Arc<Shared>,
    thread: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockConnection {
    fn call(&self) -> DaqResult<()> {
        self.shared.calls.fetch_add(1, Ordering::SeqCst);
        if std::thread::current().id() != self.thread {
            return Err(DaqError::Device(
                "connection used from a thread other than the one that opened it".to_string(),
            ));
        }
        Ok(())
    }

    fn check_camera(&self, camera: &str) -> DaqResult<()> {
        if self.shared.config.cameras.iter().any(|c| c == camera) {
            Ok(())
        } else {
            Err(DaqError::Device(format!("unknown camera '{camera}'")))
        }
    }
}

#[async_trait(?Send)]
impl BeamBlanker for MockConnection {
    async fn beam_is_blank(&self) -> DaqResult<bool> {
        self.call()?;
        Ok(self.shared.state.read().await.beam_blanked())
    }

    async fn blank_beam(&self) -> DaqResult<()> {
        self.call()?;
        self.shared.state.write().await.set_beam(true);
        Ok(())
    }

    async fn unblank_beam(&self) -> DaqResult<()> {
        self.call()?;
        self.shared.state.write().await.set_beam(false);
        Ok(())
    }
}

#[async_trait(?Send)]
impl ColumnValve for MockConnection {
    async fn column_valve_position(&self) -> DaqResult<ValvePosition> {
        self.call()?;
        Ok(self.shared.state.read().await.valve)
    }

    async fn open_column_valve(&self) -> DaqResult<()> {
        self.call()?;
        let mut state = self.shared.state.write().await;
        state.valve = ValvePosition::Open;
        state.log(DeviceEventKind::ValveOpened);
        Ok(())
    }

    async fn close_column_valve(&self) -> DaqResult<()> {
        self.call()?;
        let mut state = self.shared.state.write().await;
        state.valve = ValvePosition::Closed;
        state.log(DeviceEventKind::ValveClosed);
        Ok(())
    }
}

#[async_trait(?Send)]
impl ViewingScreen for MockConnection {
    async fn screen_position(&self) -> DaqResult<ScreenPosition> {
        self.call()?;
        Ok(self.shared.state.read().await.screen)
    }

    async fn insert_screen(&self) -> DaqResult<()> {
        self.call()?;
        let mut state = self.shared.state.write().await;
        state.screen = ScreenPosition::Inserted;
        state.log(DeviceEventKind::ScreenInserted);
        Ok(())
    }

    async fn retract_screen(&self) -> DaqResult<()> {
        self.call()?;
        let mut state = self.shared.state.write().await;
        state.screen = ScreenPosition::Retracted;
        state.log(DeviceEventKind::ScreenRetracted);
        Ok(())
    }
}

#[async_trait(?Send)]
impl ImageShift for MockConnection {
    async fn image_shift(&self) -> DaqResult<ShiftVector> {
        self.call()?;
        Ok(self.shared.state.read().await.image_shift)
    }

    async fn set_image_shift(&self, shift: ShiftVector) -> DaqResult<()> {
        self.call()?;
        let mut state = self.shared.state.write().await;
        state.image_shift = shift;
        state.log(DeviceEventKind::ImageShiftSet(shift));
        Ok(())
    }
}

#[async_trait(?Send)]
impl TiltStage for MockConnection {
    async fn stage_alpha(&self) -> DaqResult<f64> {
        self.call()?;
        Ok(self.shared.state.read().await.motion.alpha_at(Instant::now()))
    }

    async fn tilt_to(&self, alpha: f64, speed: f64) -> DaqResult<StageSnapshot> {
        self.call()?;
        if !(speed > 0.0 && speed <= 1.0) {
            return Err(DaqError::Device(format!(
                "fractional tilt speed {speed} outside (0, 1]"
            )));
        }

        let (motion, duration) = {
            let mut state = self.shared.state.write().await;
            let now = Instant::now();
            let from = state.motion.alpha_at(now);
            let travel = (alpha - from).abs() / (speed * DEG_PER_S_PER_FRACTION);
            let duration = Duration::from_secs_f64(travel) + self.shared.config.extra_tilt_time;
            let motion = StageMotion {
                from,
                to: alpha,
                started: now,
                duration,
            };
            state.motion = motion;
            state.log(DeviceEventKind::TiltStarted {
                target: alpha,
                speed,
            });
            (motion, duration)
        };
        trace!("Mock stage tilting {:.3} -> {:.3} in {:?}", motion.from, alpha, duration);

        sleep(duration).await;

        let mut state = self.shared.state.write().await;
        if state.motion.started == motion.started {
            state.motion = StageMotion::at_rest(alpha);
        }
        state.stage_version += 1;
        state.log(DeviceEventKind::TiltFinished { alpha });
        Ok(StageSnapshot {
            alpha,
            version: state.stage_version,
        })
    }

    async fn wait_settled(&self) -> DaqResult<()> {
        self.call()?;
        sleep(self.shared.config.settle_time).await;
        Ok(())
    }
}

#[async_trait(?Send)]
impl Camera for MockConnection {
    async fn available_cameras(&self) -> DaqResult<Vec<String>> {
        self.call()?;
        Ok(self.shared.config.cameras.clone())
    }

    async fn exposure_time_range(&self, camera: &str) -> DaqResult<(f64, f64)> {
        self.call()?;
        self.check_camera(camera)?;
        Ok(self.shared.config.exposure_range)
    }

    async fn supported_binnings(&self, camera: &str) -> DaqResult<Vec<Binning>> {
        self.call()?;
        self.check_camera(camera)?;
        Ok(self
            .shared
            .config
            .binnings
            .iter()
            .map(|&b| Binning::square(b))
            .collect())
    }

    async fn configure(&self, settings: &CameraSettings) -> DaqResult<()> {
        self.call()?;
        self.check_camera(&settings.camera)?;
        let config = &self.shared.config;
        if settings.binning.width != settings.binning.height
            || !config.binnings.contains(&settings.binning.width)
        {
            return Err(DaqError::Device(format!(
                "unsupported binning {:?}",
                settings.binning
            )));
        }
        let (min, max) = config.exposure_range;
        if !(settings.exposure_time >= min && settings.exposure_time <= max) {
            return Err(DaqError::Device(format!(
                "exposure {} s outside [{min}, {max}]",
                settings.exposure_time
            )));
        }

        let mut state = self.shared.state.write().await;
        state.camera = Some(settings.clone());
        state.log(DeviceEventKind::CameraConfigured);
        Ok(())
    }

    async fn acquire(&self) -> DaqResult<Acquisition> {
        self.call()?;
        let config = &self.shared.config;

        let (settings, index) = {
            let mut state = self.shared.state.write().await;
            let settings = state
                .camera
                .take()
                .ok_or_else(|| DaqError::Device("camera not configured".to_string()))?;
            let index = state.acquisitions;
            state.acquisitions += 1;
            state.log(DeviceEventKind::AcquireStarted { index });
            (settings, index)
        };

        if config.fail_acquire_at == Some(index) {
            return Err(DaqError::Device(format!(
                "camera timed out on acquisition {index}"
            )));
        }

        let exposure = Duration::from_secs_f64(settings.exposure_time);
        let issued = Instant::now();
        sleep(config.acquire_latency + exposure * 2).await;
        let recording_start = issued + config.acquire_latency + exposure;
        let recording_end = recording_start + exposure;

        let (beam_fraction, alpha_mid, alpha_end, image_shift) = {
            let state = self.shared.state.read().await;
            let on = state.unblanked_during(recording_start, recording_end);
            let fraction = if exposure.is_zero() {
                0.0
            } else {
                on.as_secs_f64() / exposure.as_secs_f64()
            };
            (
                fraction.clamp(0.0, 1.0),
                state.motion.alpha_at(recording_start + exposure / 2),
                state.motion.alpha_at(Instant::now()),
                state.image_shift,
            )
        };

        let binning = settings.binning.width as usize;
        let edge = ((config.sensor_size as f64 * settings.readout_area.fraction()) as usize
            / binning.max(1))
        .max(1);
        let pixel_m = config.pixel_size_m * binning as f64;
        let offset = config.drift.at(alpha_mid) + image_shift;

        let mut rng = StdRng::seed_from_u64(
            config
                .seed
                .wrapping_add((index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        );
        let pixels = render(
            &self.shared.specimen,
            edge,
            pixel_m * 1e6,
            offset,
            beam_fraction,
            config.noise,
            &mut rng,
        );
        let image = Image::new(edge, edge, pixels)
            .ok_or_else(|| DaqError::Device("image buffer size mismatch".to_string()))?;

        let metadata = MetadataBuilder::new()
            .pixel_size(pixel_m, pixel_m)
            .exposure_time(settings.exposure_time)
            .camera(&settings.camera)
            .binning(settings.binning.width, settings.binning.height)
            .alpha_tilt(alpha_end)
            .acquisition_time(Utc::now())
            .build();

        self.shared
            .state
            .write()
            .await
            .log(DeviceEventKind::AcquireFinished {
                index,
                beam_fraction,
            });
        Ok(Acquisition::new(image, metadata))
    }
}

fn generate_specimen(config: &MockConfig) -> Vec<Feature> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let half_fov = config.sensor_size as f64 * config.pixel_size_m * 1e6 * 0.55;
    (0..config.feature_count)
        .map(|_| Feature {
            x: rng.gen_range(-half_fov..half_fov),
            y: rng.gen_range(-half_fov..half_fov),
            sigma: rng.gen_range(0.3..0.9),
            amplitude: rng.gen_range(0.4..1.0),
        })
        .collect()
}

/// Render the specimen displaced by `offset` (micrometres) into an `edge x edge` image.
fn render(
    specimen: &[Feature],
    edge: usize,
    pixel_um: f64,
    offset: ShiftVector,
    beam_fraction: f64,
    noise: f32,
    rng: &mut StdRng,
) -> Vec<f32> {
    let mut pixels = vec![0.0f32; edge * edge];
    let centre = edge as f64 / 2.0 - 0.5;
    let scale = 100.0 * beam_fraction;

    if scale > 0.0 {
        for feature in specimen {
            // Image y grows downwards
            let col_c = (feature.x + offset.x) / pixel_um + centre;
            let row_c = -(feature.y + offset.y) / pixel_um + centre;
            let reach = 4.0 * feature.sigma / pixel_um;
            let two_sigma_sq = 2.0 * feature.sigma * feature.sigma;

            let rows = clamp_range(row_c - reach, row_c + reach, edge);
            let cols = clamp_range(col_c - reach, col_c + reach, edge);
            for row in rows {
                let dy = (row as f64 - row_c) * pixel_um;
                for col in cols.clone() {
                    let dx = (col as f64 - col_c) * pixel_um;
                    let value = feature.amplitude * (-(dx * dx + dy * dy) / two_sigma_sq).exp();
                    pixels[row * edge + col] += (scale * value) as f32;
                }
            }
        }
    }

    if noise > 0.0 {
        for p in &mut pixels {
            *p += rng.gen_range(-noise..noise);
        }
    }
    pixels
}

fn clamp_range(lo: f64, hi: f64, len: usize) -> std::ops::Range<usize> {
    let lo = lo.floor().max(0.0) as usize;
    let hi = (hi.ceil().max(0.0) as usize + 1).min(len);
    lo.min(hi)..hi
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::ReadoutArea;

    fn fast_config() -> MockConfig {
        MockConfig {
            acquire_latency: Duration::from_millis(10),
            settle_time: Duration::from_millis(1),
            ..MockConfig::default()
        }
    }

    fn settings(exposure_time: f64) -> CameraSettings {
        CameraSettings {
            camera: "BM-Ceta".to_string(),
            binning: Binning::square(4),
            readout_area: ReadoutArea::Full,
            exposure_time,
        }
    }

    #[tokio::test]
    async fn test_connections_are_counted() {
        let mock = MockMicroscope::new();
        {
            let _a = mock.connect().unwrap();
            let _b = mock.connect().unwrap();
            assert_eq!(mock.live_connections(), 2);
        }
        assert_eq!(mock.live_connections(), 0);
        assert_eq!(mock.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_initial_flags() {
        let mock = MockMicroscope::new();
        let connection = mock.connect().unwrap();
        assert!(!connection.beam_is_blank().await.unwrap());
        assert_eq!(
            connection.column_valve_position().await.unwrap(),
            ValvePosition::Closed
        );
        assert_eq!(
            connection.screen_position().await.unwrap(),
            ScreenPosition::Inserted
        );
        assert_eq!(mock.device_calls(), 3);
    }

    #[tokio::test]
    async fn test_tilt_updates_alpha_and_version() {
        let mock = MockMicroscope::new();
        let connection = mock.connect().unwrap();

        let first = connection.tilt_to(1.0, 1.0).await.unwrap();
        let second = connection.tilt_to(-1.0, 1.0).await.unwrap();
        assert_eq!(first.alpha, 1.0);
        assert!(second.version > first.version);
        assert!((connection.stage_alpha().await.unwrap() + 1.0).abs() < 1e-9);
        assert!(connection.tilt_to(0.0, 1.5).await.is_err());
    }

    #[tokio::test]
    async fn test_acquire_requires_configuration() {
        let mock = MockMicroscope::with_config(fast_config());
        let connection = mock.connect().unwrap();

        assert!(matches!(connection.acquire().await, Err(DaqError::Device(_))));

        connection.configure(&settings(0.02)).await.unwrap();
        let acquisition = connection.acquire().await.unwrap();
        assert_eq!(acquisition.image.shape(), (128, 128));
        let (px, py) = acquisition.metadata.pixel_size().unwrap();
        assert!((px - 2.0e-7).abs() < 1e-15 && (py - 2.0e-7).abs() < 1e-15);

        // The acquire consumed the configuration
        assert!(connection.acquire().await.is_err());
    }

    #[tokio::test]
    async fn test_blanked_beam_gives_dark_image() {
        let config = MockConfig {
            noise: 0.0,
            ..fast_config()
        };
        let mock = MockMicroscope::with_config(config);
        let connection = mock.connect().unwrap();

        connection.unblank_beam().await.unwrap();
        connection.configure(&settings(0.02)).await.unwrap();
        let bright = connection.acquire().await.unwrap();

        connection.blank_beam().await.unwrap();
        connection.configure(&settings(0.02)).await.unwrap();
        let dark = connection.acquire().await.unwrap();

        assert!(bright.image.mean() > 1.0);
        assert_eq!(dark.image.mean(), 0.0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let config = MockConfig {
            fail_acquire_at: Some(0),
            ..fast_config()
        };
        let mock = MockMicroscope::with_config(config);
        let connection = mock.connect().unwrap();
        connection.configure(&settings(0.02)).await.unwrap();
        assert!(connection.acquire().await.is_err());

        let unknown = CameraSettings {
            camera: "Falcon".to_string(),
            ..settings(0.02)
        };
        assert!(connection.configure(&unknown).await.is_err());
        assert!(connection.exposure_time_range("Falcon").await.is_err());
    }

    #[test]
    fn test_connection_rejects_foreign_thread() {
        let mock = MockMicroscope::new();
        let connection = mock.connect().unwrap();
        let shared = Arc::clone(&connection.shared);
        let opener = connection.thread;

        // Rebuild an equivalent handle on another thread to exercise the check
        let result = std::thread::spawn(move || {
            let foreign = MockConnection {
                shared,
                thread: opener,
                _not_send: PhantomData,
            };
            let outcome = foreign.call();
            // Balance the live-connection count for the handle we did not open
            foreign.shared.live.fetch_add(1, Ordering::SeqCst);
            outcome
        })
        .join()
        .unwrap();
        assert!(result.is_err());
        drop(connection);
        assert_eq!(mock.live_connections(), 0);
    }

    #[test]
    fn test_drift_model() {
        let drift = DriftModel::default();
        assert_eq!(drift.at(0.0), ShiftVector::ZERO);
        let at_ten = drift.at(10.0);
        assert!((at_ten.x - 0.45).abs() < 1e-12);
        assert!((at_ten.y - (-0.12)).abs() < 1e-12);
    }
}
