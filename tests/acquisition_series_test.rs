//! End-to-end acquisition series against the simulated microscope.
//!
//! These run in real time with the default 0.4 s command latency, so they are
//! serialized to keep worker timing stable.

use serial_test::serial;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tem_daq::acquisition::{AcquisitionCoordinator, AcquisitionRequest, SingleAcquisitionOptions};
use tem_daq::config::Settings;
use tem_daq::error::DaqError;
use tem_daq::hardware::mock::{DeviceEventKind, MockConfig, MockMicroscope};
use tem_daq::hardware::{Sampling, ScreenPosition, ValvePosition};
use tem_daq::shift::ShiftVector;

const EPSILON: f64 = 0.02;

fn setup(config: MockConfig) -> (Arc<MockMicroscope>, AcquisitionCoordinator<MockMicroscope>) {
    let mock = Arc::new(MockMicroscope::with_config(config));
    let coordinator = AcquisitionCoordinator::new(Arc::clone(&mock), Arc::new(Settings::default()));
    (mock, coordinator)
}

#[tokio::test]
#[serial]
async fn test_tilt_series_without_blanker() {
    let (mock, coordinator) = setup(MockConfig::default());
    let request = AcquisitionRequest::builder("BM-Ceta", 4)
        .exposure_time(1.0)
        .sampling(Sampling::Quarter)
        .blanker_optimization(false)
        .tilt_bounds(vec![-2.0, -1.0, 0.0, 1.0, 2.0])
        .build();

    let series = coordinator.acquisition_series(&request).await.unwrap();

    assert_eq!(series.len(), 4);
    assert!((mock.alpha().await - 2.0).abs() < 1e-9);
    assert_eq!(mock.live_connections(), 0);

    let tilting = series.timing().tilting.as_ref().unwrap();
    assert_eq!(tilting.len(), 4);
    for (i, step) in tilting.iter().enumerate() {
        assert_eq!(step.index, i);
        assert_eq!(step.target, request.tilt_bounds.as_ref().unwrap()[i + 1]);
    }

    // Each image is recorded while tilting through its own interval
    for (i, acquisition) in series.iter().enumerate() {
        let alpha = acquisition.metadata.alpha_tilt().unwrap();
        assert!(alpha > -2.0 + i as f64 - EPSILON, "image {i} ended at {alpha}");
        assert!(alpha <= -1.0 + i as f64 + EPSILON, "image {i} ended at {alpha}");
    }
}

#[tokio::test]
#[serial]
async fn test_tilt_series_with_blanker() {
    let (mock, coordinator) = setup(MockConfig::default());
    let request = AcquisitionRequest::builder("BM-Ceta", 5)
        .exposure_time(0.5)
        .tilt_bounds(vec![-2.0, -1.0, 0.0, 1.0, 2.0, 3.0])
        .build();

    let series = coordinator.acquisition_series(&request).await.unwrap();

    assert_eq!(series.len(), 5);
    assert_eq!(series.timing().blanking.as_ref().unwrap().len(), 5);
    assert_eq!(series.timing().tilting.as_ref().unwrap().len(), 5);
    assert!((mock.alpha().await - 3.0).abs() < 1e-9);
    assert_eq!(mock.live_connections(), 0);
    // The coordinator plus one connection per worker
    assert_eq!(mock.connections_opened(), 3);
}

#[tokio::test]
#[serial]
async fn test_series_entries_in_order() {
    let (mock, coordinator) = setup(MockConfig {
        acquire_latency: Duration::from_millis(20),
        ..MockConfig::default()
    });
    let angles = vec![0.0, 1.0, 2.0, 3.0];
    let request = AcquisitionRequest::builder("BM-Ceta", angles.len())
        .exposure_time(0.05)
        .blanker_optimization(false)
        .stationary_angles(angles.clone())
        .build();

    let series = coordinator.acquisition_series(&request).await.unwrap();

    let recorded: Vec<f64> = series
        .iter()
        .map(|a| a.metadata.alpha_tilt().unwrap())
        .collect();
    for (recorded, expected) in recorded.iter().zip(&angles) {
        assert!((recorded - expected).abs() < 1e-9);
    }
    let timing = &series.timing().acquisitions;
    assert!(timing.iter().enumerate().all(|(i, t)| t.index == i));
    assert!(timing.windows(2).all(|w| w[0].returned_at <= w[1].released_at));
    assert_eq!(mock.acquisitions().await, 4);
}

#[tokio::test]
async fn test_shift_count_mismatch_touches_nothing() {
    let (mock, coordinator) = setup(MockConfig::default());
    let request = AcquisitionRequest::builder("BM-Ceta", 5)
        .exposure_time(0.5)
        .shifts(vec![ShiftVector::ZERO; 4])
        .build();

    let err = coordinator.acquisition_series(&request).await.unwrap_err();

    assert!(matches!(err, DaqError::Validation { ref parameter, .. } if parameter == "shifts"));
    assert_eq!(mock.device_calls(), 0);
    assert_eq!(mock.connections_opened(), 0);
}

#[tokio::test]
async fn test_bounds_count_mismatch_rejected() {
    let (mock, coordinator) = setup(MockConfig::default());
    let request = AcquisitionRequest::builder("BM-Ceta", 5)
        .exposure_time(0.5)
        .tilt_bounds(vec![-2.0, -1.0, 0.0, 1.0, 2.0])
        .build();

    let err = coordinator.acquisition_series(&request).await.unwrap_err();

    assert!(
        matches!(err, DaqError::Validation { ref parameter, .. } if parameter == "tilt_bounds")
    );
    assert_eq!(mock.device_calls(), 0);
}

#[tokio::test]
async fn test_stage_speed_beyond_fraction_rejected_up_front() {
    let (mock, coordinator) = setup(MockConfig::default());
    let request = AcquisitionRequest::builder("BM-Ceta", 1)
        .exposure_time(1.0)
        .tilt_bounds(vec![0.0, 14.95])
        .build();

    let err = coordinator.acquisition_series(&request).await.unwrap_err();

    assert!(
        matches!(err, DaqError::Validation { ref parameter, .. } if parameter == "tilt_bounds")
    );
    assert_eq!(mock.device_calls(), 0);
    assert_eq!(mock.connections_opened(), 0);
}

#[tokio::test]
#[serial]
async fn test_blanker_only_opens_during_recording() {
    let (mock, coordinator) = setup(MockConfig::default());
    let exposure = 0.3;
    let request = AcquisitionRequest::builder("BM-Ceta", 3)
        .exposure_time(exposure)
        .build();

    let series = coordinator.acquisition_series(&request).await.unwrap();

    let blanking = series.timing().blanking.as_ref().unwrap();
    assert_eq!(blanking.len(), 3);
    for step in blanking {
        let blind = (step.unblanked_at - step.released_at).as_secs_f64();
        let open = (step.blanked_at - step.unblanked_at).as_secs_f64();
        assert!(blind >= 0.425 + exposure - EPSILON, "unblanked after {blind} s");
        assert!(open >= exposure + 0.025 - EPSILON, "unblanked for {open} s");
    }

    // Beam time over the whole series is the recording windows and nothing more
    let from = blanking[0].released_at;
    let to = blanking[2].blanked_at;
    let on = mock.unblanked_during(from, to).await.as_secs_f64();
    assert!(on > 3.0 * exposure, "beam on for {on} s");
    assert!(on < 3.0 * (exposure + 0.025) + 0.1, "beam on for {on} s");

    // Every image saw the beam for its whole recording interval
    let fractions: Vec<f64> = mock
        .events()
        .await
        .into_iter()
        .filter_map(|e| match e.kind {
            DeviceEventKind::AcquireFinished { beam_fraction, .. } => Some(beam_fraction),
            _ => None,
        })
        .collect();
    assert_eq!(fractions.len(), 3);
    assert!(fractions.iter().all(|&f| f > 0.95), "{fractions:?}");
}

#[tokio::test]
#[serial]
async fn test_workers_run_on_their_own_threads() {
    let (mock, coordinator) = setup(MockConfig::default());
    let request = AcquisitionRequest::builder("BM-Ceta", 2)
        .exposure_time(0.2)
        .tilt_bounds(vec![0.0, 0.5, 1.0])
        .build();

    coordinator.acquisition_series(&request).await.unwrap();

    let here = std::thread::current().id();
    let events = mock.events().await;
    let unblank_threads: Vec<_> = events
        .iter()
        .filter(|e| e.kind == DeviceEventKind::BeamUnblanked)
        .map(|e| e.thread)
        .collect();
    let tilt_threads: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.kind, DeviceEventKind::TiltStarted { .. }))
        .map(|e| e.thread)
        .collect();
    let acquire_threads: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.kind, DeviceEventKind::AcquireStarted { .. }))
        .map(|e| e.thread)
        .collect();

    assert!(acquire_threads.iter().all(|&t| t == here));
    // Two worker unblanks plus the final flag restore on this thread
    assert!(unblank_threads.iter().filter(|&&t| t != here).count() >= 2);
    assert!(!tilt_threads.is_empty() && tilt_threads.iter().all(|&t| t != here));
    assert_ne!(unblank_threads[0], tilt_threads[0]);
}

#[tokio::test]
#[serial]
async fn test_acquire_failure_restores_flags() {
    let (mock, coordinator) = setup(MockConfig {
        fail_acquire_at: Some(1),
        ..MockConfig::default()
    });
    let request = AcquisitionRequest::builder("BM-Ceta", 3)
        .exposure_time(0.3)
        .tilt_bounds(vec![0.0, 0.5, 1.0, 1.5])
        .build();

    let started = Instant::now();
    let err = coordinator.acquisition_series(&request).await.unwrap_err();

    assert!(matches!(err, DaqError::Device(_)));
    assert!(started.elapsed() < Duration::from_secs(10));
    // Initial flags: unblanked, valve closed, screen inserted
    assert!(!mock.beam_blanked().await);
    assert_eq!(mock.valve().await, ValvePosition::Closed);
    assert_eq!(mock.screen().await, ScreenPosition::Inserted);
    assert_eq!(mock.live_connections(), 0);
}

#[tokio::test]
#[serial]
async fn test_cancellation_leaves_instrument_safe() {
    let (mock, coordinator) = setup(MockConfig::default());
    let request = AcquisitionRequest::builder("BM-Ceta", 10)
        .exposure_time(0.5)
        .close_valve_on_abort(true)
        .build();

    let err = coordinator
        .acquisition_series_until(&request, tokio::time::sleep(Duration::from_millis(1500)))
        .await
        .unwrap_err();

    assert!(matches!(err, DaqError::Cancelled));
    assert!(mock.beam_blanked().await);
    assert_eq!(mock.valve().await, ValvePosition::Closed);
    assert!(mock.acquisitions().await < 10);
    assert_eq!(mock.live_connections(), 0);
}

#[tokio::test]
#[serial]
async fn test_cancellation_can_leave_valve_open() {
    let (mock, coordinator) = setup(MockConfig::default());
    let request = AcquisitionRequest::builder("BM-Ceta", 10)
        .exposure_time(0.5)
        .close_valve_on_abort(false)
        .build();

    let err = coordinator
        .acquisition_series_until(&request, tokio::time::sleep(Duration::from_millis(800)))
        .await
        .unwrap_err();

    assert!(matches!(err, DaqError::Cancelled));
    assert!(mock.beam_blanked().await);
    assert_eq!(mock.valve().await, ValvePosition::Open);
}

#[tokio::test]
#[serial]
async fn test_single_acquisition_with_tilt() {
    let (mock, coordinator) = setup(MockConfig::default());

    let options = SingleAcquisitionOptions {
        tilt_destination: Some(1.0),
        ..SingleAcquisitionOptions::default()
    };
    let acquisition = coordinator
        .acquisition("BM-Ceta", 0.3, Sampling::Eighth, options)
        .await
        .unwrap();

    assert_eq!(acquisition.image.shape(), (64, 64));
    assert!((mock.alpha().await - 1.0).abs() < 1e-9);
    assert_eq!(mock.live_connections(), 0);
    // Start-angle query, coordinator, blanking and tilting workers
    assert_eq!(mock.connections_opened(), 4);
    let unblanks = mock
        .events()
        .await
        .into_iter()
        .filter(|e| e.kind == DeviceEventKind::BeamUnblanked)
        .count();
    assert!(unblanks >= 1);
}
