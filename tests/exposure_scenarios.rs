//! End-to-end exposure scenarios against the mock camera, on paused time.

use exposure_engine::config::EngineConfig;
use exposure_engine::error::EngineError;
use exposure_engine::exposure::{BlinkConfig, ExposureOutcome, ExposureState, FrameKind};
use exposure_engine::frame::{FrameConsumer, PixelFormat};
use exposure_engine::hardware::mock::{HardwareCall, MockCamera, MOCK_BGR};
use exposure_engine::hardware::{ExposureStatus, SensorInfo};
use exposure_engine::session::CameraSession;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

/// Connect a session to a fresh mock camera and capture outcomes on a channel.
async fn connect(
    sensor: SensorInfo,
) -> (
    Arc<MockCamera>,
    CameraSession,
    mpsc::UnboundedReceiver<ExposureOutcome>,
) {
    let camera = Arc::new(MockCamera::new(WIDTH, HEIGHT));
    let session = CameraSession::connect(camera.clone(), sensor, EngineConfig::default())
        .await
        .unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    session.controller().on_complete(move |outcome| {
        let _ = tx.send(outcome);
    });
    (camera, session, rx)
}

async fn connect_mono() -> (
    Arc<MockCamera>,
    CameraSession,
    mpsc::UnboundedReceiver<ExposureOutcome>,
) {
    connect(SensorInfo::mono(WIDTH, HEIGHT)).await
}

#[tokio::test(start_paused = true)]
async fn test_countdown_reaches_zero_and_frame_is_full_size() {
    let (_camera, session, mut rx) = connect_mono().await;

    let observed = Arc::new(Mutex::new(Vec::new()));
    let mut countdown = session.controller().time_left().subscribe();
    countdown.borrow_and_update();
    let collector = {
        let observed = observed.clone();
        tokio::spawn(async move {
            while countdown.changed().await.is_ok() {
                let value = *countdown.borrow_and_update();
                observed.lock().push(value);
            }
        })
    };

    session.start_exposure(2.5, FrameKind::Light).unwrap();
    let outcome = rx.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    collector.abort();

    let frame = match outcome {
        ExposureOutcome::Complete(frame) => frame,
        other => panic!("expected a frame, got {:?}", other.state()),
    };
    assert_eq!(frame.len(), (WIDTH * HEIGHT) as usize * 2);
    assert_eq!(frame.metadata.restarts, 0);
    assert_eq!(session.controller().state(), ExposureState::Idle);

    let values = observed.lock().clone();
    assert_eq!(values.first(), Some(&2.5));
    assert_eq!(values.last(), Some(&0.0));
    assert!(values.contains(&2.0), "countdown {:?}", values);
    assert!(
        values.iter().any(|v| (v - 1.0).abs() < 0.01),
        "countdown {:?}",
        values
    );
    assert!(
        values.windows(2).all(|w| w[1] <= w[0]),
        "countdown not monotonic: {:?}",
        values
    );
}

#[tokio::test(start_paused = true)]
async fn test_two_transient_failures_restart_twice() {
    let (camera, session, mut rx) = connect_mono().await;
    camera.script_statuses([ExposureStatus::Failed, ExposureStatus::Failed]);

    let start = Instant::now();
    session.start_exposure(5.0, FrameKind::Light).unwrap();
    let outcome = rx.recv().await.unwrap();

    match outcome {
        ExposureOutcome::Complete(frame) => assert_eq!(frame.metadata.restarts, 2),
        other => panic!("expected a frame, got {:?}", other.state()),
    }
    // Each restart runs the full duration again.
    assert!(start.elapsed() >= Duration::from_secs(15));
    assert_eq!(camera.call_count(HardwareCall::StartExposure), 3);
    assert_eq!(session.controller().restart_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failure_on_every_poll_restarts_exactly_three_times() {
    let (camera, session, mut rx) = connect_mono().await;
    camera.always_fail_exposures(true);

    session.start_exposure(1.0, FrameKind::Light).unwrap();
    let outcome = rx.recv().await.unwrap();

    assert!(matches!(
        outcome,
        ExposureOutcome::Failed(EngineError::FatalHardware(_))
    ));
    assert_eq!(session.controller().restart_count(), 3);
    assert_eq!(camera.call_count(HardwareCall::StartExposure), 4);
    assert!(camera.call_count(HardwareCall::StopExposure) >= 1);
    assert_eq!(session.controller().state(), ExposureState::Idle);
    assert!(session.controller().last_error().is_some());

    // Ready for the next exposure.
    camera.always_fail_exposures(false);
    session.start_exposure(0.1, FrameKind::Light).unwrap();
    assert!(rx.recv().await.unwrap().is_complete());
}

#[tokio::test(start_paused = true)]
async fn test_abort_mid_exposure() {
    let (camera, session, mut rx) = connect_mono().await;

    session.start_exposure(10.0, FrameKind::Light).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(session.controller().state(), ExposureState::Exposing);

    let aborted_at = Instant::now();
    assert!(session.abort_exposure());
    let outcome = rx.recv().await.unwrap();

    assert!(matches!(outcome, ExposureOutcome::Aborted));
    assert!(aborted_at.elapsed() <= Duration::from_millis(100));
    assert_eq!(camera.call_count(HardwareCall::StopExposure), 1);
    assert_eq!(camera.call_count(HardwareCall::ReadFrame), 0);
    assert_eq!(session.controller().state(), ExposureState::Idle);
    assert!(session.controller().last_error().is_none());

    // No second outcome for the aborted cycle.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_abort_without_exposure_is_idempotent() {
    let (camera, session, mut rx) = connect_mono().await;

    assert!(session.abort_exposure());
    assert!(session.abort_exposure());
    assert_eq!(camera.call_count(HardwareCall::StopExposure), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_start_failure_is_not_restarted() {
    let (camera, session, mut rx) = connect_mono().await;
    camera.fail_next_starts(3);

    session.start_exposure(1.0, FrameKind::Dark).unwrap();
    let outcome = rx.recv().await.unwrap();

    assert!(matches!(
        outcome,
        ExposureOutcome::Failed(EngineError::FatalHardware(_))
    ));
    assert_eq!(camera.call_count(HardwareCall::StartExposure), 3);
    assert_eq!(session.controller().restart_count(), 0);
    assert_eq!(camera.last_start(), Some((1_000_000, true)));
}

#[tokio::test(start_paused = true)]
async fn test_status_timeouts_within_bound_are_tolerated() {
    let (camera, session, mut rx) = connect_mono().await;
    camera.fail_next_status_polls(5);

    session.start_exposure(1.0, FrameKind::Light).unwrap();
    assert!(rx.recv().await.unwrap().is_complete());
    assert_eq!(session.controller().restart_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_status_timeouts_are_fatal() {
    let (camera, session, mut rx) = connect_mono().await;
    camera.fail_next_status_polls(100);

    session.start_exposure(1.0, FrameKind::Light).unwrap();
    let outcome = rx.recv().await.unwrap();

    assert!(matches!(
        outcome,
        ExposureOutcome::Failed(EngineError::FatalHardware(_))
    ));
    assert_eq!(camera.call_count(HardwareCall::ExposureStatus), 10);
    assert_eq!(camera.call_count(HardwareCall::StartExposure), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lost_exposure_is_fatal() {
    let (camera, session, mut rx) = connect_mono().await;
    camera.script_statuses([ExposureStatus::Idle]);

    session.start_exposure(0.5, FrameKind::Light).unwrap();
    match rx.recv().await.unwrap() {
        ExposureOutcome::Failed(EngineError::FatalHardware(msg)) => assert!(msg.contains("lost")),
        other => panic!("expected a fatal failure, got {:?}", other.state()),
    }
    assert_eq!(camera.call_count(HardwareCall::StartExposure), 1);
}

#[tokio::test(start_paused = true)]
async fn test_download_failure_stops_hardware() {
    let (camera, session, mut rx) = connect_mono().await;
    camera.fail_next_reads(1);

    session.start_exposure(0.5, FrameKind::Light).unwrap();
    assert!(matches!(
        rx.recv().await.unwrap(),
        ExposureOutcome::Failed(EngineError::FatalHardware(_))
    ));
    assert_eq!(camera.call_count(HardwareCall::StopExposure), 1);
}

#[tokio::test(start_paused = true)]
async fn test_geometry_programmed_once() {
    let (camera, session, mut rx) = connect_mono().await;

    session.start_exposure(0.1, FrameKind::Light).unwrap();
    rx.recv().await.unwrap();
    session.start_exposure(0.1, FrameKind::Light).unwrap();
    rx.recv().await.unwrap();
    assert_eq!(camera.call_count(HardwareCall::SetFrameFormat), 1);

    let applied = session
        .controller()
        .set_roi(exposure_engine::frame::Roi {
            x: 10,
            y: 10,
            width: 100,
            height: 51,
        })
        .unwrap();
    session.start_exposure(0.1, FrameKind::Light).unwrap();
    match rx.recv().await.unwrap() {
        ExposureOutcome::Complete(frame) => {
            assert_eq!(frame.len(), (applied.width * applied.height) as usize * 2);
            assert_eq!(frame.metadata.geometry.roi, applied);
        }
        other => panic!("expected a frame, got {:?}", other.state()),
    }
    assert_eq!(camera.call_count(HardwareCall::SetFrameFormat), 2);
    assert_eq!(camera.frame_format().0, applied);
}

#[tokio::test(start_paused = true)]
async fn test_colour_frames_are_planar() {
    let (_camera, session, mut rx) = connect(SensorInfo::color(WIDTH, HEIGHT)).await;
    let controller = session.controller();
    controller.set_pixel_format(PixelFormat::Rgb24).unwrap();
    let plane = (WIDTH * HEIGHT) as usize;

    controller.start_exposure(0.2, FrameKind::Light).unwrap();
    let still = match rx.recv().await.unwrap() {
        ExposureOutcome::Complete(frame) => frame,
        other => panic!("expected a frame, got {:?}", other.state()),
    };
    assert_eq!(still.len(), plane * 3);
    assert!(still.metadata.planar);
    assert!(!still.metadata.bayer);
    // Still frames come out as R, G, B planes.
    assert!(still.data[..plane].iter().all(|&v| v == MOCK_BGR[2]));
    assert!(still.data[plane..2 * plane].iter().all(|&v| v == MOCK_BGR[1]));
    assert!(still.data[2 * plane..].iter().all(|&v| v == MOCK_BGR[0]));

    controller.set_consumer(FrameConsumer::Streaming).unwrap();
    controller.start_exposure(0.2, FrameKind::Light).unwrap();
    let streaming = match rx.recv().await.unwrap() {
        ExposureOutcome::Complete(frame) => frame,
        other => panic!("expected a frame, got {:?}", other.state()),
    };
    assert!(streaming.data[..plane].iter().all(|&v| v == MOCK_BGR[0]));
}

#[tokio::test(start_paused = true)]
async fn test_blink_exposures_precede_main_exposure() {
    let (camera, session, mut rx) = connect_mono().await;
    session
        .controller()
        .set_blink(BlinkConfig {
            count: 2,
            duration: Duration::from_millis(100),
        })
        .unwrap();

    session.start_exposure(1.0, FrameKind::Light).unwrap();
    assert!(rx.recv().await.unwrap().is_complete());
    assert_eq!(camera.call_count(HardwareCall::StartExposure), 3);
    assert_eq!(camera.call_count(HardwareCall::ReadFrame), 1);
    assert_eq!(camera.last_start(), Some((1_000_000, false)));
}

#[tokio::test(start_paused = true)]
async fn test_blink_failure_skips_remaining_blinks() {
    let (camera, session, mut rx) = connect_mono().await;
    camera.script_statuses([ExposureStatus::Failed]);
    session
        .controller()
        .set_blink(BlinkConfig {
            count: 3,
            duration: Duration::from_millis(100),
        })
        .unwrap();

    session.start_exposure(1.0, FrameKind::Light).unwrap();
    assert!(rx.recv().await.unwrap().is_complete());
    // One failed blink, then the main exposure.
    assert_eq!(camera.call_count(HardwareCall::StartExposure), 2);
    assert_eq!(session.controller().restart_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_download_is_prompt() {
    let (camera, session, mut rx) = connect_mono().await;
    camera.set_readout_delay(Duration::from_secs(8));

    session.start_exposure(0.5, FrameKind::Light).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(session.controller().state(), ExposureState::Downloading);

    let aborted_at = Instant::now();
    assert!(session.abort_exposure());
    let outcome = rx.recv().await.unwrap();

    assert!(matches!(outcome, ExposureOutcome::Aborted));
    assert!(aborted_at.elapsed() <= Duration::from_millis(100));
    assert_eq!(camera.call_count(HardwareCall::StopExposure), 1);
    assert_eq!(session.controller().state(), ExposureState::Idle);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_download_over_buffer_memory_fails_without_frame() {
    let camera = Arc::new(MockCamera::new(WIDTH, HEIGHT));
    let mut config = EngineConfig::default();
    // Room for the raw readout but not its planar copy.
    config.sensor.buffer_memory = (WIDTH * HEIGHT * 3) as usize;
    let session =
        CameraSession::connect(camera.clone(), SensorInfo::color(WIDTH, HEIGHT), config)
            .await
            .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.controller().on_complete(move |outcome| {
        let _ = tx.send(outcome);
    });
    session.controller().set_pixel_format(PixelFormat::Rgb24).unwrap();

    session.start_exposure(0.5, FrameKind::Light).unwrap();
    match rx.recv().await.unwrap() {
        ExposureOutcome::Failed(EngineError::OutOfMemory { bytes }) => {
            assert_eq!(bytes, (WIDTH * HEIGHT * 3 * 2) as usize);
        }
        other => panic!("expected out of memory, got {:?}", other.state()),
    }
    assert_eq!(camera.call_count(HardwareCall::ReadFrame), 0);
    assert_eq!(camera.call_count(HardwareCall::StopExposure), 1);
    assert!(!camera.is_exposing());
    assert!(session.controller().last_error().is_some());
    assert_eq!(session.controller().state(), ExposureState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_state_subscribers_see_every_transition() {
    let (camera, session, mut rx) = connect_mono().await;
    camera.always_fail_exposures(true);
    let mut states = session.controller().subscribe_states();

    session.start_exposure(1.0, FrameKind::Light).unwrap();
    assert!(matches!(rx.recv().await.unwrap(), ExposureOutcome::Failed(_)));

    let mut seen = Vec::new();
    while let Ok(state) = states.try_recv() {
        seen.push(state);
    }
    use ExposureState::*;
    assert_eq!(
        seen,
        vec![
            Starting, Exposing, Retry, Exposing, Retry, Exposing, Retry, Exposing, Failed, Idle
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejected_status_query_is_fatal() {
    let (camera, session, mut rx) = connect_mono().await;
    camera.reject_next_status_polls(1);

    session.start_exposure(0.5, FrameKind::Light).unwrap();
    match rx.recv().await.unwrap() {
        ExposureOutcome::Failed(EngineError::FatalHardware(msg)) => {
            assert!(msg.contains("status query failed"), "{msg}");
        }
        other => panic!("expected a fatal failure, got {:?}", other.state()),
    }
    assert_eq!(camera.call_count(HardwareCall::ExposureStatus), 1);
    assert_eq!(camera.call_count(HardwareCall::StopExposure), 1);
    assert_eq!(session.controller().restart_count(), 0);
}
