//! Background task running one exposure cycle end to end.
//!
//! Cycle:
//! 1. Optional dark blink exposures.
//! 2. Program the readout geometry if it changed since the last exposure.
//! 3. Start the exposure through [`ExposureStart`] (bounded retry).
//! 4. Count down, sleeping to whole-second boundaries while more than the
//!    coarse threshold is left, then in fine steps. Cancellation is checked on
//!    every wake-up.
//! 5. Poll the hardware status. `Failed` restarts the exposure from zero
//!    (bounded), `Idle` means the exposure was lost, repeated communication
//!    errors are fatal.
//! 6. Read the frame into a freshly allocated buffer and normalize it. An abort
//!    interrupts the readout.
//!
//! The outcome is committed first; every outcome other than a delivered frame
//! then issues a hardware stop before the controller returns to `Idle`.

use super::controller::ExposureShared;
use super::{BlinkConfig, ExposureCallback, ExposureOutcome, ExposureRequest, ExposureState};
use crate::config::ExposureConfig;
use crate::error::{EngineError, EngineResult, HardwareError};
use crate::error_recovery::{ExposureStart, RetryPolicy};
use crate::frame::buffer::normalize;
use crate::frame::{Frame, FrameBufferManager, FrameConsumer};
use crate::hardware::{CameraHardware, ExposureStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Result of waiting out one exposure attempt.
enum AttemptResult {
    /// Hardware reports the frame is ready.
    Ready,
    /// Hardware reports a failed exposure; a restart may help.
    Transient(String),
}

/// Sleep before the next countdown update.
///
/// Above `coarse_threshold` the delay lands on the next whole-second boundary
/// of the time left, a full second when it already sits on one; below it the
/// countdown advances in `fine_poll` steps. Never shorter than `min_sleep`.
pub fn countdown_delay(time_left: Duration, config: &ExposureConfig) -> Duration {
    let delay = if time_left > config.coarse_threshold {
        match time_left.subsec_nanos() {
            0 => Duration::from_secs(1),
            nanos => Duration::from_nanos(u64::from(nanos)),
        }
    } else {
        time_left.min(config.fine_poll)
    };
    delay.max(config.min_sleep)
}

/// Countdown value to publish for `time_left`.
///
/// Whole seconds above the coarse threshold, the exact value below it, and
/// never more than the previously published value.
pub fn countdown_value(time_left: Duration, config: &ExposureConfig, previous: f64) -> f64 {
    let value = if time_left > config.coarse_threshold {
        time_left.as_secs_f64().round()
    } else {
        time_left.as_secs_f64()
    };
    value.min(previous)
}

pub(crate) struct AcquisitionWorker {
    pub(crate) hardware: Arc<dyn CameraHardware>,
    pub(crate) frames: Arc<Mutex<FrameBufferManager>>,
    pub(crate) shared: Arc<ExposureShared>,
    pub(crate) config: ExposureConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) blink: BlinkConfig,
    pub(crate) consumer: FrameConsumer,
    pub(crate) callback: Option<ExposureCallback>,
    pub(crate) request: ExposureRequest,
}

impl AcquisitionWorker {
    /// Run the cycle and deliver the outcome exactly once.
    pub(crate) async fn run(self) {
        let outcome = match self.acquire().await {
            Ok(frame) => ExposureOutcome::Complete(frame),
            Err(EngineError::Cancelled) => ExposureOutcome::Aborted,
            Err(e) => ExposureOutcome::Failed(e),
        };
        self.deliver(outcome).await;
    }

    /// Commit `outcome`, stop the hardware unless a frame is delivered, then
    /// return to `Idle` and invoke the callback.
    pub(crate) async fn deliver(&self, outcome: ExposureOutcome) {
        let outcome = self.shared.commit(&self.request, outcome);
        if !outcome.is_complete() {
            if let Err(e) = self.hardware.stop_exposure().await {
                warn!(error = %e, "Failed to stop exposure");
            }
        }
        self.shared.release(&self.request);

        match &outcome {
            ExposureOutcome::Complete(frame) => {
                if self.is_verbose() {
                    info!(bytes = frame.len(), "Download complete");
                } else {
                    debug!(bytes = frame.len(), "Download complete");
                }
            }
            ExposureOutcome::Failed(e) => warn!(error = %e, "Exposure failed"),
            ExposureOutcome::Aborted => info!("Exposure aborted"),
        }

        match &self.callback {
            Some(callback) => callback(outcome),
            None => debug!("No completion callback registered"),
        }
    }

    fn is_verbose(&self) -> bool {
        self.request.duration >= self.config.verbose_threshold
    }

    fn check_cancel(&self) -> EngineResult<()> {
        if self.request.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `delay`, returning early with `Cancelled` on abort.
    async fn sleep_or_cancel(&self, delay: Duration) -> EngineResult<()> {
        tokio::select! {
            _ = sleep(delay) => self.check_cancel(),
            _ = self.request.cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }

    async fn acquire(&self) -> EngineResult<Frame> {
        if self.blink.is_enabled() {
            self.run_blinks().await?;
        }
        self.program_geometry().await?;

        let max_restarts = self.config.max_restarts;
        let mut restarts = 0;
        loop {
            self.check_cancel()?;
            ExposureStart::new(
                self.hardware.as_ref(),
                self.request.duration,
                self.request.frame_kind.is_dark(),
            )
            .run(&self.retry)
            .await?;
            self.check_cancel()?;
            self.shared.set_state(ExposureState::Exposing);

            match self.expose_once().await? {
                AttemptResult::Ready => break,
                AttemptResult::Transient(reason) if restarts < max_restarts => {
                    restarts = self.shared.record_restart();
                    warn!(
                        restart = restarts,
                        max_restarts,
                        reason = %reason,
                        "Exposure failed, restarting"
                    );
                    self.shared.set_state(ExposureState::Retry);
                    if let Err(e) = self.hardware.stop_exposure().await {
                        debug!(error = %e, "Stop before restart failed");
                    }
                }
                AttemptResult::Transient(reason) => {
                    return Err(EngineError::FatalHardware(format!(
                        "exposure failed after {restarts} restarts: {reason}"
                    )));
                }
            }
        }

        self.shared.set_state(ExposureState::Downloading);
        self.download(restarts).await
    }

    async fn program_geometry(&self) -> EngineResult<()> {
        let pending = self.frames.lock().pending_format();
        if let Some(geometry) = pending {
            self.hardware
                .set_frame_format(geometry.roi, geometry.binning, geometry.format)
                .await
                .map_err(|e| {
                    EngineError::FatalHardware(format!("failed to set frame format: {e}"))
                })?;
            self.frames.lock().mark_programmed(geometry);
        }
        Ok(())
    }

    /// Wait out one exposure attempt and classify the hardware status.
    async fn expose_once(&self) -> EngineResult<AttemptResult> {
        let duration = self.request.duration;
        let time_left = self.shared.time_left();
        let start = Instant::now();
        let mut published = duration.as_secs_f64();
        time_left.set(published);

        loop {
            let elapsed = start.elapsed();
            if elapsed >= duration {
                break;
            }
            let left = duration - elapsed;
            self.sleep_or_cancel(countdown_delay(left, &self.config))
                .await?;

            let left = duration.saturating_sub(start.elapsed());
            published = countdown_value(left, &self.config, published);
            time_left.set_if_changed(published);
        }
        time_left.set_if_changed(0.0);

        self.poll_status(Instant::now() + self.config.overrun_grace)
            .await
    }

    async fn poll_status(&self, deadline: Instant) -> EngineResult<AttemptResult> {
        let mut comm_failures = 0;
        loop {
            self.check_cancel()?;
            match self.hardware.exposure_status().await {
                Ok(ExposureStatus::Success) => return Ok(AttemptResult::Ready),
                Ok(ExposureStatus::Failed) => {
                    return Ok(AttemptResult::Transient(
                        "hardware reported a failed exposure".to_string(),
                    ))
                }
                Ok(ExposureStatus::Idle) => {
                    return Err(EngineError::FatalHardware(
                        "exposure lost: camera went idle".to_string(),
                    ))
                }
                Ok(ExposureStatus::Working) => {
                    comm_failures = 0;
                    if Instant::now() >= deadline {
                        return Err(EngineError::FatalHardware(format!(
                            "exposure still running {:?} past its end",
                            self.config.overrun_grace
                        )));
                    }
                }
                Err(e) if e.is_timeout() => {
                    comm_failures += 1;
                    if comm_failures >= self.config.status_comm_retries {
                        return Err(EngineError::FatalHardware(format!(
                            "exposure status unavailable after {comm_failures} attempts: {e}"
                        )));
                    }
                    debug!(attempt = comm_failures, error = %e, "Exposure status query timed out");
                }
                Err(HardwareError::Disconnected) => {
                    return Err(EngineError::FatalHardware(
                        "camera disconnected during exposure".to_string(),
                    ))
                }
                Err(e) => {
                    return Err(EngineError::FatalHardware(format!(
                        "exposure status query failed: {e}"
                    )))
                }
            }
            self.sleep_or_cancel(self.config.fine_poll).await?;
        }
    }

    async fn download(&self, restarts: u32) -> EngineResult<Frame> {
        let mut buffer = self.frames.lock().allocate()?;
        self.check_cancel()?;

        let timeout = self.request.duration + self.config.readout_slack;
        let read = tokio::select! {
            read = self.hardware.read_frame(&mut buffer, timeout) => read,
            _ = self.request.cancel.cancelled() => return Err(EngineError::Cancelled),
        };
        read.map_err(|e| EngineError::FatalHardware(format!("frame download failed: {e}")))?;
        self.check_cancel()?;

        let metadata = self.frames.lock().metadata(
            self.request.frame_kind,
            self.request.duration,
            restarts,
        );
        let data = normalize(buffer, metadata.geometry.format, self.consumer)?;
        Ok(Frame { data, metadata })
    }

    /// Dark pre-flash exposures. Failures are logged and skip the remaining blinks.
    async fn run_blinks(&self) -> EngineResult<()> {
        let count = self.blink.count;
        for done in 0..count {
            self.check_cancel()?;
            match self.blink_once().await {
                Ok(()) => {}
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    warn!(error = %e, not_done = count - done, "Blink exposure failed");
                    if let Err(e) = self.hardware.stop_exposure().await {
                        debug!(error = %e, "Stop after blink failure failed");
                    }
                    return Ok(());
                }
            }
        }
        debug!(count, "Blink exposures done");
        Ok(())
    }

    async fn blink_once(&self) -> EngineResult<()> {
        let duration_us = u64::try_from(self.blink.duration.as_micros()).unwrap_or(u64::MAX);
        self.hardware.start_exposure(duration_us, true).await?;

        let deadline = Instant::now() + self.blink.duration + self.config.overrun_grace;
        loop {
            self.sleep_or_cancel(self.config.fine_poll).await?;
            match self.hardware.exposure_status().await? {
                ExposureStatus::Working if Instant::now() < deadline => {}
                ExposureStatus::Success => return Ok(()),
                status => {
                    return Err(EngineError::TransientHardware(format!(
                        "blink exposure ended with status {status:?}"
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorConfig;
    use crate::exposure::{CancelFlag, FrameKind};
    use crate::hardware::mock::{HardwareCall, MockCamera};
    use crate::hardware::SensorInfo;
    use tokio::sync::mpsc;

    fn config() -> ExposureConfig {
        ExposureConfig::default()
    }

    #[test]
    fn test_coarse_delay_lands_on_whole_seconds() {
        let c = config();
        let delay = countdown_delay(Duration::from_millis(2500), &c);
        assert_eq!(delay, Duration::from_millis(500));

        let delay = countdown_delay(Duration::from_millis(4300), &c);
        assert!((delay.as_secs_f64() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_delay_never_below_minimum() {
        let c = config();
        assert_eq!(countdown_delay(Duration::from_millis(2), &c), c.min_sleep);
        assert_eq!(
            countdown_delay(Duration::from_nanos(2_000_000_001), &c),
            c.min_sleep
        );
    }

    #[test]
    fn test_whole_second_waits_a_full_second() {
        let c = config();
        assert_eq!(countdown_delay(Duration::from_secs(3), &c), Duration::from_secs(1));
        assert_eq!(countdown_delay(Duration::from_secs(2), &c), Duration::from_secs(1));
    }

    #[test]
    fn test_fine_delay_below_threshold() {
        let c = config();
        assert_eq!(countdown_delay(Duration::from_secs(1), &c), c.fine_poll);
        assert_eq!(
            countdown_delay(Duration::from_millis(40), &c),
            Duration::from_millis(40)
        );
    }

    #[test]
    fn test_countdown_value_is_monotonic() {
        let c = config();
        assert_eq!(countdown_value(Duration::from_millis(2000), &c, 2.5), 2.0);
        // 1.5 s rounds up to 2 but may not exceed the last value.
        assert_eq!(countdown_value(Duration::from_millis(1500), &c, 1.7), 1.7);
        assert_eq!(countdown_value(Duration::from_millis(900), &c, 1.0), 0.9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_after_readout_discards_frame_and_stops() {
        let camera = Arc::new(MockCamera::new(64, 32));
        let frames =
            FrameBufferManager::new(SensorInfo::mono(64, 32), &SensorConfig::default()).unwrap();
        let metadata = frames.metadata(FrameKind::Light, Duration::from_secs(1), 0);
        let shared = Arc::new(ExposureShared::new());
        let mut states = shared.subscribe_transitions();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: ExposureCallback = Arc::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        let request = ExposureRequest {
            id: 1,
            duration: Duration::from_secs(1),
            frame_kind: FrameKind::Light,
            cancel: CancelFlag::new(),
        };
        let worker = AcquisitionWorker {
            hardware: camera.clone(),
            frames: Arc::new(Mutex::new(frames)),
            shared: shared.clone(),
            config: config(),
            retry: RetryPolicy::default(),
            blink: BlinkConfig::default(),
            consumer: FrameConsumer::Still,
            callback: Some(callback),
            request: request.clone(),
        };

        // The readout finished, then the abort arrived before the commit.
        request.cancel.cancel();
        let frame = Frame {
            data: vec![0; 64 * 32 * 2],
            metadata,
        };
        worker.deliver(ExposureOutcome::Complete(frame)).await;

        assert!(matches!(rx.try_recv(), Ok(ExposureOutcome::Aborted)));
        assert!(rx.try_recv().is_err());
        assert_eq!(camera.call_count(HardwareCall::StopExposure), 1);
        assert_eq!(states.try_recv().unwrap(), ExposureState::Aborted);
        assert_eq!(states.try_recv().unwrap(), ExposureState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_frame_is_delivered_without_stop() {
        let camera = Arc::new(MockCamera::new(64, 32));
        let frames =
            FrameBufferManager::new(SensorInfo::mono(64, 32), &SensorConfig::default()).unwrap();
        let metadata = frames.metadata(FrameKind::Dark, Duration::from_secs(1), 0);
        let shared = Arc::new(ExposureShared::new());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: ExposureCallback = Arc::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        let worker = AcquisitionWorker {
            hardware: camera.clone(),
            frames: Arc::new(Mutex::new(frames)),
            shared,
            config: config(),
            retry: RetryPolicy::default(),
            blink: BlinkConfig::default(),
            consumer: FrameConsumer::Still,
            callback: Some(callback),
            request: ExposureRequest {
                id: 1,
                duration: Duration::from_secs(1),
                frame_kind: FrameKind::Dark,
                cancel: CancelFlag::new(),
            },
        };
        let frame = Frame {
            data: vec![0; 64 * 32 * 2],
            metadata,
        };
        worker.deliver(ExposureOutcome::Complete(frame)).await;

        assert!(matches!(rx.try_recv(), Ok(ExposureOutcome::Complete(_))));
        assert_eq!(camera.call_count(HardwareCall::StopExposure), 0);
    }
}
