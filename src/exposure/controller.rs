//! Public exposure entry point.
//!
//! The controller accepts at most one exposure at a time. `start_exposure`
//! validates synchronously and returns as soon as the worker task has been
//! spawned; the result arrives through the completion callback.

use super::worker::AcquisitionWorker;
use super::{
    BlinkConfig, CancelFlag, ExposureCallback, ExposureOutcome, ExposureRequest, ExposureState,
    FrameKind,
};
use crate::config::{EngineConfig, ExposureConfig};
use crate::error::{EngineError, EngineResult};
use crate::error_recovery::RetryPolicy;
use crate::frame::{Binning, FrameBufferManager, FrameConsumer, FrameGeometry, PixelFormat, Roi};
use crate::hardware::CameraHardware;
use crate::observable::Observable;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered state transitions per subscriber.
const TRANSITION_CAPACITY: usize = 32;

/// State shared between the controller and its worker.
pub(crate) struct ExposureShared {
    inner: Mutex<Inner>,
    state: Observable<ExposureState>,
    transitions: broadcast::Sender<ExposureState>,
    time_left: Observable<f64>,
}

#[derive(Default)]
struct Inner {
    state: ExposureState,
    active: Option<ActiveExposure>,
    restarts: u32,
    last_error: Option<String>,
    next_id: u64,
}

struct ActiveExposure {
    id: u64,
    cancel: CancelFlag,
    handle: Option<JoinHandle<()>>,
}

impl ExposureShared {
    pub(crate) fn new() -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            state: Observable::new("exposure_state", ExposureState::Idle),
            transitions,
            time_left: Observable::new("exposure_time_left", 0.0).with_units("s"),
        }
    }

    fn set_state_locked(&self, inner: &mut Inner, state: ExposureState) {
        if inner.state != state {
            inner.state = state;
            // No subscribers is fine.
            let _ = self.transitions.send(state);
        }
        self.state.set_if_changed(state);
    }

    pub(crate) fn set_state(&self, state: ExposureState) {
        let mut inner = self.inner.lock();
        self.set_state_locked(&mut inner, state);
    }

    pub(crate) fn subscribe_transitions(&self) -> broadcast::Receiver<ExposureState> {
        self.transitions.subscribe()
    }

    pub(crate) fn time_left(&self) -> &Observable<f64> {
        &self.time_left
    }

    /// Count one exposure restart, returning the new total.
    pub(crate) fn record_restart(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.restarts += 1;
        inner.restarts
    }

    /// Commit the terminal state of `request` and return the outcome to deliver.
    ///
    /// A cancellation observed here overrides any other result, so an abort
    /// racing with a successful readout never delivers the frame. Once a frame
    /// is committed, later aborts are ignored.
    pub(crate) fn commit(&self, request: &ExposureRequest, outcome: ExposureOutcome) -> ExposureOutcome {
        let mut inner = self.inner.lock();
        let outcome = if request.cancel.is_cancelled() {
            ExposureOutcome::Aborted
        } else {
            outcome
        };

        inner.last_error = match &outcome {
            ExposureOutcome::Failed(e) => Some(e.to_string()),
            _ => None,
        };
        self.set_state_locked(&mut inner, outcome.state());
        outcome
    }

    /// Return to `Idle` after [`commit`](Self::commit) and the hardware cleanup.
    pub(crate) fn release(&self, request: &ExposureRequest) {
        let mut inner = self.inner.lock();
        self.set_state_locked(&mut inner, ExposureState::Idle);
        if inner.active.as_ref().map(|a| a.id) == Some(request.id) {
            inner.active = None;
        }
    }
}

/// Owns the exposure state machine of one camera.
pub struct ExposureController {
    hardware: Arc<dyn CameraHardware>,
    frames: Arc<Mutex<FrameBufferManager>>,
    shared: Arc<ExposureShared>,
    config: ExposureConfig,
    retry: RetryPolicy,
    runtime: Handle,
    callback: Mutex<Option<ExposureCallback>>,
    consumer: Mutex<FrameConsumer>,
    blink: Mutex<BlinkConfig>,
}

impl ExposureController {
    /// Create a controller bound to the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Configuration` when called outside a runtime.
    pub fn new(
        hardware: Arc<dyn CameraHardware>,
        frames: FrameBufferManager,
        config: &EngineConfig,
    ) -> EngineResult<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            EngineError::Configuration(format!("exposure controller needs a tokio runtime: {e}"))
        })?;
        Ok(Self {
            hardware,
            frames: Arc::new(Mutex::new(frames)),
            shared: Arc::new(ExposureShared::new()),
            config: config.exposure.clone(),
            retry: RetryPolicy::from(&config.retry),
            runtime,
            callback: Mutex::new(None),
            consumer: Mutex::new(FrameConsumer::Still),
            blink: Mutex::new(config.exposure.blink.clone()),
        })
    }

    /// Register the completion callback.
    ///
    /// The callback runs on the worker task, after the controller is back in
    /// `Idle`, so it may start the next exposure. Exposures accepted before the
    /// callback was replaced report to the callback current at their start.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: Fn(ExposureOutcome) + Send + Sync + 'static,
    {
        *self.callback.lock() = Some(Arc::new(callback));
    }

    /// Start an exposure of `duration_s` seconds.
    ///
    /// Returns once the worker is spawned. Fails with `BadRequest` for a
    /// negative or non-finite duration and `Busy` while another exposure is active.
    pub fn start_exposure(&self, duration_s: f64, frame_kind: FrameKind) -> EngineResult<()> {
        if !duration_s.is_finite() || duration_s < 0.0 {
            return Err(EngineError::BadRequest(format!(
                "exposure duration must be a non-negative number of seconds, got {duration_s}"
            )));
        }
        let duration = Duration::try_from_secs_f64(duration_s)
            .map_err(|e| EngineError::BadRequest(format!("exposure duration {duration_s}: {e}")))?;

        let mut inner = self.shared.inner.lock();
        if !inner.state.is_idle() {
            return Err(EngineError::Busy);
        }

        inner.next_id += 1;
        inner.restarts = 0;
        inner.last_error = None;
        let request = ExposureRequest {
            id: inner.next_id,
            duration,
            frame_kind,
            cancel: CancelFlag::new(),
        };

        if duration >= self.config.verbose_threshold {
            info!(duration_s, ?frame_kind, "Taking a {} s frame", duration_s);
        } else {
            debug!(duration_s, ?frame_kind, "Taking frame");
        }

        self.shared.set_state_locked(&mut inner, ExposureState::Starting);
        self.shared.time_left.set(duration_s);

        let worker = AcquisitionWorker {
            hardware: self.hardware.clone(),
            frames: self.frames.clone(),
            shared: self.shared.clone(),
            config: self.config.clone(),
            retry: self.retry.clone(),
            blink: self.blink.lock().clone(),
            consumer: *self.consumer.lock(),
            callback: self.callback.lock().clone(),
            request: request.clone(),
        };
        let handle = self.runtime.spawn(worker.run());
        inner.active = Some(ActiveExposure {
            id: request.id,
            cancel: request.cancel,
            handle: Some(handle),
        });
        Ok(())
    }

    /// Abort the active exposure, if any.
    ///
    /// Always succeeds. The worker stops the hardware within one poll interval
    /// and reports `ExposureOutcome::Aborted`; no frame is delivered.
    pub fn abort_exposure(&self) -> bool {
        let inner = self.shared.inner.lock();
        if inner.state.is_terminal() {
            debug!(state = %inner.state, "Exposure already finished, nothing to abort");
            return true;
        }
        if let Some(active) = &inner.active {
            if !active.cancel.is_cancelled() {
                info!(exposure_id = active.id, "Aborting exposure");
                active.cancel.cancel();
            }
        }
        true
    }

    /// Abort any active exposure and wait for its worker to finish.
    pub async fn shutdown(&self) {
        let handle = {
            let mut inner = self.shared.inner.lock();
            inner.active.as_mut().and_then(|active| {
                active.cancel.cancel();
                active.handle.take()
            })
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Acquisition worker ended abnormally");
            }
        }
    }

    /// Current exposure state.
    pub fn state(&self) -> ExposureState {
        self.shared.inner.lock().state
    }

    /// Latest exposure state.
    ///
    /// Holds only the most recent value, so short-lived states such as
    /// `Failed` are usually replaced by `Idle` before a watcher wakes. Use
    /// [`subscribe_states`](Self::subscribe_states) to see every transition.
    pub fn state_observable(&self) -> &Observable<ExposureState> {
        &self.shared.state
    }

    /// Receive every state transition, terminal states included.
    pub fn subscribe_states(&self) -> broadcast::Receiver<ExposureState> {
        self.shared.subscribe_transitions()
    }

    /// Published countdown in seconds; non-increasing within one exposure.
    pub fn time_left(&self) -> &Observable<f64> {
        &self.shared.time_left
    }

    /// Restarts performed by the current (or last) exposure.
    pub fn restart_count(&self) -> u32 {
        self.shared.inner.lock().restarts
    }

    /// Error of the last failed exposure, cleared by the next start.
    pub fn last_error(&self) -> Option<String> {
        self.shared.inner.lock().last_error.clone()
    }

    /// Current readout geometry.
    pub fn geometry(&self) -> FrameGeometry {
        self.frames.lock().geometry()
    }

    /// Bytes in one frame of the current geometry.
    pub fn frame_bytes(&self) -> usize {
        self.frames.lock().frame_bytes()
    }

    /// Request a ROI in unbinned sensor pixels; returns the applied binned ROI.
    pub fn set_roi(&self, roi: Roi) -> EngineResult<Roi> {
        let _inner = self.idle_guard()?;
        self.frames.lock().set_roi(roi)
    }

    /// Change binning; returns the applied binned ROI.
    pub fn set_binning(&self, binning: Binning) -> EngineResult<Roi> {
        let _inner = self.idle_guard()?;
        self.frames.lock().set_binning(binning)
    }

    /// Change the pixel format of delivered frames.
    pub fn set_pixel_format(&self, format: PixelFormat) -> EngineResult<()> {
        let _inner = self.idle_guard()?;
        self.frames.lock().set_format(format)
    }

    /// Choose the colour plane order of delivered frames.
    pub fn set_consumer(&self, consumer: FrameConsumer) -> EngineResult<()> {
        let _inner = self.idle_guard()?;
        *self.consumer.lock() = consumer;
        Ok(())
    }

    /// Configure dark pre-flash exposures.
    pub fn set_blink(&self, blink: BlinkConfig) -> EngineResult<()> {
        let _inner = self.idle_guard()?;
        *self.blink.lock() = blink;
        Ok(())
    }

    fn idle_guard(&self) -> EngineResult<parking_lot::MutexGuard<'_, Inner>> {
        let inner = self.shared.inner.lock();
        if inner.state.is_idle() {
            Ok(inner)
        } else {
            Err(EngineError::Busy)
        }
    }
}

impl Drop for ExposureController {
    fn drop(&mut self) {
        if let Some(active) = &self.shared.inner.lock().active {
            active.cancel.cancel();
        }
    }
}
