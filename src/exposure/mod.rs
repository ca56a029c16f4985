//! Exposure state machine types.
//!
//! [`ExposureController`] is the public entry point. It validates a request,
//! spawns one [`AcquisitionWorker`](worker::AcquisitionWorker) task per accepted
//! exposure and reports the result through a single completion callback.
//!
//! ```text
//! Idle -> Starting -> Exposing -> Downloading -> Complete -> Idle
//!                     Exposing -> Retry -> Exposing        (transient fault, bounded)
//!         {Starting, Exposing, Downloading} -> Aborted -> Idle
//!         {Starting, Exposing, Downloading} -> Failed  -> Idle
//! ```

pub mod controller;
pub mod worker;

pub use controller::ExposureController;

use crate::error::EngineError;
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// What the frame is used for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// Shutter open, sky frame.
    #[default]
    Light,
    /// Shutter closed, same duration as the lights.
    Dark,
    /// Shutter closed, shortest possible duration.
    Bias,
    /// Evenly illuminated calibration frame.
    Flat,
}

impl FrameKind {
    /// Dark and bias frames keep the shutter closed.
    pub fn is_dark(&self) -> bool {
        matches!(self, FrameKind::Dark | FrameKind::Bias)
    }
}

/// Exposure state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExposureState {
    /// Ready for a new exposure.
    #[default]
    Idle,
    /// Accepted; the start command is being sent.
    Starting,
    /// The sensor is integrating.
    Exposing,
    /// A transient fault was detected; the exposure is being restarted.
    Retry,
    /// The frame is being read back.
    Downloading,
    /// The frame was delivered.
    Complete,
    /// The caller aborted the exposure.
    Aborted,
    /// The exposure failed; the hardware was stopped.
    Failed,
}

impl ExposureState {
    /// Whether a new exposure may be started.
    pub fn is_idle(&self) -> bool {
        matches!(self, ExposureState::Idle)
    }

    /// Whether the outcome of the exposure has been committed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExposureState::Complete | ExposureState::Aborted | ExposureState::Failed
        )
    }
}

impl fmt::Display for ExposureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Dark pre-flash exposures run before every frame.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlinkConfig {
    /// Number of blink exposures; zero disables blinking.
    pub count: u32,
    /// Duration of each blink exposure.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl BlinkConfig {
    /// Whether any blinks run before the main exposure.
    pub fn is_enabled(&self) -> bool {
        self.count > 0
    }
}

/// Cooperative cancellation shared by the controller and one worker.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    /// A flag that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake any waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// One accepted exposure.
#[derive(Clone, Debug)]
pub struct ExposureRequest {
    /// Sequence number, unique per controller.
    pub id: u64,
    /// Requested integration time.
    pub duration: Duration,
    /// Shutter handling and labelling of the frame.
    pub frame_kind: FrameKind,
    /// Set by `abort_exposure`, observed by the worker.
    pub cancel: CancelFlag,
}

/// Final result of one accepted exposure, delivered exactly once.
#[derive(Debug)]
pub enum ExposureOutcome {
    /// The full frame was read back.
    Complete(Frame),
    /// The exposure failed; the hardware has been stopped.
    Failed(EngineError),
    /// The exposure was aborted by the caller.
    Aborted,
}

impl ExposureOutcome {
    /// Terminal state matching this outcome.
    pub fn state(&self) -> ExposureState {
        match self {
            ExposureOutcome::Complete(_) => ExposureState::Complete,
            ExposureOutcome::Failed(_) => ExposureState::Failed,
            ExposureOutcome::Aborted => ExposureState::Aborted,
        }
    }

    /// Whether a frame is delivered.
    pub fn is_complete(&self) -> bool {
        matches!(self, ExposureOutcome::Complete(_))
    }
}

/// Completion callback invoked from the worker task.
pub type ExposureCallback = Arc<dyn Fn(ExposureOutcome) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dark_frame_kinds() {
        assert!(FrameKind::Dark.is_dark());
        assert!(FrameKind::Bias.is_dark());
        assert!(!FrameKind::Light.is_dark());
        assert!(!FrameKind::Flat.is_dark());
    }

    #[tokio::test]
    async fn test_cancel_flag_wakes_waiter() {
        let flag = CancelFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };
        tokio::task::yield_now().await;
        flag.cancel();
        waiter.await.unwrap();
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_before_wait_returns_immediately() {
        let flag = CancelFlag::new();
        flag.cancel();
        flag.cancelled().await;
    }

    #[test]
    fn test_outcome_states() {
        assert_eq!(ExposureOutcome::Aborted.state(), ExposureState::Aborted);
        assert_eq!(
            ExposureOutcome::Failed(EngineError::Busy).state(),
            ExposureState::Failed
        );
    }
}
