//! ST-4 guide pulse scheduling.
//!
//! One single-shot timer per axis: east/west share the RA timer, north/south
//! share the DE timer. A new pulse on an axis first cancels the pending timer
//! and releases the line it was driving, so pulses on one axis never overlap.
//! When a timer fires the line is released and one [`GuideComplete`] event is
//! broadcast for the axis.
//!
//! Pulses shorter than the sync threshold (1 ms by default) block the calling
//! thread instead of arming a timer.

use crate::config::GuideConfig;
use crate::hardware::{CameraHardware, GuideAxis, GuideDirection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Result of a guide request, mirroring the driver property states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuideState {
    /// Pulse finished synchronously.
    Ok,
    /// Pulse is running; a [`GuideComplete`] event follows.
    Busy,
    /// The pulse could not be issued.
    Alert,
}

/// Emitted once per pulse when its line is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuideComplete {
    /// Axis whose pulse finished.
    pub axis: GuideAxis,
}

struct ActivePulse {
    direction: GuideDirection,
    started: Instant,
    duration: Duration,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct AxisSlot {
    generation: u64,
    active: Option<ActivePulse>,
}

/// Issues timed guide pulses on the camera's guide port.
pub struct GuidePulseScheduler {
    hardware: Arc<dyn CameraHardware>,
    sync_threshold: Duration,
    enabled: bool,
    ra: Arc<Mutex<AxisSlot>>,
    de: Arc<Mutex<AxisSlot>>,
    events: broadcast::Sender<GuideComplete>,
}

impl GuidePulseScheduler {
    /// Create a scheduler. With `enabled == false` every request reports `Alert`.
    pub fn new(hardware: Arc<dyn CameraHardware>, config: &GuideConfig, enabled: bool) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            hardware,
            sync_threshold: config.sync_threshold,
            enabled,
            ra: Arc::new(Mutex::new(AxisSlot::default())),
            de: Arc::new(Mutex::new(AxisSlot::default())),
            events,
        }
    }

    /// Receive [`GuideComplete`] events.
    pub fn subscribe(&self) -> broadcast::Receiver<GuideComplete> {
        self.events.subscribe()
    }

    /// Pulse north on the DE axis.
    pub async fn guide_north(&self, duration: Duration) -> GuideState {
        self.pulse(GuideDirection::North, duration).await
    }

    /// Pulse south on the DE axis.
    pub async fn guide_south(&self, duration: Duration) -> GuideState {
        self.pulse(GuideDirection::South, duration).await
    }

    /// Pulse east on the RA axis.
    pub async fn guide_east(&self, duration: Duration) -> GuideState {
        self.pulse(GuideDirection::East, duration).await
    }

    /// Pulse west on the RA axis.
    pub async fn guide_west(&self, duration: Duration) -> GuideState {
        self.pulse(GuideDirection::West, duration).await
    }

    fn slot(&self, axis: GuideAxis) -> &Arc<Mutex<AxisSlot>> {
        match axis {
            GuideAxis::Ra => &self.ra,
            GuideAxis::De => &self.de,
        }
    }

    /// Assert `direction` for `duration`, superseding any pulse on the same axis.
    pub async fn pulse(&self, direction: GuideDirection, duration: Duration) -> GuideState {
        if !self.enabled {
            warn!(%direction, "Guide port not available");
            return GuideState::Alert;
        }

        let axis = direction.axis();
        let slot_ref = self.slot(axis);
        let mut slot = slot_ref.lock().await;
        slot.generation += 1;

        if let Some(previous) = slot.active.take() {
            previous.timer.abort();
            debug!(
                axis = ?axis,
                superseded = %previous.direction,
                elapsed_ms = millis(previous.started.elapsed()),
                planned_ms = millis(previous.duration),
                "Guide pulse superseded"
            );
            if let Err(e) = self.hardware.set_guide_direction(previous.direction, false).await {
                warn!(direction = %previous.direction, error = %e, "Failed to release guide line");
            }
        }

        if let Err(e) = self.hardware.set_guide_direction(direction, true).await {
            warn!(%direction, error = %e, "Failed to start guide pulse");
            return GuideState::Alert;
        }

        if duration < self.sync_threshold {
            std::thread::sleep(duration);
            if let Err(e) = self.hardware.set_guide_direction(direction, false).await {
                warn!(%direction, error = %e, "Failed to stop guide pulse");
                return GuideState::Alert;
            }
            let _ = self.events.send(GuideComplete { axis });
            return GuideState::Ok;
        }

        debug!(%direction, duration_ms = millis(duration), "Guide pulse started");
        let timer = tokio::spawn(pulse_timer(
            self.hardware.clone(),
            slot_ref.clone(),
            self.events.clone(),
            direction,
            duration,
            slot.generation,
        ));
        slot.active = Some(ActivePulse {
            direction,
            started: Instant::now(),
            duration,
            timer,
        });
        GuideState::Busy
    }

    /// Whether a timed pulse is pending on `axis`.
    pub async fn is_pulsing(&self, axis: GuideAxis) -> bool {
        self.slot(axis).lock().await.active.is_some()
    }

    /// Cut any pending pulse short, releasing its line and signalling completion.
    pub async fn stop_all(&self) {
        for axis in [GuideAxis::Ra, GuideAxis::De] {
            let mut slot = self.slot(axis).lock().await;
            slot.generation += 1;
            if let Some(active) = slot.active.take() {
                active.timer.abort();
                if let Err(e) = self.hardware.set_guide_direction(active.direction, false).await {
                    warn!(direction = %active.direction, error = %e, "Failed to release guide line");
                }
                let _ = self.events.send(GuideComplete { axis });
            }
        }
    }
}

/// Whole milliseconds for log fields, saturating.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn pulse_timer(
    hardware: Arc<dyn CameraHardware>,
    slot: Arc<Mutex<AxisSlot>>,
    events: broadcast::Sender<GuideComplete>,
    direction: GuideDirection,
    duration: Duration,
    generation: u64,
) {
    sleep(duration).await;

    let mut slot = slot.lock().await;
    if slot.generation != generation {
        return;
    }
    slot.active = None;
    if let Err(e) = hardware.set_guide_direction(direction, false).await {
        warn!(%direction, error = %e, "Failed to stop guide pulse");
    }
    debug!(%direction, "Guide pulse complete");
    let _ = events.send(GuideComplete {
        axis: direction.axis(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{HardwareCall, MockCamera};

    fn scheduler(camera: Arc<MockCamera>) -> GuidePulseScheduler {
        GuidePulseScheduler::new(camera, &GuideConfig::default(), true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_pulse_releases_line_and_signals() {
        let camera = Arc::new(MockCamera::new(64, 32));
        let guider = scheduler(camera.clone());
        let mut events = guider.subscribe();

        assert_eq!(guider.guide_east(Duration::from_millis(200)).await, GuideState::Busy);
        assert!(camera.guide_line(GuideDirection::East));

        let event = events.recv().await.unwrap();
        assert_eq!(event.axis, GuideAxis::Ra);
        assert!(!camera.guide_line(GuideDirection::East));
        assert!(!guider.is_pulsing(GuideAxis::Ra).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_millisecond_pulse_is_synchronous() {
        let camera = Arc::new(MockCamera::new(64, 32));
        let guider = scheduler(camera.clone());
        let mut events = guider.subscribe();

        let state = guider.guide_south(Duration::from_micros(500)).await;
        assert_eq!(state, GuideState::Ok);
        assert!(!camera.guide_line(GuideDirection::South));
        assert_eq!(camera.call_count(HardwareCall::SetGuideDirection), 2);
        assert_eq!(events.try_recv().unwrap().axis, GuideAxis::De);
    }

    #[tokio::test(start_paused = true)]
    async fn test_axes_are_independent() {
        let camera = Arc::new(MockCamera::new(64, 32));
        let guider = scheduler(camera.clone());

        guider.guide_north(Duration::from_millis(300)).await;
        guider.guide_west(Duration::from_millis(300)).await;
        assert!(camera.guide_line(GuideDirection::North));
        assert!(camera.guide_line(GuideDirection::West));
    }

    #[tokio::test(start_paused = true)]
    async fn test_opposite_direction_supersedes_on_same_axis() {
        let camera = Arc::new(MockCamera::new(64, 32));
        let guider = scheduler(camera.clone());

        guider.guide_north(Duration::from_millis(300)).await;
        guider.guide_south(Duration::from_millis(300)).await;
        assert!(!camera.guide_line(GuideDirection::North));
        assert!(camera.guide_line(GuideDirection::South));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_signals_pending_pulses() {
        let camera = Arc::new(MockCamera::new(64, 32));
        let guider = scheduler(camera.clone());
        let mut events = guider.subscribe();

        guider.guide_north(Duration::from_secs(5)).await;
        guider.stop_all().await;

        assert!(!camera.guide_line(GuideDirection::North));
        assert_eq!(events.recv().await.unwrap().axis, GuideAxis::De);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_log_millis_saturate() {
        assert_eq!(millis(Duration::from_micros(1_500_900)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_disabled_port_alerts() {
        let camera = Arc::new(MockCamera::new(64, 32));
        let guider = GuidePulseScheduler::new(camera.clone(), &GuideConfig::default(), false);
        assert_eq!(guider.guide_north(Duration::from_millis(10)).await, GuideState::Alert);
        assert!(camera.calls().is_empty());
    }
}
