//! Mock Hardware Implementation
//!
//! Provides a simulated camera for testing without physical hardware.
//! All timing uses `tokio::time`, so tests can run on paused time.
//!
//! # Fault injection
//!
//! - `fail_next_starts(n)` - the next `n` start commands are rejected
//! - `script_statuses(..)` - statuses returned once an exposure has run its course
//! - `always_fail_exposures(true)` - every finished exposure reports `Failed`
//! - `fail_next_status_polls(n)` - the next `n` status queries time out
//! - `reject_next_status_polls(n)` - the next `n` status queries are rejected
//! - `fail_next_reads(n)` - the next `n` frame reads are rejected
//! - `set_readout_delay(d)` - every frame read takes `d`
//!
//! Every call is recorded and can be counted with [`MockCamera::call_count`].

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{HardwareError, HardwareResult};
use crate::frame::{Binning, PixelFormat, Roi};
use crate::hardware::{
    CameraHardware, ControlCaps, ControlId, ExposureStatus, GuideDirection,
};

/// Hardware call kinds recorded by [`MockCamera`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareCall {
    /// [`CameraHardware::start_exposure`]
    StartExposure,
    /// [`CameraHardware::exposure_status`]
    ExposureStatus,
    /// [`CameraHardware::stop_exposure`]
    StopExposure,
    /// [`CameraHardware::read_frame`]
    ReadFrame,
    /// [`CameraHardware::set_frame_format`]
    SetFrameFormat,
    /// [`CameraHardware::set_temperature_target`]
    SetTemperatureTarget,
    /// [`CameraHardware::temperature`]
    Temperature,
    /// [`CameraHardware::set_cooler_enabled`]
    SetCoolerEnabled,
    /// [`CameraHardware::cooler_duty_percent`]
    CoolerDutyPercent,
    /// [`CameraHardware::set_guide_direction`]
    SetGuideDirection,
    /// [`CameraHardware::control_caps`]
    ControlCaps,
    /// [`CameraHardware::set_control`]
    SetControl,
}

/// Blue, green and red sample values written for interleaved colour frames.
pub const MOCK_BGR: [u8; 3] = [10, 20, 30];

/// Alpha value written for `Rgb32` frames.
pub const MOCK_ALPHA: u8 = 255;

struct ExposureRun {
    started: Instant,
    duration: Duration,
}

struct MockState {
    exposure: Option<ExposureRun>,
    last_start: Option<(u64, bool)>,
    frame_ready: bool,
    start_failures: u32,
    status_timeouts: u32,
    status_rejections: u32,
    read_failures: u32,
    readout_delay: Duration,
    status_script: VecDeque<ExposureStatus>,
    always_fail: bool,
    roi: Roi,
    binning: Binning,
    format: PixelFormat,
    temperature: f64,
    ambient: f64,
    target: Option<f64>,
    cooler_on: bool,
    cooling_step: f64,
    duty_override: Option<f64>,
    guide_lines: HashMap<GuideDirection, bool>,
    controls: Vec<ControlCaps>,
    control_values: HashMap<ControlId, (i64, bool)>,
    calls: Vec<HardwareCall>,
}

/// Simulated camera with scripted faults.
///
/// # Example
///
/// ```rust,ignore
/// let camera = Arc::new(MockCamera::new(1920, 1080));
/// camera.script_statuses([ExposureStatus::Failed]);
/// let session = CameraSession::connect(camera.clone(), sensor, config).await?;
/// ```
pub struct MockCamera {
    state: Mutex<MockState>,
}

impl MockCamera {
    /// Create new mock camera with the given unbinned resolution.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            state: Mutex::new(MockState {
                exposure: None,
                last_start: None,
                frame_ready: false,
                start_failures: 0,
                status_timeouts: 0,
                status_rejections: 0,
                read_failures: 0,
                readout_delay: Duration::ZERO,
                status_script: VecDeque::new(),
                always_fail: false,
                roi: Roi::full(width, height),
                binning: Binning::NONE,
                format: PixelFormat::Raw16,
                temperature: 20.0,
                ambient: 20.0,
                target: None,
                cooler_on: false,
                cooling_step: 0.5,
                duty_override: None,
                guide_lines: HashMap::new(),
                controls: default_controls(),
                control_values: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// Reject the next `n` start commands.
    pub fn fail_next_starts(&self, n: u32) {
        self.state.lock().start_failures = n;
    }

    /// Statuses returned, in order, by polls made after an exposure has run its course.
    pub fn script_statuses(&self, statuses: impl IntoIterator<Item = ExposureStatus>) {
        self.state.lock().status_script = statuses.into_iter().collect();
    }

    /// Report `Failed` for every finished exposure.
    pub fn always_fail_exposures(&self, fail: bool) {
        self.state.lock().always_fail = fail;
    }

    /// Time out the next `n` status queries.
    pub fn fail_next_status_polls(&self, n: u32) {
        self.state.lock().status_timeouts = n;
    }

    /// Reject the next `n` status queries with a vendor error.
    pub fn reject_next_status_polls(&self, n: u32) {
        self.state.lock().status_rejections = n;
    }

    /// Reject the next `n` frame reads.
    pub fn fail_next_reads(&self, n: u32) {
        self.state.lock().read_failures = n;
    }

    /// Time each frame read takes before data arrives.
    pub fn set_readout_delay(&self, delay: Duration) {
        self.state.lock().readout_delay = delay;
    }

    /// Force the sensor temperature reading.
    pub fn set_sensor_temperature(&self, celsius: f64) {
        self.state.lock().temperature = celsius;
    }

    /// Degrees per temperature read the sensor moves toward the set-point.
    pub fn set_cooling_step(&self, step: f64) {
        self.state.lock().cooling_step = step;
    }

    /// Force the cooler duty reading.
    pub fn set_duty_percent(&self, percent: f64) {
        self.state.lock().duty_override = Some(percent);
    }

    /// Replace the advertised control list.
    pub fn set_controls(&self, controls: Vec<ControlCaps>) {
        self.state.lock().controls = controls;
    }

    /// Number of recorded calls of one kind.
    pub fn call_count(&self, call: HardwareCall) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<HardwareCall> {
        self.state.lock().calls.clone()
    }

    /// Arguments of the most recent start command.
    pub fn last_start(&self) -> Option<(u64, bool)> {
        self.state.lock().last_start
    }

    /// Whether a guide line is currently asserted.
    pub fn guide_line(&self, direction: GuideDirection) -> bool {
        self.state
            .lock()
            .guide_lines
            .get(&direction)
            .copied()
            .unwrap_or(false)
    }

    /// Whether an exposure is currently running on the simulated sensor.
    pub fn is_exposing(&self) -> bool {
        self.state.lock().exposure.is_some()
    }

    /// Last set-point written, if any.
    pub fn temperature_target(&self) -> Option<f64> {
        self.state.lock().target
    }

    /// Whether the cooler is switched on.
    pub fn cooler_enabled(&self) -> bool {
        self.state.lock().cooler_on
    }

    /// Last value written to a control.
    pub fn control_value(&self, id: ControlId) -> Option<(i64, bool)> {
        self.state.lock().control_values.get(&id).copied()
    }

    /// Currently programmed geometry.
    pub fn frame_format(&self) -> (Roi, Binning, PixelFormat) {
        let state = self.state.lock();
        (state.roi, state.binning, state.format)
    }

    fn record(&self, call: HardwareCall) -> parking_lot::MutexGuard<'_, MockState> {
        let mut state = self.state.lock();
        state.calls.push(call);
        state
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new(1920, 1080)
    }
}

fn default_controls() -> Vec<ControlCaps> {
    vec![
        ControlCaps {
            id: ControlId::Gain,
            min: 0,
            max: 570,
            default: 100,
            writable: true,
            auto_supported: true,
        },
        ControlCaps {
            id: ControlId::Offset,
            min: 0,
            max: 80,
            default: 8,
            writable: true,
            auto_supported: false,
        },
        ControlCaps {
            id: ControlId::UsbBandwidth,
            min: 40,
            max: 100,
            default: 50,
            writable: true,
            auto_supported: true,
        },
        ControlCaps {
            id: ControlId::HighSpeedMode,
            min: 0,
            max: 1,
            default: 0,
            writable: true,
            auto_supported: false,
        },
        ControlCaps {
            id: ControlId::FanOn,
            min: 0,
            max: 1,
            default: 1,
            writable: false,
            auto_supported: false,
        },
    ]
}

#[async_trait]
impl CameraHardware for MockCamera {
    async fn start_exposure(&self, duration_us: u64, is_dark: bool) -> HardwareResult<()> {
        let mut state = self.record(HardwareCall::StartExposure);
        state.last_start = Some((duration_us, is_dark));
        if state.start_failures > 0 {
            state.start_failures -= 1;
            debug!("MockCamera: rejecting start command");
            return Err(HardwareError::rejected(-1, "camera busy"));
        }
        state.frame_ready = false;
        state.exposure = Some(ExposureRun {
            started: Instant::now(),
            duration: Duration::from_micros(duration_us),
        });
        debug!(duration_us, is_dark, "MockCamera: exposure started");
        Ok(())
    }

    async fn exposure_status(&self) -> HardwareResult<ExposureStatus> {
        let mut state = self.record(HardwareCall::ExposureStatus);
        if state.status_timeouts > 0 {
            state.status_timeouts -= 1;
            return Err(HardwareError::Timeout);
        }
        if state.status_rejections > 0 {
            state.status_rejections -= 1;
            return Err(HardwareError::rejected(-4, "status unavailable"));
        }
        let finished = match &state.exposure {
            None => return Ok(ExposureStatus::Idle),
            Some(run) => run.started.elapsed() >= run.duration,
        };
        if !finished {
            return Ok(ExposureStatus::Working);
        }
        let status = if state.always_fail {
            ExposureStatus::Failed
        } else {
            state
                .status_script
                .pop_front()
                .unwrap_or(ExposureStatus::Success)
        };
        match status {
            ExposureStatus::Success => state.frame_ready = true,
            ExposureStatus::Failed | ExposureStatus::Idle => state.exposure = None,
            ExposureStatus::Working => {}
        }
        Ok(status)
    }

    async fn stop_exposure(&self) -> HardwareResult<()> {
        let mut state = self.record(HardwareCall::StopExposure);
        state.exposure = None;
        state.frame_ready = false;
        Ok(())
    }

    async fn read_frame(&self, buffer: &mut [u8], _timeout: Duration) -> HardwareResult<()> {
        let delay = self.record(HardwareCall::ReadFrame).readout_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.read_failures > 0 {
            state.read_failures -= 1;
            return Err(HardwareError::rejected(-5, "transfer failed"));
        }
        if !state.frame_ready {
            return Err(HardwareError::rejected(-2, "no frame available"));
        }
        let expected = state.roi.pixels() * state.format.bytes_per_pixel() * state.format.channels();
        if buffer.len() != expected {
            return Err(HardwareError::rejected(
                -3,
                format!("buffer is {} bytes, frame is {}", buffer.len(), expected),
            ));
        }
        match state.format {
            PixelFormat::Rgb24 => {
                for px in buffer.chunks_exact_mut(3) {
                    px.copy_from_slice(&MOCK_BGR);
                }
            }
            PixelFormat::Rgb32 => {
                for px in buffer.chunks_exact_mut(4) {
                    px[..3].copy_from_slice(&MOCK_BGR);
                    px[3] = MOCK_ALPHA;
                }
            }
            _ => rand::thread_rng().fill(buffer),
        }
        state.exposure = None;
        state.frame_ready = false;
        Ok(())
    }

    async fn set_frame_format(
        &self,
        roi: Roi,
        binning: Binning,
        format: PixelFormat,
    ) -> HardwareResult<()> {
        let mut state = self.record(HardwareCall::SetFrameFormat);
        state.roi = roi;
        state.binning = binning;
        state.format = format;
        Ok(())
    }

    async fn set_temperature_target(&self, celsius: f64) -> HardwareResult<()> {
        let mut state = self.record(HardwareCall::SetTemperatureTarget);
        state.target = Some(celsius);
        Ok(())
    }

    async fn temperature(&self) -> HardwareResult<f64> {
        let mut state = self.record(HardwareCall::Temperature);
        let goal = match (state.cooler_on, state.target) {
            (true, Some(target)) => target,
            _ => state.ambient,
        };
        let delta = goal - state.temperature;
        let step = state.cooling_step;
        state.temperature += delta.clamp(-step, step);
        Ok(state.temperature)
    }

    async fn set_cooler_enabled(&self, enabled: bool) -> HardwareResult<()> {
        let mut state = self.record(HardwareCall::SetCoolerEnabled);
        state.cooler_on = enabled;
        Ok(())
    }

    async fn cooler_duty_percent(&self) -> HardwareResult<f64> {
        let state = self.record(HardwareCall::CoolerDutyPercent);
        if let Some(duty) = state.duty_override {
            return Ok(duty);
        }
        if !state.cooler_on {
            return Ok(0.0);
        }
        Ok(((state.ambient - state.temperature) * 3.0).clamp(0.0, 100.0))
    }

    async fn set_guide_direction(&self, direction: GuideDirection, on: bool) -> HardwareResult<()> {
        let mut state = self.record(HardwareCall::SetGuideDirection);
        state.guide_lines.insert(direction, on);
        Ok(())
    }

    async fn control_caps(&self) -> HardwareResult<Vec<ControlCaps>> {
        let state = self.record(HardwareCall::ControlCaps);
        Ok(state.controls.clone())
    }

    async fn set_control(&self, id: ControlId, value: i64, auto: bool) -> HardwareResult<()> {
        let mut state = self.record(HardwareCall::SetControl);
        state.control_values.insert(id, (value, auto));
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
