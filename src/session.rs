//! Connected camera session.
//!
//! A `CameraSession` holds the hardware handle and every component built
//! around it. Its lifetime is bound to connect/disconnect; nothing in the
//! engine reaches the hardware through global state.

use crate::config::EngineConfig;
use crate::controls::ControlTable;
use crate::error::{EngineError, EngineResult};
use crate::exposure::{ExposureController, ExposureState, FrameKind};
use crate::frame::FrameBufferManager;
use crate::guide::GuidePulseScheduler;
use crate::hardware::{CameraHardware, SensorInfo};
use crate::temperature::{SetTemperatureResult, TemperatureRegulator};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Snapshot of the camera state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraState {
    /// Exposure state machine.
    pub exposure: ExposureState,
    /// Last sensor temperature read, if cooled.
    pub temperature: Option<f64>,
    /// Cooler set-point, if one was requested.
    pub target_temperature: Option<f64>,
    /// Last cooler duty read, percent.
    pub cooler_duty: Option<f64>,
    /// Restarts of the current or last exposure.
    pub restarts: u32,
    /// Error of the last failed exposure.
    pub last_error: Option<String>,
}

/// One connected camera.
pub struct CameraSession {
    hardware: Arc<dyn CameraHardware>,
    sensor: SensorInfo,
    config: EngineConfig,
    controls: ControlTable,
    controller: ExposureController,
    regulator: Option<TemperatureRegulator>,
    guider: GuidePulseScheduler,
    connected: AtomicBool,
}

impl CameraSession {
    /// Set up every component around `hardware`.
    ///
    /// Reads the control table and, for cooled sensors, the initial temperature
    /// before starting the regulation loop. Must be called inside a tokio runtime.
    pub async fn connect(
        hardware: Arc<dyn CameraHardware>,
        sensor: SensorInfo,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate()?;

        let controls = ControlTable::load(hardware.clone()).await?;
        let frames = FrameBufferManager::new(sensor.clone(), &config.sensor)?;
        let controller = ExposureController::new(hardware.clone(), frames, &config)?;

        let regulator = if sensor.has_cooler {
            let initial = hardware.temperature().await?;
            Some(TemperatureRegulator::start(
                hardware.clone(),
                &config.temperature,
                initial,
            ))
        } else {
            None
        };
        let guider = GuidePulseScheduler::new(hardware.clone(), &config.guide, sensor.can_guide);

        info!(
            width = sensor.max_width,
            height = sensor.max_height,
            color = sensor.is_color,
            cooler = sensor.has_cooler,
            controls = controls.len(),
            "Camera connected"
        );

        Ok(Self {
            hardware,
            sensor,
            config,
            controls,
            controller,
            regulator,
            guider,
            connected: AtomicBool::new(true),
        })
    }

    /// Tear the session down.
    ///
    /// Aborts and joins any active exposure, releases pending guide pulses,
    /// stops the regulation loop and switches the cooler off.
    pub async fn disconnect(&self) -> EngineResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.controller.shutdown().await;
        self.guider.stop_all().await;
        if let Some(regulator) = &self.regulator {
            regulator.stop().await;
            if let Err(e) = self.hardware.set_cooler_enabled(false).await {
                warn!(error = %e, "Failed to switch cooler off");
            }
        }
        info!("Camera disconnected");
        Ok(())
    }

    /// Whether [`disconnect`](Self::disconnect) has not run yet.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> EngineResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(EngineError::NotConnected)
        }
    }

    /// Start an exposure; see [`ExposureController::start_exposure`].
    pub fn start_exposure(&self, duration_s: f64, frame_kind: FrameKind) -> EngineResult<()> {
        self.ensure_connected()?;
        self.controller.start_exposure(duration_s, frame_kind)
    }

    /// Abort the active exposure. Always succeeds.
    pub fn abort_exposure(&self) -> bool {
        self.controller.abort_exposure()
    }

    /// Request a new sensor set-point.
    pub async fn set_temperature(&self, target: f64) -> EngineResult<SetTemperatureResult> {
        self.ensure_connected()?;
        match &self.regulator {
            Some(regulator) => regulator.set_temperature(target).await,
            None => Err(EngineError::BadRequest("camera has no cooler".to_string())),
        }
    }

    /// Exposure controller of this camera.
    pub fn controller(&self) -> &ExposureController {
        &self.controller
    }

    /// Temperature regulation, present only for cooled sensors.
    pub fn regulator(&self) -> Option<&TemperatureRegulator> {
        self.regulator.as_ref()
    }

    /// Guide pulse scheduler of this camera.
    pub fn guider(&self) -> &GuidePulseScheduler {
        &self.guider
    }

    /// Controls read at connect.
    pub fn controls(&self) -> &ControlTable {
        &self.controls
    }

    /// Sensor description given at connect.
    pub fn sensor(&self) -> &SensorInfo {
        &self.sensor
    }

    /// Effective configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current state of every component.
    pub fn state(&self) -> CameraState {
        CameraState {
            exposure: self.controller.state(),
            temperature: self.regulator.as_ref().map(|r| r.temperature().get()),
            target_temperature: self.regulator.as_ref().and_then(|r| r.target()),
            cooler_duty: self.regulator.as_ref().map(|r| r.duty().get()),
            restarts: self.controller.restart_count(),
            last_error: self.controller.last_error(),
        }
    }
}
