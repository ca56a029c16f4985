//! Cooler regulation loop.
//!
//! Runs as its own tokio task, independent of exposure state. The loop reads
//! the sensor temperature and cooler duty on an idle cadence (5 s by default)
//! and switches to a busy cadence (1 s) right after a new set-point until the
//! sensor is within threshold of it.
//!
//! Readings are republished only when they move by more than a small delta so
//! subscribers are not flooded with noise.

use crate::config::TemperatureConfig;
use crate::error::{EngineError, EngineResult};
use crate::exposure::CancelFlag;
use crate::hardware::CameraHardware;
use crate::observable::Observable;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Result of a set-point request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetTemperatureResult {
    /// The sensor is already within threshold; nothing was sent to the hardware.
    AlreadyThere,
    /// The set-point was written and the loop is converging.
    Accepted,
}

/// Poll cadence of the regulation loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cadence {
    /// Converged; slow polling.
    #[default]
    Idle,
    /// Approaching a new set-point; fast polling.
    Busy,
}

struct RegulatorShared {
    target: Mutex<Option<f64>>,
    temperature: Observable<f64>,
    duty: Observable<f64>,
    cadence: Observable<Cadence>,
    wake: Notify,
    stop: CancelFlag,
}

/// Independent temperature regulation for one camera.
pub struct TemperatureRegulator {
    hardware: Arc<dyn CameraHardware>,
    config: TemperatureConfig,
    shared: Arc<RegulatorShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TemperatureRegulator {
    /// Spawn the regulation loop on the current runtime.
    ///
    /// `initial_temperature` seeds the published value; it is the reading taken
    /// while connecting.
    pub fn start(
        hardware: Arc<dyn CameraHardware>,
        config: &TemperatureConfig,
        initial_temperature: f64,
    ) -> Self {
        let shared = Arc::new(RegulatorShared {
            target: Mutex::new(None),
            temperature: Observable::new("ccd_temperature", initial_temperature).with_units("C"),
            duty: Observable::new("cooler_duty", 0.0).with_units("%"),
            cadence: Observable::new("regulation_cadence", Cadence::Idle),
            wake: Notify::new(),
            stop: CancelFlag::new(),
        });

        let task = tokio::spawn(regulation_loop(
            hardware.clone(),
            config.clone(),
            shared.clone(),
        ));

        Self {
            hardware,
            config: config.clone(),
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// Request a new sensor set-point.
    ///
    /// Within threshold of the last reading this is a no-op that issues no
    /// hardware command. Otherwise the cooler is switched on, the set-point
    /// written and the loop moved to its busy cadence.
    pub async fn set_temperature(&self, target: f64) -> EngineResult<SetTemperatureResult> {
        if !target.is_finite() {
            return Err(EngineError::BadRequest(format!(
                "temperature set-point must be finite, got {target}"
            )));
        }

        let current = self.shared.temperature.get();
        if (current - target).abs() < self.config.threshold {
            debug!(current, target, "Already at temperature");
            return Ok(SetTemperatureResult::AlreadyThere);
        }

        self.hardware.set_cooler_enabled(true).await.map_err(|e| {
            EngineError::FatalHardware(format!("failed to activate cooler: {e}"))
        })?;
        self.hardware.set_temperature_target(target).await.map_err(|e| {
            EngineError::FatalHardware(format!("failed to set temperature to {target:.2}: {e}"))
        })?;

        info!(current, target, "Setting CCD temperature");
        *self.shared.target.lock() = Some(target);
        self.shared.cadence.set_if_changed(Cadence::Busy);
        self.shared.wake.notify_one();
        Ok(SetTemperatureResult::Accepted)
    }

    /// Switch the cooler on or off. Switching off clears the set-point.
    pub async fn set_cooler_enabled(&self, enabled: bool) -> EngineResult<()> {
        self.hardware.set_cooler_enabled(enabled).await?;
        if !enabled {
            *self.shared.target.lock() = None;
            self.shared.cadence.set_if_changed(Cadence::Idle);
        }
        Ok(())
    }

    /// Last requested set-point.
    pub fn target(&self) -> Option<f64> {
        *self.shared.target.lock()
    }

    /// Published sensor temperature.
    pub fn temperature(&self) -> &Observable<f64> {
        &self.shared.temperature
    }

    /// Published cooler duty in percent.
    pub fn duty(&self) -> &Observable<f64> {
        &self.shared.duty
    }

    /// Current polling cadence.
    pub fn cadence(&self) -> &Observable<Cadence> {
        &self.shared.cadence
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(&self) {
        self.shared.stop.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Temperature loop ended abnormally");
            }
        }
    }
}

impl Drop for TemperatureRegulator {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}

async fn regulation_loop(
    hardware: Arc<dyn CameraHardware>,
    config: TemperatureConfig,
    shared: Arc<RegulatorShared>,
) {
    debug!("Temperature loop started");
    loop {
        let interval = match shared.cadence.get() {
            Cadence::Idle => config.idle_interval,
            Cadence::Busy => config.busy_interval,
        };
        tokio::select! {
            _ = sleep(interval) => {}
            _ = shared.wake.notified() => {}
            _ = shared.stop.cancelled() => break,
        }
        poll_once(hardware.as_ref(), &config, &shared).await;
    }
    debug!("Temperature loop stopped");
}

async fn poll_once(hardware: &dyn CameraHardware, config: &TemperatureConfig, shared: &RegulatorShared) {
    let temperature = match hardware.temperature().await {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "Failed to read CCD temperature");
            return;
        }
    };
    if shared
        .temperature
        .set_if_moved(temperature, config.temperature_delta)
    {
        debug!(temperature, "CCD temperature");
    }

    match hardware.cooler_duty_percent().await {
        Ok(duty) => {
            shared.duty.set_if_moved(duty, config.duty_delta);
        }
        Err(e) => debug!(error = %e, "Failed to read cooler duty"),
    }

    let target = *shared.target.lock();
    if let Some(target) = target {
        if (temperature - target).abs() < config.threshold
            && shared.cadence.set_if_changed(Cadence::Idle)
        {
            info!(temperature, target, "Temperature reached target");
        }
    }
}
