//! Engine Configuration using Figment
//!
//! Configuration is layered, later sources winning:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `EXPOSURE_`, nested with `__`
//!
//! ```text
//! EXPOSURE_LOGGING__LEVEL=debug
//! EXPOSURE_EXPOSURE__MAX_RESTARTS=5
//! EXPOSURE_TEMPERATURE__THRESHOLD=0.1
//! ```
//!
//! Durations are written in humantime notation (`"100ms"`, `"5s"`).
//!
//! # Example
//!
//! ```no_run
//! use exposure_engine::config::EngineConfig;
//!
//! let config = EngineConfig::load(Some("camera.toml".as_ref()))?;
//! println!("Max restarts: {}", config.exposure.max_restarts);
//! # Ok::<(), exposure_engine::error::EngineError>(())
//! ```

use crate::error::{EngineError, EngineResult};
use crate::exposure::BlinkConfig;
use crate::frame::MAX_FRAME_BYTES;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "EXPOSURE_";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tracing output
    pub logging: LoggingConfig,
    /// Acquisition worker timing and bounds
    pub exposure: ExposureConfig,
    /// Start-command retry policy
    pub retry: RetryConfig,
    /// Cooler regulation
    pub temperature: TemperatureConfig,
    /// Guide pulse timing
    pub guide: GuideConfig,
    /// Sensor geometry constraints and buffer memory
    pub sensor: SensorConfig,
}

/// Logging output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Acquisition worker timing and bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    /// Full exposure restarts allowed after in-flight failures
    pub max_restarts: u32,
    /// Consecutive status communication failures tolerated
    pub status_comm_retries: u32,
    /// Above this time left the countdown sleeps to whole-second boundaries
    #[serde(with = "humantime_serde")]
    pub coarse_threshold: Duration,
    /// Sleep step once below the coarse threshold, and the status poll step
    #[serde(with = "humantime_serde")]
    pub fine_poll: Duration,
    /// Shortest sleep ever issued by the countdown
    #[serde(with = "humantime_serde")]
    pub min_sleep: Duration,
    /// Added to the exposure duration to form the readout timeout
    #[serde(with = "humantime_serde")]
    pub readout_slack: Duration,
    /// How long the hardware may keep reporting `Working` past the nominal end
    #[serde(with = "humantime_serde")]
    pub overrun_grace: Duration,
    /// Exposures at least this long log their progress at INFO
    #[serde(with = "humantime_serde")]
    pub verbose_threshold: Duration,
    /// Dark pre-flash exposures taken before every frame
    pub blink: BlinkConfig,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            status_comm_retries: 10,
            coarse_threshold: Duration::from_millis(1100),
            fine_poll: Duration::from_millis(100),
            min_sleep: Duration::from_millis(5),
            readout_slack: Duration::from_secs(10),
            overrun_grace: Duration::from_secs(60),
            verbose_threshold: Duration::from_secs(3),
            blink: BlinkConfig::default(),
        }
    }
}

/// Retry settings for the start-exposure command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Delay between attempts
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Cooler regulation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureConfig {
    /// Degrees Celsius within which the sensor counts as at target
    pub threshold: f64,
    /// Poll interval once converged
    #[serde(with = "humantime_serde")]
    pub idle_interval: Duration,
    /// Poll interval while moving toward a new target
    #[serde(with = "humantime_serde")]
    pub busy_interval: Duration,
    /// Minimum duty change (percentage points) that is republished
    pub duty_delta: f64,
    /// Minimum temperature change (degrees) that is republished
    pub temperature_delta: f64,
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            threshold: 0.25,
            idle_interval: Duration::from_secs(5),
            busy_interval: Duration::from_secs(1),
            duty_delta: 1.0,
            temperature_delta: 0.05,
        }
    }
}

/// Guide port settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuideConfig {
    /// Pulses shorter than this run synchronously on the calling thread
    #[serde(with = "humantime_serde")]
    pub sync_threshold: Duration,
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            sync_threshold: Duration::from_millis(1),
        }
    }
}

/// Sensor readout constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Binned ROI width must be a multiple of this
    pub width_alignment: u32,
    /// Binned ROI height must be a multiple of this
    pub height_alignment: u32,
    /// Bytes the download path may hold at once, raw readout plus any
    /// planar copy
    pub buffer_memory: usize,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            width_alignment: 8,
            height_alignment: 2,
            buffer_memory: 2 * MAX_FRAME_BYTES,
        }
    }
}

impl EngineConfig {
    /// Load defaults, then `path` (if given), then `EXPOSURE_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if a source cannot be parsed and
    /// `EngineError::Configuration` if the merged values fail validation.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults, without environment overrides.
    pub fn from_toml_str(toml: &str) -> EngineResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as a TOML document, e.g. to seed a config file.
    pub fn to_toml(&self) -> EngineResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| EngineError::Configuration(format!("failed to render configuration: {e}")))
    }

    /// Check semantic constraints the type system cannot express.
    pub fn validate(&self) -> EngineResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(EngineError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(EngineError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.exposure.fine_poll.is_zero() || self.exposure.min_sleep.is_zero() {
            return Err(EngineError::Configuration(
                "exposure.fine_poll and exposure.min_sleep must be non-zero".to_string(),
            ));
        }

        if self.exposure.status_comm_retries == 0 {
            return Err(EngineError::Configuration(
                "exposure.status_comm_retries must be at least 1".to_string(),
            ));
        }

        let t = &self.temperature;
        if t.threshold.is_nan() || t.threshold <= 0.0 {
            return Err(EngineError::Configuration(format!(
                "temperature.threshold must be positive, got {}",
                t.threshold
            )));
        }
        if t.idle_interval.is_zero() || t.busy_interval.is_zero() {
            return Err(EngineError::Configuration(
                "temperature poll intervals must be non-zero".to_string(),
            ));
        }
        if t.duty_delta < 0.0 || t.temperature_delta < 0.0 {
            return Err(EngineError::Configuration(
                "temperature publish deltas must not be negative".to_string(),
            ));
        }

        if self.sensor.width_alignment == 0 || self.sensor.height_alignment == 0 {
            return Err(EngineError::Configuration(
                "sensor alignment must be at least 1".to_string(),
            ));
        }
        if self.sensor.buffer_memory == 0 {
            return Err(EngineError::Configuration(
                "sensor.buffer_memory must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
