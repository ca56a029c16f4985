//! Abstract camera hardware surface.
//!
//! Everything the engine needs from a vendor SDK is expressed by
//! [`CameraHardware`]. Implementations wrap the SDK handle; the engine holds them
//! as `Arc<dyn CameraHardware>` inside a [`CameraSession`](crate::session::CameraSession).
//!
//! Calls are expected to carry their own communication timeout and report it
//! as [`HardwareError::Timeout`](crate::error::HardwareError::Timeout).

pub mod mock;

use crate::error::HardwareResult;
use crate::frame::{Binning, PixelFormat, Roi};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Hardware exposure status as reported by the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExposureStatus {
    /// No exposure is running.
    Idle,
    /// The exposure is still integrating.
    Working,
    /// The frame is ready to read.
    Success,
    /// The exposure failed; a restart may succeed.
    Failed,
}

/// Mount axis driven by a guide pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuideAxis {
    /// Right ascension (east/west).
    Ra,
    /// Declination (north/south).
    De,
}

/// Guide line direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuideDirection {
    /// DE+
    North,
    /// DE-
    South,
    /// RA+
    East,
    /// RA-
    West,
}

impl GuideDirection {
    /// The axis this direction belongs to.
    pub fn axis(&self) -> GuideAxis {
        match self {
            GuideDirection::North | GuideDirection::South => GuideAxis::De,
            GuideDirection::East | GuideDirection::West => GuideAxis::Ra,
        }
    }
}

impl fmt::Display for GuideDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GuideDirection::North => "North",
            GuideDirection::South => "South",
            GuideDirection::East => "East",
            GuideDirection::West => "West",
        };
        f.write_str(s)
    }
}

/// Adjustable camera controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlId {
    /// Analog gain.
    Gain,
    /// Black level offset.
    Offset,
    /// Output gamma.
    Gamma,
    /// Red white balance.
    WhiteBalanceRed,
    /// Blue white balance.
    WhiteBalanceBlue,
    /// USB bandwidth share, percent.
    UsbBandwidth,
    /// Image flip mode.
    Flip,
    /// High speed readout.
    HighSpeedMode,
    /// Sum colour pixels when binning.
    MonoBin,
    /// Cooling fan.
    FanOn,
    /// Dew heater on the sensor window.
    AntiDewHeater,
}

impl ControlId {
    /// All known controls, in table order.
    pub const ALL: [ControlId; 11] = [
        ControlId::Gain,
        ControlId::Offset,
        ControlId::Gamma,
        ControlId::WhiteBalanceRed,
        ControlId::WhiteBalanceBlue,
        ControlId::UsbBandwidth,
        ControlId::Flip,
        ControlId::HighSpeedMode,
        ControlId::MonoBin,
        ControlId::FanOn,
        ControlId::AntiDewHeater,
    ];

    /// Stable slot in a [`ControlTable`](crate::controls::ControlTable).
    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// Value type of a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlKind {
    /// Any value in range.
    Integer,
    /// On or off.
    Boolean,
}

/// Capabilities of one control as reported by the SDK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlCaps {
    /// Which control this is.
    pub id: ControlId,
    /// Smallest accepted value.
    pub min: i64,
    /// Largest accepted value.
    pub max: i64,
    /// Value after power-up.
    pub default: i64,
    /// Whether the value can be changed.
    pub writable: bool,
    /// Whether the camera can drive the value itself.
    pub auto_supported: bool,
}

/// Camera command surface consumed by the engine.
#[async_trait]
pub trait CameraHardware: Send + Sync {
    /// Start one exposure of `duration_us` microseconds; `is_dark` keeps the shutter closed.
    async fn start_exposure(&self, duration_us: u64, is_dark: bool) -> HardwareResult<()>;

    /// Query the state of the current exposure.
    async fn exposure_status(&self) -> HardwareResult<ExposureStatus>;

    /// Stop the current exposure. Harmless when idle.
    async fn stop_exposure(&self) -> HardwareResult<()>;

    /// Read the finished frame into `buffer`, which must be exactly frame sized.
    async fn read_frame(&self, buffer: &mut [u8], timeout: Duration) -> HardwareResult<()>;

    /// Program the readout geometry (ROI in binned pixels).
    async fn set_frame_format(
        &self,
        roi: Roi,
        binning: Binning,
        format: PixelFormat,
    ) -> HardwareResult<()>;

    /// Set the cooler set-point.
    async fn set_temperature_target(&self, celsius: f64) -> HardwareResult<()>;

    /// Current sensor temperature.
    async fn temperature(&self) -> HardwareResult<f64>;

    /// Switch the cooler on or off.
    async fn set_cooler_enabled(&self, enabled: bool) -> HardwareResult<()>;

    /// Cooler duty cycle in percent.
    async fn cooler_duty_percent(&self) -> HardwareResult<f64>;

    /// Assert or release one guide line.
    async fn set_guide_direction(&self, direction: GuideDirection, on: bool) -> HardwareResult<()>;

    /// Controls supported by this camera.
    async fn control_caps(&self) -> HardwareResult<Vec<ControlCaps>>;

    /// Write a control value.
    async fn set_control(&self, id: ControlId, value: i64, auto: bool) -> HardwareResult<()>;
}

/// Static description of the connected sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorInfo {
    /// Unbinned width in pixels.
    pub max_width: u32,
    /// Unbinned height in pixels.
    pub max_height: u32,
    /// Largest binning factor per axis.
    pub max_binning: u32,
    /// Pixel formats the camera can deliver.
    pub pixel_formats: Vec<PixelFormat>,
    /// Whether a regulated cooler is fitted.
    pub has_cooler: bool,
    /// Whether an ST-4 guide port is fitted.
    pub can_guide: bool,
    /// Whether the sensor has a Bayer matrix.
    pub is_color: bool,
}

impl SensorInfo {
    /// Monochrome 16-bit sensor with cooler and ST-4 port.
    pub fn mono(max_width: u32, max_height: u32) -> Self {
        Self {
            max_width,
            max_height,
            max_binning: 4,
            pixel_formats: vec![PixelFormat::Raw8, PixelFormat::Raw16],
            has_cooler: true,
            can_guide: true,
            is_color: false,
        }
    }

    /// Colour sensor that can also deliver interleaved RGB.
    pub fn color(max_width: u32, max_height: u32) -> Self {
        Self {
            pixel_formats: vec![
                PixelFormat::Raw8,
                PixelFormat::Raw16,
                PixelFormat::Y8,
                PixelFormat::Rgb24,
            ],
            is_color: true,
            ..Self::mono(max_width, max_height)
        }
    }

    /// Whether `format` is offered by this sensor.
    pub fn supports(&self, format: PixelFormat) -> bool {
        self.pixel_formats.contains(&format)
    }
}
